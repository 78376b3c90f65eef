//! Create-or-update resolution for entries of the update set.

use tracing::debug;

use edgehub_core::{ResourceSnapshot, VersionToken};
use edgehub_store::StoreError;

use crate::outcome::{ResourceError, ResourceOp};
use crate::pipeline::Pipeline;

impl Pipeline<'_> {
    /// Fetch the stored object to decide between `Create` and `Update`.
    ///
    /// The edge-reported token is never sent to the store: a create carries
    /// no token and an update starts from the token the fetch just returned.
    pub async fn create_or_update(&self, desired: &ResourceSnapshot) -> Result<ResourceOp, ResourceError> {
        let ns = desired.store_namespace();
        match self.call(self.store.get(ns, &desired.name)).await {
            Ok(current) => {
                debug!(
                    kind = %self.kind,
                    ns,
                    name = %desired.name,
                    edge_token = %desired.version_token,
                    store_token = %current.version_token,
                    "exists; updating"
                );
                let attempts = self.update_with_retry(desired, current.version_token).await?;
                Ok(ResourceOp::Updated { attempts })
            }
            Err(StoreError::NotFound) => {
                debug!(kind = %self.kind, ns, name = %desired.name, "absent; creating");
                self.call(self.store.create(&desired.rebased(VersionToken::default()))).await?;
                Ok(ResourceOp::Created)
            }
            Err(e) => Err(e.into()),
        }
    }
}

//! Delete applier.

use edgehub_core::ResourceSnapshot;
use edgehub_store::StoreError;

use crate::outcome::{ResourceError, ResourceOp};
use crate::pipeline::Pipeline;

impl Pipeline<'_> {
    /// Delete the snapshot's resource. Absence already is the desired end
    /// state, so NotFound counts as success.
    pub async fn delete(&self, snap: &ResourceSnapshot) -> Result<ResourceOp, ResourceError> {
        match self.call(self.store.delete(snap.store_namespace(), &snap.name)).await {
            Ok(()) => Ok(ResourceOp::Deleted),
            Err(StoreError::NotFound) => Ok(ResourceOp::AlreadyAbsent),
            Err(e) => Err(e.into()),
        }
    }
}

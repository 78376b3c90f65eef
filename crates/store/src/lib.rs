//! edgehub store: the `ResourceStore` capability the reconciler writes through.
//!
//! The reconciler never talks to a concrete backend. It is handed a
//! [`StoreSet`] holding one store per [`ResourceKind`] and only ever calls
//! Get/Create/Update/Delete by namespace and name.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use edgehub_core::{ResourceKind, ResourceSnapshot};

pub mod memory;

pub use memory::{Action, Fault, MemoryStore, Verb};

/// Store failures. `NotFound` and `Conflict` are expected signals that drive
/// reconciliation; everything else is a plain failure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("not found")]
    NotFound,
    #[error("version conflict")]
    Conflict,
    #[error("store call timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Backend(String),
}

impl StoreError {
    pub fn is_not_found(&self) -> bool { matches!(self, Self::NotFound) }
    pub fn is_conflict(&self) -> bool { matches!(self, Self::Conflict) }

    pub fn backend(msg: impl std::fmt::Display) -> Self { Self::Backend(msg.to_string()) }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Remote, optimistically-concurrent resource store.
///
/// `create` and `update` take the namespace from
/// [`ResourceSnapshot::store_namespace`]. `update` must reject a snapshot whose
/// version token does not match the stored one with [`StoreError::Conflict`].
#[async_trait::async_trait]
pub trait ResourceStore: Send + Sync {
    async fn get(&self, namespace: &str, name: &str) -> StoreResult<ResourceSnapshot>;
    async fn create(&self, snap: &ResourceSnapshot) -> StoreResult<()>;
    async fn update(&self, snap: &ResourceSnapshot) -> StoreResult<()>;
    async fn delete(&self, namespace: &str, name: &str) -> StoreResult<()>;
}

/// One store handle per resource kind.
#[derive(Clone)]
pub struct StoreSet {
    daemonsets: Arc<dyn ResourceStore>,
    deployments: Arc<dyn ResourceStore>,
}

impl StoreSet {
    pub fn new(daemonsets: Arc<dyn ResourceStore>, deployments: Arc<dyn ResourceStore>) -> Self {
        Self { daemonsets, deployments }
    }

    pub fn for_kind(&self, kind: ResourceKind) -> &Arc<dyn ResourceStore> {
        match kind {
            ResourceKind::DaemonSet => &self.daemonsets,
            ResourceKind::Deployment => &self.deployments,
        }
    }
}

impl std::fmt::Debug for StoreSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreSet").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_set_routes_by_kind() {
        let ds = Arc::new(MemoryStore::new());
        let dep = Arc::new(MemoryStore::new());
        ds.seed(ResourceSnapshot::new("ns", "only-ds"));
        let set = StoreSet::new(ds.clone(), dep.clone());
        assert!(set.for_kind(ResourceKind::DaemonSet).get("ns", "only-ds").await.is_ok());
        let err = set.for_kind(ResourceKind::Deployment).get("ns", "only-ds").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn error_predicates() {
        assert!(StoreError::NotFound.is_not_found());
        assert!(StoreError::Conflict.is_conflict());
        assert!(!StoreError::Timeout(Duration::from_secs(1)).is_conflict());
        assert_eq!(StoreError::backend("boom").to_string(), "boom");
    }
}

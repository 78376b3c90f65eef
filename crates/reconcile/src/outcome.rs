//! Per-resource and per-report results.

use edgehub_core::{DecodeError, ResourceKey, ResourceKind, ResourceSnapshot};
use edgehub_store::StoreError;
use serde::{Deserialize, Serialize};

/// What a successful reconciliation of one resource did.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ResourceOp {
    Created,
    /// `attempts` counts `Update` calls, conflicts included.
    Updated { attempts: u32 },
    Deleted,
    /// Delete of a resource the store did not have.
    AlreadyAbsent,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("update still conflicting after {attempts} attempts")]
    RetryExhausted { attempts: u32 },
}

/// Which set of the batch an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceOutcome {
    pub key: ResourceKey,
    pub phase: Phase,
    pub namespace: String,
    pub name: String,
    pub cluster: Option<String>,
    pub result: Result<ResourceOp, ResourceError>,
}

impl ResourceOutcome {
    pub fn new(key: ResourceKey, phase: Phase, snap: &ResourceSnapshot, result: Result<ResourceOp, ResourceError>) -> Self {
        Self {
            key,
            phase,
            namespace: snap.store_namespace().to_string(),
            name: snap.name.clone(),
            cluster: snap.cluster().map(str::to_string),
            result,
        }
    }

    pub fn is_ok(&self) -> bool { self.result.is_ok() }
}

/// Everything that happened while applying one report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportOutcome {
    pub kind: ResourceKind,
    pub updates: Vec<ResourceOutcome>,
    pub deletes: Vec<ResourceOutcome>,
}

impl ReportOutcome {
    pub fn new(kind: ResourceKind) -> Self {
        Self { kind, updates: Vec::new(), deletes: Vec::new() }
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.updates.iter().chain(self.deletes.iter())
    }

    pub fn failures(&self) -> impl Iterator<Item = &ResourceOutcome> {
        self.iter().filter(|o| !o.is_ok())
    }

    pub fn failure_count(&self) -> usize { self.failures().count() }

    pub fn total(&self) -> usize { self.updates.len() + self.deletes.len() }

    pub fn is_success(&self) -> bool { self.failure_count() == 0 }

    /// All-or-nothing view: any per-resource failure becomes an error.
    pub fn into_result(self) -> Result<Self, ReconcileError> {
        let failed = self.failure_count();
        if failed == 0 {
            Ok(self)
        } else {
            Err(ReconcileError::Partial { kind: self.kind, failed, total: self.total(), outcome: Box::new(self) })
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error("{failed} of {total} {kind} resources failed to reconcile")]
    Partial {
        kind: ResourceKind,
        failed: usize,
        total: usize,
        outcome: Box<ReportOutcome>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn outcome(name: &str, result: Result<ResourceOp, ResourceError>) -> ResourceOutcome {
        let snap = ResourceSnapshot::new("ns", name);
        ResourceOutcome::new(snap.key(), Phase::Update, &snap, result)
    }

    #[test]
    fn into_result_passes_clean_reports_through() {
        let mut r = ReportOutcome::new(ResourceKind::DaemonSet);
        r.updates.push(outcome("a", Ok(ResourceOp::Created)));
        assert!(r.clone().into_result().is_ok());
    }

    #[test]
    fn into_result_aggregates_failures() {
        let mut r = ReportOutcome::new(ResourceKind::Deployment);
        r.updates.push(outcome("a", Ok(ResourceOp::Updated { attempts: 1 })));
        r.updates.push(outcome("b", Err(ResourceError::RetryExhausted { attempts: 3 })));
        let err = r.into_result().unwrap_err();
        assert_eq!(err.to_string(), "1 of 2 deployment resources failed to reconcile");
    }

    #[test]
    fn ops_serialize_with_tag() {
        let v = serde_json::to_value(ResourceOp::Updated { attempts: 2 }).unwrap();
        assert_eq!(v, serde_json::json!({"op": "updated", "attempts": 2}));
        assert_eq!(serde_json::to_value(ResourceOp::AlreadyAbsent).unwrap(), serde_json::json!({"op": "already_absent"}));
    }
}

//! Per-kind reconciliation pipeline: update set through the resolver, then
//! delete set through the delete applier.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use metrics::counter;
use tracing::{debug, info, warn};

use edgehub_core::{ResourceKey, ResourceKind, ResourceSnapshot, StatusBatch};
use edgehub_store::{ResourceStore, StoreError, StoreResult};

use crate::config::ProcessorConfig;
use crate::outcome::{Phase, ReportOutcome, ResourceError, ResourceOp, ResourceOutcome};

pub struct Pipeline<'a> {
    pub(crate) kind: ResourceKind,
    pub(crate) store: &'a Arc<dyn ResourceStore>,
    pub(crate) config: &'a ProcessorConfig,
}

impl<'a> Pipeline<'a> {
    pub fn new(kind: ResourceKind, store: &'a Arc<dyn ResourceStore>, config: &'a ProcessorConfig) -> Self {
        Self { kind, store, config }
    }

    pub fn kind(&self) -> ResourceKind { self.kind }

    /// Apply a decoded batch. Per-resource failures are recorded in the
    /// outcome and never stop the remaining entries.
    ///
    /// The update set runs to completion before the delete set starts, so a
    /// key present in both ends up deleted.
    pub async fn apply(&self, batch: StatusBatch) -> ReportOutcome {
        let overlap = batch.overlapping_keys();
        if !overlap.is_empty() {
            warn!(kind = %self.kind, keys = ?overlap, "keys in both update and delete sets; delete is applied last");
        }
        let StatusBatch { update_map, del_map } = batch;
        let mut outcome = ReportOutcome::new(self.kind);
        outcome.updates = self.run_phase(Phase::Update, update_map).await;
        outcome.deletes = self.run_phase(Phase::Delete, del_map).await;
        info!(
            kind = %self.kind,
            updates = outcome.updates.len(),
            deletes = outcome.deletes.len(),
            failed = outcome.failure_count(),
            "report applied"
        );
        outcome
    }

    async fn run_phase(
        &self,
        phase: Phase,
        entries: impl IntoIterator<Item = (ResourceKey, ResourceSnapshot)>,
    ) -> Vec<ResourceOutcome> {
        let mut out: Vec<ResourceOutcome> = stream::iter(entries)
            .map(|(key, snap)| self.reconcile_one(phase, key, snap))
            .buffer_unordered(self.config.concurrency.max(1))
            .collect()
            .await;
        out.sort_by(|a, b| a.key.cmp(&b.key));
        out
    }

    async fn reconcile_one(&self, phase: Phase, key: ResourceKey, snap: ResourceSnapshot) -> ResourceOutcome {
        let expected = ResourceKey::from_parts(&snap.namespace, &snap.name);
        if expected != key {
            warn!(kind = %self.kind, key = %key, identity = %expected, "batch key disagrees with snapshot; using snapshot identity");
        }
        let result = match phase {
            Phase::Update => self.create_or_update(&snap).await,
            Phase::Delete => self.delete(&snap).await,
        };
        self.record(phase, &key, &snap, &result);
        ResourceOutcome::new(key, phase, &snap, result)
    }

    fn record(&self, phase: Phase, key: &ResourceKey, snap: &ResourceSnapshot, result: &Result<ResourceOp, ResourceError>) {
        let kind = self.kind.as_str();
        let cluster = snap.cluster().unwrap_or("-");
        match result {
            Ok(op) => {
                counter!("edgehub_resource_ops_total", 1u64, "kind" => kind, "op" => op_label(op));
                debug!(kind, key = %key, cluster, op = ?op, "resource reconciled");
            }
            Err(e) => {
                counter!("edgehub_resource_failures_total", 1u64, "kind" => kind, "phase" => phase_label(phase));
                warn!(kind, key = %key, cluster, phase = ?phase, error = %e, "resource failed to reconcile");
            }
        }
    }

    /// Run one store call under the configured deadline.
    pub(crate) async fn call<T, F>(&self, fut: F) -> StoreResult<T>
    where
        F: Future<Output = StoreResult<T>>,
    {
        with_deadline(self.config.store_timeout, fut).await
    }
}

pub(crate) async fn with_deadline<T, F>(deadline: Option<Duration>, fut: F) -> StoreResult<T>
where
    F: Future<Output = StoreResult<T>>,
{
    match deadline {
        None => fut.await,
        Some(d) => tokio::time::timeout(d, fut).await.unwrap_or(Err(StoreError::Timeout(d))),
    }
}

fn op_label(op: &ResourceOp) -> &'static str {
    match op {
        ResourceOp::Created => "created",
        ResourceOp::Updated { .. } => "updated",
        ResourceOp::Deleted => "deleted",
        ResourceOp::AlreadyAbsent => "already_absent",
    }
}

fn phase_label(phase: Phase) -> &'static str {
    match phase {
        Phase::Update => "update",
        Phase::Delete => "delete",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn deadline_turns_slow_calls_into_timeouts() {
        let slow = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok::<_, StoreError>(())
        };
        let err = with_deadline(Some(Duration::from_millis(10)), slow).await.unwrap_err();
        assert_eq!(err, StoreError::Timeout(Duration::from_millis(10)));
    }

    #[tokio::test]
    async fn no_deadline_passes_through() {
        let r = with_deadline(None, async { Err::<(), _>(StoreError::Conflict) }).await;
        assert_eq!(r, Err(StoreError::Conflict));
    }
}

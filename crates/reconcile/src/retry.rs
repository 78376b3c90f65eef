//! Conflict-retry updater.
//!
//! A compare-and-swap loop against the remote store:
//!
//! ```text
//! Attempt ──ok──────────────▶ Success
//!    │ conflict
//!    ▼
//! Refetch ──ok (fresh token)─▶ Attempt
//!    │ error
//!    ▼
//!  Fail ◀──── non-conflict error from Attempt, or attempt ceiling hit
//! ```
//!
//! Only the version token is replaced between attempts; the desired fields
//! of the snapshot are written exactly as reported.

use metrics::counter;
use tracing::debug;

use edgehub_core::{ResourceSnapshot, VersionToken};
use edgehub_store::StoreError;

use crate::outcome::ResourceError;
use crate::pipeline::Pipeline;

impl Pipeline<'_> {
    /// Write `desired` starting from `token`. Returns the number of `Update`
    /// calls it took.
    pub async fn update_with_retry(&self, desired: &ResourceSnapshot, token: VersionToken) -> Result<u32, ResourceError> {
        let ns = desired.store_namespace();
        let mut candidate = desired.rebased(token);
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.call(self.store.update(&candidate)).await {
                Ok(()) => return Ok(attempts),
                Err(StoreError::Conflict) => {
                    counter!("edgehub_update_conflicts_total", 1u64, "kind" => self.kind.as_str());
                    if let Some(max) = self.config.max_update_attempts {
                        if attempts >= max.get() {
                            return Err(ResourceError::RetryExhausted { attempts });
                        }
                    }
                    debug!(kind = %self.kind, ns, name = %desired.name, attempt = attempts, stale = %candidate.version_token, "update conflict; refetching");
                    if !self.config.conflict_backoff.is_zero() {
                        tokio::time::sleep(self.config.conflict_backoff).await;
                    }
                    // NotFound here means the object was deleted under us;
                    // that is a failure, not a reason to create it.
                    let fresh = self.call(self.store.get(ns, &desired.name)).await?;
                    candidate.version_token = fresh.version_token;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use edgehub_core::ResourceKind;
    use edgehub_store::{Action, Fault, MemoryStore, ResourceStore, Verb};

    use super::*;
    use crate::config::ProcessorConfig;

    fn seeded(token: &str) -> (Arc<MemoryStore>, Arc<dyn ResourceStore>) {
        let mem = Arc::new(MemoryStore::new());
        mem.seed(ResourceSnapshot::new("ns1", "foo").with_token(token));
        let store: Arc<dyn ResourceStore> = mem.clone();
        (mem, store)
    }

    #[tokio::test]
    async fn converges_after_n_conflicts_with_n_plus_one_updates() {
        for n in 0..5usize {
            let (mem, store) = seeded("4");
            for _ in 0..n {
                mem.inject(Verb::Update, Fault::ConcurrentWrite);
            }
            let cfg = ProcessorConfig::default();
            let p = Pipeline::new(ResourceKind::DaemonSet, &store, &cfg);
            let desired = ResourceSnapshot::new("ns1", "foo").with_token("1").with_label("edge-version", "11");

            let attempts = p.update_with_retry(&desired, "4".into()).await.expect("converges");
            assert_eq!(attempts as usize, n + 1);
            assert_eq!(mem.count(Verb::Update), n + 1);
            assert_eq!(mem.count(Verb::Get), n);
            assert_eq!(mem.object("ns1", "foo").unwrap().labels, desired.labels);
        }
    }

    #[tokio::test]
    async fn refetched_token_is_used_for_the_retry() {
        let (mem, store) = seeded("9");
        mem.inject(Verb::Update, Fault::ConcurrentWrite);
        let cfg = ProcessorConfig::default();
        let p = Pipeline::new(ResourceKind::DaemonSet, &store, &cfg);

        assert_eq!(p.update_with_retry(&ResourceSnapshot::new("ns1", "foo"), "9".into()).await, Ok(2));
        assert_eq!(
            mem.actions(),
            vec![Action::update("ns1", "foo", "9"), Action::get("ns1", "foo"), Action::update("ns1", "foo", "10")]
        );
    }

    #[tokio::test]
    async fn ceiling_surfaces_retry_exhausted() {
        let (mem, store) = seeded("1");
        for _ in 0..10 {
            mem.inject(Verb::Update, Fault::ConcurrentWrite);
        }
        let cfg = ProcessorConfig::default().with_max_update_attempts(Some(3));
        let p = Pipeline::new(ResourceKind::Deployment, &store, &cfg);

        let err = p.update_with_retry(&ResourceSnapshot::new("ns1", "foo"), "1".into()).await.unwrap_err();
        assert_eq!(err, ResourceError::RetryExhausted { attempts: 3 });
        assert_eq!(mem.count(Verb::Update), 3);
        assert_eq!(mem.count(Verb::Get), 2);
    }

    #[tokio::test]
    async fn unbounded_config_keeps_retrying_while_conflicts_last() {
        let (mem, store) = seeded("1");
        for _ in 0..40 {
            mem.inject(Verb::Update, Fault::ConcurrentWrite);
        }
        let cfg = ProcessorConfig::default().with_max_update_attempts(None);
        let p = Pipeline::new(ResourceKind::Deployment, &store, &cfg);

        assert_eq!(p.update_with_retry(&ResourceSnapshot::new("ns1", "foo"), "1".into()).await, Ok(41));
    }

    #[tokio::test]
    async fn non_conflict_error_is_not_retried() {
        let (mem, store) = seeded("1");
        mem.inject(Verb::Update, Fault::Error(StoreError::backend("forbidden")));
        let cfg = ProcessorConfig::default();
        let p = Pipeline::new(ResourceKind::DaemonSet, &store, &cfg);

        assert!(p.update_with_retry(&ResourceSnapshot::new("ns1", "foo"), "1".into()).await.is_err());
        assert_eq!(mem.actions(), vec![Action::update("ns1", "foo", "1")]);
    }

    #[tokio::test]
    async fn deletion_between_attempts_is_a_failure() {
        let (mem, store) = seeded("1");
        mem.inject(Verb::Update, Fault::Error(StoreError::Conflict));
        mem.inject(Verb::Get, Fault::Error(StoreError::NotFound));
        let cfg = ProcessorConfig::default();
        let p = Pipeline::new(ResourceKind::DaemonSet, &store, &cfg);

        let err = p.update_with_retry(&ResourceSnapshot::new("ns1", "foo"), "1".into()).await.unwrap_err();
        assert_eq!(err, ResourceError::Store(StoreError::NotFound));
        assert_eq!(mem.count(Verb::Create), 0);
    }

    #[tokio::test]
    async fn timed_out_update_is_not_retried() {
        let (mem, store) = seeded("1");
        mem.inject(Verb::Update, Fault::Delay(Duration::from_millis(200)));
        let cfg = ProcessorConfig::default().with_store_timeout(Some(Duration::from_millis(10)));
        let p = Pipeline::new(ResourceKind::DaemonSet, &store, &cfg);

        let err = p.update_with_retry(&ResourceSnapshot::new("ns1", "foo"), "1".into()).await.unwrap_err();
        assert_eq!(err, ResourceError::Store(StoreError::Timeout(Duration::from_millis(10))));
        assert_eq!(mem.count(Verb::Update), 1);
    }

    #[tokio::test]
    async fn backoff_is_slept_between_conflicts() {
        let (mem, store) = seeded("1");
        mem.inject(Verb::Update, Fault::ConcurrentWrite);
        let cfg = ProcessorConfig::default().with_conflict_backoff(Duration::from_millis(30));
        let p = Pipeline::new(ResourceKind::DaemonSet, &store, &cfg);

        let t0 = std::time::Instant::now();
        assert_eq!(p.update_with_retry(&ResourceSnapshot::new("ns1", "foo"), "1".into()).await, Ok(2));
        assert!(t0.elapsed() >= Duration::from_millis(30));
    }
}

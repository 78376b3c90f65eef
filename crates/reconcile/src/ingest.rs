//! Bounded ingest loop: raw reports in, outcomes out.
//!
//! Each report becomes its own task so a slow or conflicting report from one
//! edge cluster does not hold up the others.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use edgehub_core::DecodeError;

use crate::{Processor, ReportOutcome};

/// Result for the `seq`-th report received (1-based, in receive order).
#[derive(Debug)]
pub struct IngestResult {
    pub seq: u64,
    pub result: Result<ReportOutcome, DecodeError>,
}

/// Spawn the ingest loop. At most `cap` reports are processed at once; while
/// that many are in flight the loop stops receiving, so the queue fills and
/// senders wait. Dropping every sender drains in-flight reports and then
/// closes the result channel.
pub fn spawn_ingest(processor: Arc<Processor>, cap: usize) -> (mpsc::Sender<Vec<u8>>, mpsc::Receiver<IngestResult>) {
    let cap = cap.max(1);
    let (tx, mut rx) = mpsc::channel::<Vec<u8>>(cap);
    let (out_tx, out_rx) = mpsc::channel::<IngestResult>(cap);

    tokio::spawn(async move {
        let mut tasks = JoinSet::new();
        let mut seq: u64 = 0;
        loop {
            tokio::select! {
                maybe = rx.recv(), if tasks.len() < cap => {
                    match maybe {
                        Some(bytes) => {
                            seq += 1;
                            let p = Arc::clone(&processor);
                            let out = out_tx.clone();
                            tasks.spawn(async move {
                                let result = p.process(&bytes).await;
                                if out.send(IngestResult { seq, result }).await.is_err() {
                                    debug!(seq, "result receiver gone; outcome dropped");
                                }
                            });
                        }
                        None => {
                            debug!(in_flight = tasks.len(), "report channel closed; draining");
                            break;
                        }
                    }
                }
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(e) = joined {
                        warn!(error = %e, "report task failed");
                    }
                }
            }
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "report task failed");
            }
        }
        info!(reports = seq, "ingest loop stopped");
    });

    (tx, out_rx)
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::ProcessorConfig;
    use edgehub_core::{Report, ResourceKind, ResourceSnapshot, StatusBatch};
    use edgehub_store::{Fault, MemoryStore, StoreSet, Verb};

    fn report(name: &str) -> Vec<u8> {
        let mut batch = StatusBatch::default();
        batch.insert_update(ResourceSnapshot::new("ns", name));
        Report::wrap(ResourceKind::DaemonSet, &batch).unwrap().encode().unwrap()
    }

    #[tokio::test]
    async fn every_report_gets_a_result_and_channel_closes() {
        let ds = Arc::new(MemoryStore::new());
        let dep = Arc::new(MemoryStore::new());
        let p = Arc::new(Processor::new(StoreSet::new(ds.clone(), dep.clone()), ProcessorConfig::default()));
        let (tx, mut rx) = spawn_ingest(p, 4);

        for i in 0..3 {
            let mut batch = StatusBatch::default();
            batch.insert_update(ResourceSnapshot::new("ns", format!("ds-{i}")));
            tx.send(Report::wrap(ResourceKind::DaemonSet, &batch).unwrap().encode().unwrap()).await.unwrap();
        }
        tx.send(b"not json".to_vec()).await.unwrap();
        drop(tx);

        let mut results = Vec::new();
        while let Some(r) = rx.recv().await {
            results.push(r);
        }
        results.sort_by_key(|r| r.seq);
        assert_eq!(results.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![1, 2, 3, 4]);
        assert!(results[..3].iter().all(|r| r.result.as_ref().map(|o| o.is_success()).unwrap_or(false)));
        assert!(results[3].result.is_err());
        assert_eq!(ds.len(), 3);
    }

    #[tokio::test]
    async fn in_flight_reports_never_exceed_cap() {
        let ds = Arc::new(MemoryStore::new());
        for _ in 0..3 {
            ds.inject(Verb::Get, Fault::Delay(Duration::from_millis(300)));
        }
        let p = Arc::new(Processor::new(StoreSet::new(ds.clone(), Arc::new(MemoryStore::new())), ProcessorConfig::default()));
        let (tx, mut rx) = spawn_ingest(p, 1);

        // One report running, one waiting in the queue.
        let short = Duration::from_millis(100);
        assert!(tokio::time::timeout(short, tx.send(report("a"))).await.is_ok());
        assert!(tokio::time::timeout(short, tx.send(report("b"))).await.is_ok());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(ds.count(Verb::Get), 1);

        // Queue is full and the loop is not receiving: the sender waits.
        assert!(tokio::time::timeout(Duration::from_millis(50), tx.send(report("c"))).await.is_err());
        assert_eq!(ds.count(Verb::Get), 1);
        drop(tx);

        let mut seqs = Vec::new();
        while let Some(r) = rx.recv().await {
            assert!(r.result.as_ref().map(|o| o.is_success()).unwrap_or(false));
            seqs.push(r.seq);
        }
        seqs.sort();
        assert_eq!(seqs, vec![1, 2]);
        assert_eq!(ds.len(), 2);
    }
}

//! edgehub reconcile: applies edge status reports to the control-plane store.
//!
//! A report is decoded in full before anything touches the store, so a
//! malformed report never causes a partial write. Once decoded it is routed
//! by kind to a [`Pipeline`] which:
//!
//! - resolves every update-set entry to a `Create` (absent) or a
//!   conflict-retried `Update` (present),
//! - deletes every delete-set entry, treating NotFound as success.
//!
//! Per-resource failures are collected in a [`ReportOutcome`]; they do not
//! fail the report. Use [`ReportOutcome::into_result`] for all-or-nothing.
//!
//! The processor keeps no mutable state of its own and can be shared across
//! tasks handling reports from different edge clusters.

#![forbid(unsafe_code)]

use std::time::Instant;

use metrics::{counter, histogram};
use tracing::{debug, warn};

use edgehub_core::{DecodeError, Report, ResourceKind, StatusBatch};
use edgehub_store::StoreSet;

pub mod config;
mod delete;
pub mod ingest;
pub mod outcome;
pub mod pipeline;
mod resolve;
mod retry;

pub use config::ProcessorConfig;
pub use ingest::{spawn_ingest, IngestResult};
pub use outcome::{Phase, ReconcileError, ReportOutcome, ResourceError, ResourceOp, ResourceOutcome};
pub use pipeline::Pipeline;

pub struct Processor {
    stores: StoreSet,
    config: ProcessorConfig,
}

impl Processor {
    pub fn new(stores: StoreSet, config: ProcessorConfig) -> Self {
        Self { stores, config }
    }

    pub fn config(&self) -> &ProcessorConfig { &self.config }

    /// Decode raw report bytes and apply them.
    pub async fn process(&self, bytes: &[u8]) -> Result<ReportOutcome, DecodeError> {
        let report = Report::decode(bytes).map_err(|e| {
            counter!("edgehub_decode_errors_total", 1u64);
            warn!(error = %e, len = bytes.len(), "dropping undecodable report");
            e
        })?;
        self.process_report(&report).await
    }

    /// Decode the body of an already-parsed envelope and apply it.
    pub async fn process_report(&self, report: &Report) -> Result<ReportOutcome, DecodeError> {
        let batch = report.batch().map_err(|e| {
            counter!("edgehub_decode_errors_total", 1u64, "kind" => report.kind.as_str());
            warn!(kind = %report.kind, error = %e, "dropping report with malformed body");
            e
        })?;
        Ok(self.dispatch(report.kind, batch).await)
    }

    /// Apply an already-decoded batch with the pipeline for `kind`.
    pub async fn dispatch(&self, kind: ResourceKind, batch: StatusBatch) -> ReportOutcome {
        let t0 = Instant::now();
        counter!("edgehub_reports_total", 1u64, "kind" => kind.as_str());
        debug!(kind = %kind, updates = batch.update_map.len(), deletes = batch.del_map.len(), "dispatching report");
        let outcome = self.pipeline(kind).apply(batch).await;
        histogram!("edgehub_report_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "kind" => kind.as_str());
        outcome
    }

    pub fn pipeline(&self, kind: ResourceKind) -> Pipeline<'_> {
        Pipeline::new(kind, self.stores.for_kind(kind), &self.config)
    }
}

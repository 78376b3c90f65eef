use std::io::Read;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::{error, info, warn};

use edgehub_core::{Report, ResourceKind, StatusBatch};
use edgehub_reconcile::{spawn_ingest, Phase, Processor, ProcessorConfig, ReportOutcome, ResourceError, ResourceOp, ResourceOutcome};

#[derive(Parser, Debug)]
#[command(name = "edgehubctl", version, about = "Apply edge cluster status reports to the control plane")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Reconcile reports into the current kube context
    Apply {
        /// Report files ("-" for stdin). Reads stdin when omitted.
        files: Vec<PathBuf>,
        /// Update attempts per resource while conflicts persist (0 = unbounded)
        #[arg(long = "max-update-attempts")]
        max_update_attempts: Option<u32>,
        /// Deadline for each store call in milliseconds (0 = none)
        #[arg(long = "store-timeout-ms")]
        store_timeout_ms: Option<u64>,
        /// Pause between a version conflict and the re-fetch, in milliseconds
        #[arg(long = "conflict-backoff-ms")]
        conflict_backoff_ms: Option<u64>,
        /// Resources of one report reconciled at once
        #[arg(long = "concurrency")]
        concurrency: Option<usize>,
        /// Fail when any resource fails, not only on undecodable reports
        #[arg(long = "strict", action = ArgAction::SetTrue)]
        strict: bool,
    },
    /// Decode a report and print its batch without touching the cluster
    Inspect {
        /// Report file ("-" for stdin)
        file: PathBuf,
    },
    /// Wrap a status batch JSON into a report envelope
    Wrap {
        /// Resource kind tag: daemonset | deployment
        #[arg(long = "kind", value_parser = parse_kind)]
        kind: ResourceKind,
        /// Status batch file ("-" for stdin)
        file: PathBuf,
    },
}

fn parse_kind(s: &str) -> Result<ResourceKind, String> {
    ResourceKind::from_str(s).map_err(|e| e.to_string())
}

fn init_tracing() {
    let env = std::env::var("EDGEHUB_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("EDGEHUB_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid EDGEHUB_METRICS_ADDR; expected host:port");
        }
    }
}

fn read_input(path: &Path) -> Result<Vec<u8>> {
    if path.as_os_str() == "-" {
        let mut buf = Vec::new();
        std::io::stdin().read_to_end(&mut buf).context("reading stdin")?;
        Ok(buf)
    } else {
        std::fs::read(path).with_context(|| format!("reading {}", path.display()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Apply { files, max_update_attempts, store_timeout_ms, conflict_backoff_ms, concurrency, strict } => {
            let mut cfg = ProcessorConfig::from_env();
            if let Some(n) = max_update_attempts { cfg = cfg.with_max_update_attempts(Some(n)); }
            if let Some(ms) = store_timeout_ms { cfg = cfg.with_store_timeout((ms > 0).then(|| Duration::from_millis(ms))); }
            if let Some(ms) = conflict_backoff_ms { cfg = cfg.with_conflict_backoff(Duration::from_millis(ms)); }
            if let Some(n) = concurrency { cfg = cfg.with_concurrency(n); }
            let files = if files.is_empty() { vec![PathBuf::from("-")] } else { files };
            let inputs = files.iter().map(|f| read_input(f)).collect::<Result<Vec<_>>>()?;
            info!(reports = inputs.len(), config = ?cfg, "apply invoked");

            let stores = edgehub_kubehub::connect().await?;
            let processor = Arc::new(Processor::new(stores, cfg));
            let cap = std::env::var("EDGEHUB_QUEUE_CAP").ok().and_then(|s| s.parse::<usize>().ok()).unwrap_or(64);
            let (tx, mut rx) = spawn_ingest(processor, cap);
            let feeder = tokio::spawn(async move {
                for bytes in inputs {
                    if tx.send(bytes).await.is_err() { break; }
                }
            });

            let mut results = Vec::new();
            while let Some(r) = rx.recv().await { results.push(r); }
            let _ = feeder.await;
            results.sort_by_key(|r| r.seq);

            let mut decode_failures = 0usize;
            let mut resource_failures = 0usize;
            let mut rows = Vec::new();
            for r in results {
                let source = files.get((r.seq - 1) as usize).map(|p| p.display().to_string()).unwrap_or_default();
                match r.result {
                    Ok(outcome) => {
                        resource_failures += outcome.failure_count();
                        rows.extend(rows_for(&source, &outcome));
                    }
                    Err(e) => {
                        decode_failures += 1;
                        error!(source = %source, error = %e, "report rejected");
                        rows.push(Row { source: source.clone(), kind: None, key: None, phase: None, cluster: None, result: format!("rejected: {}", e), ok: false });
                    }
                }
            }
            print_rows(cli.output, &rows)?;

            if decode_failures > 0 {
                bail!("{} report(s) could not be decoded", decode_failures);
            }
            if resource_failures > 0 {
                warn!(failed = resource_failures, "some resources failed to reconcile");
                if strict { bail!("{} resource(s) failed to reconcile", resource_failures); }
            }
        }
        Commands::Inspect { file } => {
            let bytes = read_input(&file)?;
            let report = Report::decode(&bytes)?;
            let batch = report.batch()?;
            match cli.output {
                Output::Human => {
                    println!("kind: {}", report.kind);
                    println!("updates: {}  deletes: {}", batch.update_map.len(), batch.del_map.len());
                    for (key, s) in batch.update_map.iter() {
                        println!("  ~ {:<40} token={} cluster={}", key, s.version_token, s.cluster().unwrap_or("-"));
                    }
                    for (key, s) in batch.del_map.iter() {
                        println!("  - {:<40} token={} cluster={}", key, s.version_token, s.cluster().unwrap_or("-"));
                    }
                    let overlap = batch.overlapping_keys();
                    if !overlap.is_empty() {
                        println!("overlapping keys (delete applied last): {}", overlap.iter().map(|k| k.as_str()).collect::<Vec<_>>().join(", "));
                    }
                }
                Output::Json => {
                    #[derive(Serialize)]
                    struct Inspected<'a> { kind: ResourceKind, batch: &'a StatusBatch }
                    println!("{}", serde_json::to_string_pretty(&Inspected { kind: report.kind, batch: &batch })?);
                }
            }
        }
        Commands::Wrap { kind, file } => {
            let bytes = read_input(&file)?;
            let batch = StatusBatch::decode(kind, &bytes)?;
            let report = Report::wrap(kind, &batch).map_err(|e| anyhow!("encoding report: {}", e))?;
            let out = report.encode()?;
            println!("{}", String::from_utf8(out)?);
        }
    }

    Ok(())
}

#[derive(Debug, Serialize)]
struct Row {
    source: String,
    kind: Option<ResourceKind>,
    key: Option<String>,
    phase: Option<Phase>,
    cluster: Option<String>,
    result: String,
    ok: bool,
}

fn rows_for(source: &str, outcome: &ReportOutcome) -> Vec<Row> {
    outcome
        .iter()
        .map(|o: &ResourceOutcome| Row {
            source: source.to_string(),
            kind: Some(outcome.kind),
            key: Some(format!("{}/{}", o.namespace, o.name)),
            phase: Some(o.phase),
            cluster: o.cluster.clone(),
            result: render_result(&o.result),
            ok: o.is_ok(),
        })
        .collect()
}

fn render_result(result: &Result<ResourceOp, ResourceError>) -> String {
    match result {
        Ok(ResourceOp::Created) => "created".to_string(),
        Ok(ResourceOp::Updated { attempts: 1 }) => "updated".to_string(),
        Ok(ResourceOp::Updated { attempts }) => format!("updated ({} attempts)", attempts),
        Ok(ResourceOp::Deleted) => "deleted".to_string(),
        Ok(ResourceOp::AlreadyAbsent) => "deleted (already absent)".to_string(),
        Err(e) => format!("failed: {}", e),
    }
}

fn print_rows(output: Output, rows: &[Row]) -> Result<()> {
    match output {
        Output::Human => {
            println!("{:<11} {:<40} {:<7} {:<12} RESULT", "KIND", "RESOURCE", "PHASE", "CLUSTER");
            for r in rows {
                let kind = r.kind.map(|k| k.as_str()).unwrap_or("-");
                let key = r.key.clone().unwrap_or_else(|| r.source.clone());
                let phase = match r.phase { Some(Phase::Update) => "update", Some(Phase::Delete) => "delete", None => "-" };
                println!("{:<11} {:<40} {:<7} {:<12} {}", kind, key, phase, r.cluster.as_deref().unwrap_or("-"), r.result);
            }
        }
        Output::Json => println!("{}", serde_json::to_string_pretty(rows)?),
    }
    Ok(())
}

//! quillforge operator CLI: config checks, store inspection and simulated runs.

mod cli;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use quillforge::checkpoint::{CheckpointStore, FileBackend, KvBackend, MemoryBackend};
use quillforge::external::SinkError;
use quillforge::sim::{InMemoryLedger, SimulatedGenerator};
use quillforge::{
    Collaborators, GenerationRequest, Orchestrator, OrchestratorConfig, ProgressEvent,
    ProgressSink,
};

use cli::{Cli, Command};

type CliResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Advances a terminal progress bar as jobs reach a terminal status.
struct ProgressBarSink {
    bar: ProgressBar,
}

impl ProgressBarSink {
    fn new(quiet: bool) -> Self {
        let bar = if quiet {
            ProgressBar::hidden()
        } else {
            ProgressBar::new(0)
        };
        if let Ok(style) =
            ProgressStyle::default_bar().template("{spinner} [{bar:30}] {pos}/{len} {msg}")
        {
            bar.set_style(style);
        }
        Self { bar }
    }
}

#[async_trait]
impl ProgressSink for ProgressBarSink {
    async fn emit(&self, event: &ProgressEvent) -> Result<(), SinkError> {
        if event.status.is_terminal() {
            self.bar.inc(1);
        }
        self.bar.set_message(format!(
            "{} {} {:.0}%",
            event.job_id,
            event.status,
            event.progress * 100.0
        ));
        Ok(())
    }
}

#[tokio::main]
async fn main() -> CliResult {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig { config } => check_config(config.as_deref()),
        Command::Inspect { store } => inspect(&store).await,
        Command::Simulate {
            requests,
            config,
            store,
            transient_failures,
            budget,
            quiet,
        } => {
            simulate(
                &requests,
                config.as_deref(),
                store.as_deref(),
                transient_failures,
                budget,
                quiet,
            )
            .await
        }
    }
}

fn check_config(path: Option<&Path>) -> CliResult {
    let config = OrchestratorConfig::load(path)?;
    print!("{}", config.to_toml()?);
    Ok(())
}

async fn inspect(dir: &Path) -> CliResult {
    if !dir.is_dir() {
        return Err(format!("store directory {} does not exist", dir.display()).into());
    }
    let store = CheckpointStore::new(Arc::new(FileBackend::new(dir)?));
    let records = store.load_records().await?;
    let checkpoints = store.load_checkpoints().await?;

    let report = json!({
        "records": records.iter().map(|r| json!({
            "job_id": r.job.id,
            "batch_id": r.job.batch_id,
            "status": r.job.status,
            "attempts": r.job.attempts,
            "priority": r.job.priority,
            "charge_issued": r.charge_issued,
            "last_error": r.job.last_error,
            "recorded_at": r.recorded_at,
        })).collect::<Vec<_>>(),
        "checkpoints": checkpoints.iter().map(|c| json!({
            "job_id": c.job_id,
            "stage": c.stage,
            "tokens_used": c.tokens_used,
            "output_chars": c.partial_output.chars().count(),
            "last_saved": c.last_saved,
        })).collect::<Vec<_>>(),
    });
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

async fn simulate(
    requests_path: &Path,
    config_path: Option<&Path>,
    store_dir: Option<&Path>,
    transient_failures: u32,
    budget: u64,
    quiet: bool,
) -> CliResult {
    let config = OrchestratorConfig::load(config_path)?;
    let requests: Vec<GenerationRequest> =
        serde_json::from_str(&std::fs::read_to_string(requests_path)?)?;

    let backend: Arc<dyn KvBackend> = match store_dir {
        Some(dir) => Arc::new(FileBackend::new(dir)?),
        None => Arc::new(MemoryBackend::new()),
    };
    let sink = Arc::new(ProgressBarSink::new(quiet));
    let bar = sink.bar.clone();

    let orchestrator = Orchestrator::start(
        config,
        Collaborators {
            generator: Arc::new(
                SimulatedGenerator::new().with_transient_failures(transient_failures),
            ),
            ledger: Arc::new(InMemoryLedger::new().with_default_budget(budget)),
            sink,
            store: Arc::new(CheckpointStore::new(backend)),
        },
    )?;

    let recovery = orchestrator.recover().await?;
    let submission = orchestrator.submit_batch(requests).await;
    bar.set_length((submission.accepted().len() + recovery.resumed.len()) as u64);

    for batch_id in &recovery.batches {
        orchestrator.wait_for_batch(*batch_id).await;
    }
    let progress = if submission.accepted().is_empty() {
        None
    } else {
        orchestrator.wait_for_batch(submission.batch_id).await
    };
    orchestrator.shutdown().await;
    bar.finish_and_clear();

    let summary = json!({
        "recovery": recovery,
        "submission": submission,
        "progress": progress,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

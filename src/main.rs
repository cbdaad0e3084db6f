//! callsift CLI entry point.
//!
//! Provides `run`, `status`, `audit` and `verify` subcommands for processing
//! the transcript source, inspecting the checkpoint, re-running the
//! integrity audit and gating backup deletion.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use callsift::audit::IntegrityAuditor;
use callsift::checkpoint::{BackupVerdict, CallStatus, CheckpointError, CheckpointStore};
use callsift::config::Config;
use callsift::credentials::resolve_api_key;
use callsift::gateway::LlmGateway;
use callsift::pipeline::{self, ExitStatus, PipelineContext, PipelineError, RunSummary};
use callsift::providers::openai::OpenAiProvider;
use callsift::transcript::SourceSnapshot;

/// callsift: analyze call transcripts without leaking customer data.
#[derive(Parser)]
#[command(name = "callsift", version, about)]
struct Cli {
    /// Config file (default: `$CALLSIFT_CONFIG` or `./callsift.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Process the transcript source until settled, then audit.
    Run,
    /// Print per-status counts from the checkpoint.
    Status,
    /// Re-run the integrity audit over the current checkpoint.
    Audit,
    /// Verify the checkpoint and delete the backup if it passes.
    Verify,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run => handle_run(cli.config).await,
        Command::Status => handle_status(cli.config),
        Command::Audit => handle_audit(cli.config),
        Command::Verify => handle_verify(cli.config),
    };

    match result {
        Ok(status) => ExitCode::from(status.code()),
        Err(err) => {
            error!(error = %format!("{err:#}"), "command failed");
            eprintln!("error: {err:#}");
            ExitCode::from(classify_error(&err).code())
        }
    }
}

fn classify_error(err: &anyhow::Error) -> ExitStatus {
    let corrupt = err
        .downcast_ref::<PipelineError>()
        .is_some_and(PipelineError::is_corrupt_state)
        || matches!(
            err.downcast_ref::<CheckpointError>(),
            Some(CheckpointError::CorruptState { .. })
        );
    if corrupt {
        ExitStatus::CorruptState
    } else {
        ExitStatus::Fatal
    }
}

/// Run cycles, finalize, audit and summarize.
async fn handle_run(config_path: Option<PathBuf>) -> anyhow::Result<ExitStatus> {
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    let _logging_guard = callsift::logging::init_production(&config.paths.logs_dir)?;

    let api_key = resolve_api_key(&config.paths.env_file, &config.model.api_key_env, |key| {
        std::env::var(key).ok()
    })?;
    let provider = OpenAiProvider::new(
        config.model.base_url.clone(),
        config.model.model.clone(),
        api_key,
        Duration::from_secs(config.model.timeout_secs),
    )
    .context("failed to build model provider")?;
    info!(model = %config.model.model, endpoint = %config.model.base_url, "provider ready");

    let gateway = Arc::new(LlmGateway::new(
        Arc::new(provider),
        config.model.max_tokens,
        chrono::Local::now().date_naive(),
    ));
    let (ctx, loaded) = PipelineContext::open(config, gateway)?;
    if loaded.orphaned_temp {
        warn!("previous run was interrupted mid-commit");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received, finishing in-flight commits");
            let _ = shutdown_tx.send(true);
        }
    });

    let report = pipeline::run(&ctx, shutdown_rx).await?;

    let audit = IntegrityAuditor::default().audit(&report.states, &report.snapshot);
    audit
        .write(&ctx.config.paths.audit_report)
        .context("failed to write audit report")?;

    let summary = RunSummary::from_states(&report.states, &report.snapshot.ids())
        .with_audit(&audit.summary);
    info!(
        run_id = %report.run_id,
        cycles = report.cycles,
        stop = ?report.stop,
        backup = ?report.backup,
        %summary,
        "run finished"
    );
    println!("{summary}");
    Ok(summary.exit_status())
}

/// Print per-status counts.
fn handle_status(config_path: Option<PathBuf>) -> anyhow::Result<ExitStatus> {
    callsift::logging::init_cli();
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    let outcome = CheckpointStore::new(&config.paths.checkpoint).load()?;

    let summary = RunSummary::from_states(&outcome.states, &Default::default());
    let transient = outcome
        .states
        .values()
        .filter(|s| s.status == CallStatus::Failed && s.needs_work())
        .count();

    println!("checkpoint: {}", config.paths.checkpoint.display());
    println!("source:     {:?}", outcome.source);
    println!("done:       {}", summary.done);
    println!("failed:     {} ({transient} retryable)", summary.failed);
    println!("pending:    {}", summary.pending);
    if outcome.orphaned_temp {
        println!("note:       orphaned temp file from an interrupted commit");
    }
    Ok(ExitStatus::Clean)
}

/// Audit the checkpoint against the current source and write the report.
fn handle_audit(config_path: Option<PathBuf>) -> anyhow::Result<ExitStatus> {
    callsift::logging::init_cli();
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    let outcome = CheckpointStore::new(&config.paths.checkpoint).load()?;
    let snapshot = SourceSnapshot::load(&config.paths.source)
        .context("failed to read transcript source")?;

    let report = IntegrityAuditor::default().audit(&outcome.states, &snapshot);
    report
        .write(&config.paths.audit_report)
        .context("failed to write audit report")?;
    println!(
        "{}",
        serde_json::to_string_pretty(&report.summary).context("failed to render summary")?
    );

    let summary =
        RunSummary::from_states(&outcome.states, &snapshot.ids()).with_audit(&report.summary);
    Ok(summary.exit_status())
}

/// Health-check the primary and prune the backup.
fn handle_verify(config_path: Option<PathBuf>) -> anyhow::Result<ExitStatus> {
    callsift::logging::init_cli();
    let config = Config::load(config_path.as_deref()).context("failed to load configuration")?;
    let snapshot = SourceSnapshot::load(&config.paths.source)
        .context("failed to read transcript source")?;

    let verdict =
        CheckpointStore::new(&config.paths.checkpoint).verify_and_prune_backup(&snapshot.ids())?;
    match &verdict {
        BackupVerdict::Pruned => println!("verified: backup deleted"),
        BackupVerdict::NoBackup => println!("verified: no backup present"),
        BackupVerdict::Retained { reason } => println!("verification failed: {reason}"),
    }
    Ok(match verdict {
        BackupVerdict::Retained { .. } => ExitStatus::Incomplete,
        BackupVerdict::Pruned | BackupVerdict::NoBackup => ExitStatus::Clean,
    })
}

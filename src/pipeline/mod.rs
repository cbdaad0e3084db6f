//! Cycle orchestration: source re-scan, concurrent analysis, per-item commits.
//!
//! Each cycle re-reads the transcript source, reconciles it with the ledger
//! and dispatches every call that still needs work. Per call:
//!
//! tokenize → admit → analyze → release → rehydrate → commit
//!
//! Cycles repeat until nothing is left to do, a cycle makes no progress, the
//! source is empty, `max_cycles` is reached or shutdown is requested.

pub mod ledger;

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::audit::AuditSummary;
use crate::checkpoint::{
    BackupVerdict, CallState, CallStatus, CheckpointError, CheckpointStore, FailureKind,
    LoadOutcome, StateMap,
};
use crate::config::{Config, RetryConfig};
use crate::gateway::{AnalysisGateway, AnalysisRequest};
use crate::scheduler::{SchedulerError, ThrottleScheduler};
use crate::transcript::{SourceError, SourceSnapshot, TranscriptRecord};
use crate::vault::{Category, Vault};

pub use ledger::Ledger;

/// Errors that abort a run.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// Checkpoint load or commit failed.
    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    /// The transcript source could not be read.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// The scheduler rejected its configuration.
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    /// A state update named a call the ledger does not track.
    #[error("call {0} is not tracked by the ledger")]
    UnknownCall(String),

    /// A worker task panicked or was cancelled.
    #[error("worker task failed: {0}")]
    Join(String),
}

impl PipelineError {
    /// Whether the run stopped because no usable checkpoint exists.
    pub fn is_corrupt_state(&self) -> bool {
        matches!(self, Self::Checkpoint(CheckpointError::CorruptState { .. }))
    }
}

/// Everything the orchestrator needs, passed explicitly.
#[derive(Clone)]
pub struct PipelineContext {
    /// Validated configuration.
    pub config: Arc<Config>,
    /// Admission control for gateway calls.
    pub scheduler: Arc<ThrottleScheduler>,
    /// Analysis backend.
    pub gateway: Arc<dyn AnalysisGateway>,
    /// Call states and their checkpoint.
    pub ledger: Arc<Ledger>,
}

impl PipelineContext {
    /// Load the checkpoint and assemble a context around `gateway`.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::Checkpoint`] when the checkpoint is corrupt
    /// or unreadable, or [`PipelineError::Scheduler`] for invalid limits.
    pub fn open(
        config: Config,
        gateway: Arc<dyn AnalysisGateway>,
    ) -> Result<(Self, LoadOutcome), PipelineError> {
        let store = CheckpointStore::new(config.paths.checkpoint.clone());
        let mut outcome = store.load()?;
        let scheduler = ThrottleScheduler::new(&config.scheduler)?;
        let ledger = Ledger::new(store, std::mem::take(&mut outcome.states));
        let context = Self {
            config: Arc::new(config),
            scheduler: Arc::new(scheduler),
            gateway,
            ledger: Arc::new(ledger),
        };
        Ok((context, outcome))
    }
}

/// Why the cycle loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    /// No present transcript needs work.
    Settled,
    /// A whole cycle finished without completing any call.
    NoProgress,
    /// The source holds no transcripts.
    SourceEmpty,
    /// The source became unreadable after the first cycle.
    SourceUnavailable,
    /// `max_cycles` cycles ran.
    MaxCycles,
    /// Shutdown was requested.
    Shutdown,
}

/// Result of [`run`].
#[derive(Debug)]
pub struct RunReport {
    /// Correlation id for this run's log events.
    pub run_id: Uuid,
    /// Cycles that dispatched work.
    pub cycles: u32,
    /// Why the loop ended.
    pub stop: StopCause,
    /// Last successfully read source.
    pub snapshot: SourceSnapshot,
    /// Final call states.
    pub states: StateMap,
    /// Backup health-check result, when every call finished.
    pub backup: Option<BackupVerdict>,
}

/// Terminal outcome of one call within a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemOutcome {
    Done,
    Failed(FailureKind),
    Abandoned,
}

/// Run cycles until the source is settled, then gate backup deletion on the
/// final health check.
///
/// Setting `shutdown` to `true` stops admitting work and abandons in-flight
/// gateway calls; commits already underway finish.
///
/// # Errors
///
/// Returns [`PipelineError`] if the first source read fails or a checkpoint
/// commit fails.
pub async fn run(
    ctx: &PipelineContext,
    shutdown: watch::Receiver<bool>,
) -> Result<RunReport, PipelineError> {
    let run_id = Uuid::new_v4();
    let span = info_span!("run", %run_id);
    run_cycles(ctx, shutdown, run_id).instrument(span).await
}

async fn run_cycles(
    ctx: &PipelineContext,
    shutdown: watch::Receiver<bool>,
    run_id: Uuid,
) -> Result<RunReport, PipelineError> {
    let source_path = ctx.config.paths.source.clone();
    let max_cycles = ctx.config.pipeline.max_cycles;
    let mut snapshot = SourceSnapshot::default();
    let mut cycles: u32 = 0;
    let mut first_scan = true;

    let stop = loop {
        if *shutdown.borrow() {
            break StopCause::Shutdown;
        }

        snapshot = match SourceSnapshot::load(&source_path) {
            Ok(loaded) => loaded,
            Err(err) if first_scan => return Err(err.into()),
            Err(err) => {
                warn!(error = %err, "transcript source unreadable, stopping");
                break StopCause::SourceUnavailable;
            }
        };
        first_scan = false;

        if snapshot.is_empty() {
            info!(source = %source_path.display(), "source is empty, stopping");
            break StopCause::SourceEmpty;
        }

        let changes = snapshot.diff(&ctx.ledger.snapshot().await);
        info!(
            added = changes.added.len(),
            modified = changes.modified.len(),
            removed = changes.removed.len(),
            unchanged = changes.unchanged.len(),
            "source scanned"
        );
        ctx.ledger
            .apply_changes(&snapshot, &changes, ctx.config.pipeline.removed_transcripts)
            .await?;

        let states = ctx.ledger.snapshot().await;
        let work: Vec<TranscriptRecord> = snapshot
            .records()
            .filter(|r| states.get(&r.call_id).is_some_and(CallState::needs_work))
            .cloned()
            .collect();
        if work.is_empty() {
            info!("all present transcripts settled");
            break StopCause::Settled;
        }
        if cycles >= max_cycles {
            warn!(remaining = work.len(), max_cycles, "cycle limit reached");
            break StopCause::MaxCycles;
        }
        cycles = cycles.saturating_add(1);

        let done_before = snapshot
            .records()
            .filter(|r| {
                states
                    .get(&r.call_id)
                    .is_some_and(|s| s.status == CallStatus::Done)
            })
            .count();
        info!(cycle = cycles, queued = work.len(), "cycle started");
        let progress = run_cycle(ctx, work, snapshot.len(), done_before, &shutdown).await?;

        if *shutdown.borrow() {
            break StopCause::Shutdown;
        }
        if progress == 0 {
            warn!(cycle = cycles, "cycle completed no calls, stopping");
            break StopCause::NoProgress;
        }
    };

    let states = ctx.ledger.snapshot().await;
    let backup = finalize(ctx, &snapshot, &states).await?;

    Ok(RunReport {
        run_id,
        cycles,
        stop,
        snapshot,
        states,
        backup,
    })
}

/// Delete the backup only when every present call is done and the primary
/// verifies.
async fn finalize(
    ctx: &PipelineContext,
    snapshot: &SourceSnapshot,
    states: &StateMap,
) -> Result<Option<BackupVerdict>, PipelineError> {
    let ids = snapshot.ids();
    let done = ids
        .iter()
        .filter(|id| {
            states
                .get(*id)
                .is_some_and(|s| s.status == CallStatus::Done)
        })
        .count();

    if ids.is_empty() || done != ids.len() {
        warn!(done, total = ids.len(), "incomplete run, keeping backup");
        return Ok(None);
    }

    info!(total = ids.len(), "all calls done, running final health check");
    let verdict = ctx.ledger.verify_and_prune_backup(ids).await?;
    Ok(Some(verdict))
}

async fn run_cycle(
    ctx: &PipelineContext,
    work: Vec<TranscriptRecord>,
    total: usize,
    done_before: usize,
    shutdown: &watch::Receiver<bool>,
) -> Result<usize, PipelineError> {
    let mut tasks = JoinSet::new();
    for record in work {
        let span = info_span!("call", call_id = %record.call_id);
        tasks.spawn(process_item(ctx.clone(), record, shutdown.clone()).instrument(span));
    }

    let mut completed = done_before;
    let mut progress: usize = 0;
    while let Some(joined) = tasks.join_next().await {
        let (call_id, outcome) = joined.map_err(|e| PipelineError::Join(e.to_string()))??;
        match outcome {
            ItemOutcome::Done => {
                completed = completed.saturating_add(1);
                progress = progress.saturating_add(1);
                info!(call_id = %call_id, "[{completed}/{total}] call analyzed");
            }
            ItemOutcome::Failed(kind) => {
                warn!(call_id = %call_id, kind = ?kind, "call failed");
            }
            ItemOutcome::Abandoned => {
                debug!(call_id = %call_id, "call abandoned");
            }
        }
    }
    Ok(progress)
}

async fn process_item(
    ctx: PipelineContext,
    record: TranscriptRecord,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(String, ItemOutcome), PipelineError> {
    let call_id = record.call_id.clone();
    let extra_names = ctx
        .config
        .vault
        .known_names
        .iter()
        .map(|name| (Category::Person, name.clone()));
    let mut vault = Vault::with_known_values(record.known_values().into_iter().chain(extra_names));
    let tokenized = vault.tokenize(&record.transcript);
    debug!(redacted = tokenized.added.len(), "transcript tokenized");

    let request = AnalysisRequest {
        call_id: call_id.clone(),
        tokenized_transcript: tokenized.text,
    };
    let retry = &ctx.config.retry;
    let mut attempt: u32 = 0;

    loop {
        attempt = attempt.saturating_add(1);

        let permit = tokio::select! {
            biased;
            () = shutdown_requested(&mut shutdown) => return Ok((call_id, ItemOutcome::Abandoned)),
            admitted = ctx.scheduler.admit() => match admitted {
                Ok(permit) => permit,
                Err(SchedulerError::Closed) => return Ok((call_id, ItemOutcome::Abandoned)),
                Err(err) => return Err(err.into()),
            },
        };
        ctx.ledger.mark(&call_id, CallState::begin_attempt).await;

        let reply = tokio::select! {
            biased;
            () = shutdown_requested(&mut shutdown) => {
                let reserved = permit.reserved_tokens();
                ctx.scheduler.release(permit, reserved);
                info!("shutdown requested, abandoning in-flight call");
                return Ok((call_id, ItemOutcome::Abandoned));
            }
            reply = ctx.gateway.analyze(request.clone()) => reply,
        };

        match reply {
            Ok(reply) => {
                let used = reply.tokens_used.unwrap_or(permit.reserved_tokens());
                ctx.scheduler.release(permit, used);

                let outcome = match vault.rehydrate_value(&reply.analysis) {
                    Ok(result) => {
                        ctx.ledger
                            .commit_outcome(&call_id, |state| state.complete(result))
                            .await?;
                        ItemOutcome::Done
                    }
                    Err(err) => {
                        fail_terminally(&ctx, &call_id, FailureKind::VaultToken, err.to_string())
                            .await?
                    }
                };
                return Ok((call_id, outcome));
            }
            Err(err) => {
                let reserved = permit.reserved_tokens();
                ctx.scheduler.release(permit, reserved);

                if err.is_transient() && attempt < retry.max_attempts {
                    let delay = backoff_delay(attempt, retry);
                    warn!(
                        attempt,
                        delay_secs = delay.as_secs(),
                        error = %err,
                        "transient gateway failure, retrying"
                    );
                    ctx.ledger
                        .mark(&call_id, |state| state.retry_later(err.to_string()))
                        .await;
                    tokio::select! {
                        biased;
                        () = shutdown_requested(&mut shutdown) => {
                            return Ok((call_id, ItemOutcome::Abandoned));
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                    continue;
                }

                let kind = if err.is_transient() {
                    FailureKind::Transient
                } else {
                    FailureKind::Fatal
                };
                let outcome = fail_terminally(&ctx, &call_id, kind, err.to_string()).await?;
                return Ok((call_id, outcome));
            }
        }
    }
}

async fn fail_terminally(
    ctx: &PipelineContext,
    call_id: &str,
    kind: FailureKind,
    reason: String,
) -> Result<ItemOutcome, PipelineError> {
    append_dead_letter(ctx, call_id, kind, &reason).await;
    ctx.ledger
        .commit_outcome(call_id, |state| state.fail(kind, reason))
        .await?;
    Ok(ItemOutcome::Failed(kind))
}

/// Append one line to the dead-letter log. Failures are logged, not raised.
async fn append_dead_letter(ctx: &PipelineContext, call_id: &str, kind: FailureKind, reason: &str) {
    let path = ctx.config.paths.dead_letter_log();
    let line = format!(
        "{} {call_id} [{kind:?}] {reason}\n",
        Utc::now().to_rfc3339()
    );

    let result = async {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }
    .await;

    if let Err(err) = result {
        warn!(path = %path.display(), error = %err, "failed to append to dead-letter log");
    }
}

/// Exponential backoff: `2^attempt` seconds clamped to the configured range.
pub fn backoff_delay(attempt: u32, retry: &RetryConfig) -> Duration {
    let exp = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
    Duration::from_secs(exp.max(retry.backoff_min_secs).min(retry.backoff_max_secs))
}

async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        // Sender gone: nobody can request shutdown any more.
        std::future::pending::<()>().await;
    }
}

/// Process exit status for a finished command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Every call done and the audit found nothing fabricated.
    Clean,
    /// Some calls failed or are still pending.
    Incomplete,
    /// The checkpoint could not be recovered.
    CorruptState,
    /// Every call done, but the audit flagged fabricated identifiers.
    Fabricated,
    /// Configuration, I/O or other fatal error.
    Fatal,
}

impl ExitStatus {
    /// Numeric process exit code.
    pub fn code(self) -> u8 {
        match self {
            Self::Clean => 0,
            Self::Incomplete => 1,
            Self::CorruptState => 2,
            Self::Fabricated => 3,
            Self::Fatal => 4,
        }
    }
}

/// Counts printed at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Calls with a committed result.
    pub done: usize,
    /// Calls that failed terminally.
    pub failed: usize,
    /// Calls still pending (including abandoned in-flight calls).
    pub pending: usize,
    /// Audit claims confirmed by the transcript.
    pub consistent: usize,
    /// Audit claims that could not be checked.
    pub unverifiable: usize,
    /// Audit claims absent from the transcript.
    pub fabricated: usize,
}

impl RunSummary {
    /// Count statuses for `ids`, or for every state when `ids` is empty.
    ///
    /// Ids with no state yet count as pending.
    pub fn from_states(states: &StateMap, ids: &BTreeSet<String>) -> Self {
        let mut summary = Self::default();
        let keys: Vec<&String> = if ids.is_empty() {
            states.keys().collect()
        } else {
            ids.iter().collect()
        };
        for id in keys {
            let counter = match states.get(id).map(|s| s.status) {
                Some(CallStatus::Done) => &mut summary.done,
                Some(CallStatus::Failed) => &mut summary.failed,
                Some(CallStatus::Pending | CallStatus::InFlight) | None => &mut summary.pending,
            };
            *counter = counter.saturating_add(1);
        }
        summary
    }

    /// Fold in audit counts.
    pub fn with_audit(mut self, audit: &AuditSummary) -> Self {
        self.consistent = audit.consistent;
        self.unverifiable = audit.unverifiable;
        self.fabricated = audit.fabricated;
        self
    }

    /// Exit status implied by these counts.
    pub fn exit_status(&self) -> ExitStatus {
        if self.failed > 0 || self.pending > 0 {
            ExitStatus::Incomplete
        } else if self.fabricated > 0 {
            ExitStatus::Fabricated
        } else {
            ExitStatus::Clean
        }
    }
}

impl std::fmt::Display for RunSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "done={} failed={} pending={} consistent={} unverifiable={} fabricated={}",
            self.done,
            self.failed,
            self.pending,
            self.consistent,
            self.unverifiable,
            self.fabricated
        )
    }
}

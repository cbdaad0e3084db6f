//! Configuration loading and validation.
//!
//! Loads `callsift.toml` (or `$CALLSIFT_CONFIG`). Every section has defaults,
//! so a missing or empty file is valid. Environment variables override file
//! values.
//!
//! Precedence: env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Environment variable naming an alternative config file.
pub const CONFIG_PATH_ENV: &str = "CALLSIFT_CONFIG";

/// Default config file name, resolved against the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "callsift.toml";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    /// Input, output and log locations.
    #[serde(default)]
    pub paths: PathsConfig,

    /// Analysis model endpoint.
    #[serde(default)]
    pub model: ModelConfig,

    /// Concurrency and per-minute quota limits.
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Retry policy for transient gateway failures.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Cycle control and source-diff policy.
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// Extra redaction inputs for the per-call vault.
    #[serde(default)]
    pub vault: VaultConfig,
}

/// Filesystem locations.
#[derive(Debug, Clone, Deserialize)]
pub struct PathsConfig {
    /// Transcript source: a JSON file or a directory of JSON files.
    #[serde(default = "default_source")]
    pub source: PathBuf,

    /// Primary checkpoint (also the final output document).
    #[serde(default = "default_checkpoint")]
    pub checkpoint: PathBuf,

    /// Audit report written after each run.
    #[serde(default = "default_audit_report")]
    pub audit_report: PathBuf,

    /// Directory for rotated JSON logs and the dead-letter log.
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Optional `.env` file holding the API key.
    #[serde(default = "default_env_file")]
    pub env_file: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            source: default_source(),
            checkpoint: default_checkpoint(),
            audit_report: default_audit_report(),
            logs_dir: default_logs_dir(),
            env_file: default_env_file(),
        }
    }
}

impl PathsConfig {
    /// Dead-letter log for calls that failed terminally.
    pub fn dead_letter_log(&self) -> PathBuf {
        self.logs_dir.join("dlq").join("failed_calls.log")
    }
}

/// OpenAI-compatible chat completions endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    /// Full chat completions URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Model identifier sent with each request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Maximum completion tokens per call.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    /// HTTP timeout per request.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            max_tokens: default_max_tokens(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

/// Admission limits for the throttle scheduler.
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    /// Gateway calls allowed in flight at once.
    #[serde(default = "default_max_concurrent_calls")]
    pub max_concurrent_calls: usize,

    /// Provider token quota per rolling minute.
    #[serde(default = "default_tokens_per_minute")]
    pub tokens_per_minute: u64,

    /// Provider request quota per rolling minute.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    /// Tokens reserved per call before actual usage is known.
    #[serde(default = "default_estimated_tokens_per_call")]
    pub estimated_tokens_per_call: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: default_max_concurrent_calls(),
            tokens_per_minute: default_tokens_per_minute(),
            requests_per_minute: default_requests_per_minute(),
            estimated_tokens_per_call: default_estimated_tokens_per_call(),
        }
    }
}

/// Exponential backoff for transient failures.
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Gateway attempts per call per cycle.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// First backoff delay.
    #[serde(default = "default_backoff_min_secs")]
    pub backoff_min_secs: u64,

    /// Backoff ceiling.
    #[serde(default = "default_backoff_max_secs")]
    pub backoff_max_secs: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_min_secs: default_backoff_min_secs(),
            backoff_max_secs: default_backoff_max_secs(),
        }
    }
}

/// What happens to checkpoint entries whose transcript left the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemovedPolicy {
    /// Keep the entry as historical record.
    #[default]
    Retain,
    /// Drop the entry at the next commit.
    Purge,
}

/// Cycle control.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on source re-scan cycles per run.
    #[serde(default = "default_max_cycles")]
    pub max_cycles: u32,

    /// Policy for transcripts removed from the source.
    #[serde(default)]
    pub removed_transcripts: RemovedPolicy,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_cycles: default_max_cycles(),
            removed_transcripts: RemovedPolicy::default(),
        }
    }
}

/// Values redacted in every transcript on top of pattern detection.
///
/// Pattern detection does not recognize names, so people mentioned in a
/// call but absent from the record's structured fields (agents, relatives)
/// are only tokenized when listed here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct VaultConfig {
    /// Person names tokenized wherever they occur as whole words.
    #[serde(default)]
    pub known_names: Vec<String>,
}

// Default value functions for serde

fn default_source() -> PathBuf {
    PathBuf::from("data/sample_calls.json")
}
fn default_checkpoint() -> PathBuf {
    PathBuf::from("outputs/final_analysis.json")
}
fn default_audit_report() -> PathBuf {
    PathBuf::from("outputs/audit_report.json")
}
fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}
fn default_env_file() -> PathBuf {
    PathBuf::from(".env")
}
fn default_base_url() -> String {
    "https://api.groq.com/openai/v1/chat/completions".to_owned()
}
fn default_model() -> String {
    "llama-3.1-8b-instant".to_owned()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_owned()
}
fn default_max_tokens() -> u32 {
    2048
}
fn default_timeout_secs() -> u64 {
    60
}
fn default_max_concurrent_calls() -> usize {
    1
}
fn default_tokens_per_minute() -> u64 {
    6_000
}
fn default_requests_per_minute() -> u32 {
    30
}
fn default_estimated_tokens_per_call() -> u64 {
    1_500
}
fn default_max_attempts() -> u32 {
    3
}
fn default_backoff_min_secs() -> u64 {
    4
}
fn default_backoff_max_secs() -> u64 {
    10
}
fn default_max_cycles() -> u32 {
    3
}

impl Config {
    /// Load with precedence env vars > file > defaults.
    ///
    /// `explicit` wins over `$CALLSIFT_CONFIG`, which wins over
    /// `./callsift.toml`. A missing file yields defaults unless the path was
    /// given explicitly.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or if the
    /// resulting limits are invalid.
    pub fn load(explicit: Option<&Path>) -> anyhow::Result<Self> {
        Self::load_with(explicit, |key| std::env::var(key).ok())
    }

    /// [`Config::load`] with a custom environment resolver (for testing).
    ///
    /// # Errors
    ///
    /// See [`Config::load`].
    pub fn load_with(
        explicit: Option<&Path>,
        env: impl Fn(&str) -> Option<String>,
    ) -> anyhow::Result<Self> {
        let (path, required) = match explicit {
            Some(p) => (p.to_owned(), true),
            None => match env(CONFIG_PATH_ENV) {
                Some(p) => (PathBuf::from(p), true),
                None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
            },
        };

        let mut config = match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                toml::from_str::<Config>(&contents)
                    .with_context(|| format!("failed to parse config at {}", path.display()))?
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && !required => {
                tracing::info!("no config file found, using defaults");
                Config::default()
            }
            Err(e) => {
                return Err(anyhow::anyhow!(
                    "failed to read config at {}: {e}",
                    path.display()
                ))
            }
        };

        config.apply_overrides(env);
        config.validate()?;
        Ok(config)
    }

    /// Apply environment variable overrides.
    ///
    /// Takes a resolver function for testability (avoids `set_var` in tests).
    /// Unparseable numeric values are ignored with a warning.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("CALLSIFT_SOURCE") {
            self.paths.source = PathBuf::from(v);
        }
        if let Some(v) = env("CALLSIFT_CHECKPOINT") {
            self.paths.checkpoint = PathBuf::from(v);
        }
        if let Some(v) = env("CALLSIFT_MODEL") {
            self.model.model = v;
        }
        if let Some(v) = env("CALLSIFT_BASE_URL") {
            self.model.base_url = v;
        }

        override_number(&env, "CALLSIFT_MAX_CONCURRENT", &mut self.scheduler.max_concurrent_calls);
        override_number(&env, "CALLSIFT_TPM", &mut self.scheduler.tokens_per_minute);
        override_number(&env, "CALLSIFT_RPM", &mut self.scheduler.requests_per_minute);
    }

    /// Reject limits the pipeline could never satisfy.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid value.
    pub fn validate(&self) -> anyhow::Result<()> {
        let s = &self.scheduler;
        anyhow::ensure!(s.max_concurrent_calls > 0, "scheduler.max_concurrent_calls must be > 0");
        anyhow::ensure!(s.tokens_per_minute > 0, "scheduler.tokens_per_minute must be > 0");
        anyhow::ensure!(s.requests_per_minute > 0, "scheduler.requests_per_minute must be > 0");
        anyhow::ensure!(
            s.estimated_tokens_per_call <= s.tokens_per_minute,
            "scheduler.estimated_tokens_per_call ({}) exceeds tokens_per_minute ({})",
            s.estimated_tokens_per_call,
            s.tokens_per_minute
        );
        anyhow::ensure!(self.retry.max_attempts > 0, "retry.max_attempts must be > 0");
        anyhow::ensure!(
            self.retry.backoff_min_secs <= self.retry.backoff_max_secs,
            "retry.backoff_min_secs must not exceed retry.backoff_max_secs"
        );
        anyhow::ensure!(self.pipeline.max_cycles > 0, "pipeline.max_cycles must be > 0");
        Ok(())
    }
}

fn override_number<T: std::str::FromStr>(
    env: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    target: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(n) => *target = n,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

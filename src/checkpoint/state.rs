//! Per-call processing state and the on-disk checkpoint document.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Current checkpoint format version.
pub const FORMAT_VERSION: u32 = 1;

/// All call states keyed by call id.
pub type StateMap = BTreeMap<String, CallState>;

/// Lifecycle of a single call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    /// Seen in the source, not yet completed.
    Pending,
    /// A gateway round trip is underway.
    InFlight,
    /// Analysis finished and the rehydrated result is stored.
    Done,
    /// Terminal failure for the current cycle.
    Failed,
}

/// Why a call ended up `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retries exhausted on timeouts, throttling or server errors.
    /// Eligible again on the next cycle.
    Transient,
    /// The gateway rejected the request outright.
    Fatal,
    /// The model returned a token the vault never issued.
    VaultToken,
}

impl FailureKind {
    /// Whether the orchestrator may pick the call up again without a source change.
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

/// Processing state of one call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallState {
    /// Call identifier from the transcript.
    pub call_id: String,
    /// Current lifecycle status.
    pub status: CallStatus,
    /// Gateway attempts made so far.
    #[serde(default)]
    pub attempt_count: u32,
    /// Rehydrated analysis, present once `done`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Last failure reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Classification of the last terminal failure.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_kind: Option<FailureKind>,
    /// SHA-256 of the transcript record this state was computed from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_digest: Option<String>,
    /// Time of the last transition.
    pub last_updated_at: DateTime<Utc>,
}

impl CallState {
    /// A freshly discovered call.
    pub fn pending(call_id: impl Into<String>, source_digest: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            status: CallStatus::Pending,
            attempt_count: 0,
            result: None,
            error: None,
            failure_kind: None,
            source_digest: Some(source_digest.into()),
            last_updated_at: Utc::now(),
        }
    }

    /// Whether the call still needs work in this cycle.
    pub fn needs_work(&self) -> bool {
        match self.status {
            CallStatus::Done => false,
            CallStatus::Failed => self.failure_kind.map_or(true, FailureKind::is_retryable),
            CallStatus::Pending | CallStatus::InFlight => true,
        }
    }

    /// Mark a gateway round trip as started.
    pub fn begin_attempt(&mut self) {
        self.status = CallStatus::InFlight;
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.touch();
    }

    /// Record a successful analysis.
    pub fn complete(&mut self, result: Value) {
        self.status = CallStatus::Done;
        self.result = Some(result);
        self.error = None;
        self.failure_kind = None;
        self.touch();
    }

    /// Record a transient failure that will be retried.
    pub fn retry_later(&mut self, reason: impl Into<String>) {
        self.status = CallStatus::Pending;
        self.error = Some(reason.into());
        self.touch();
    }

    /// Record a terminal failure.
    pub fn fail(&mut self, kind: FailureKind, reason: impl Into<String>) {
        self.status = CallStatus::Failed;
        self.failure_kind = Some(kind);
        self.error = Some(reason.into());
        self.touch();
    }

    /// Put a call back to `pending` after it was abandoned mid-flight.
    pub fn revert_in_flight(&mut self) -> bool {
        if self.status == CallStatus::InFlight {
            self.status = CallStatus::Pending;
            self.touch();
            return true;
        }
        false
    }

    /// Discard previous work because the source transcript changed.
    pub fn reset_for_source(&mut self, source_digest: impl Into<String>) {
        *self = Self::pending(self.call_id.clone(), source_digest);
    }

    fn touch(&mut self) {
        self.last_updated_at = Utc::now();
    }
}

/// Serialized checkpoint document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointFile {
    /// Format version, see [`FORMAT_VERSION`].
    pub version: u32,
    /// When this generation was written.
    pub saved_at: DateTime<Utc>,
    /// Every known call.
    pub calls: StateMap,
}

impl CheckpointFile {
    /// Wrap a state map for writing.
    pub fn new(calls: StateMap) -> Self {
        Self {
            version: FORMAT_VERSION,
            saved_at: Utc::now(),
            calls,
        }
    }

    /// Structural checks beyond JSON well-formedness.
    ///
    /// # Errors
    ///
    /// Returns a description of the first inconsistency found.
    pub fn validate(&self) -> Result<(), String> {
        if self.version != FORMAT_VERSION {
            return Err(format!(
                "unsupported checkpoint version {} (expected {FORMAT_VERSION})",
                self.version
            ));
        }
        for (key, state) in &self.calls {
            if key != &state.call_id {
                return Err(format!(
                    "entry key {key:?} does not match call_id {:?}",
                    state.call_id
                ));
            }
            if state.status == CallStatus::Done && state.result.is_none() {
                return Err(format!("call {key} is done but has no result"));
            }
        }
        Ok(())
    }
}

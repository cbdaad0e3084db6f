//! Post-run integrity audit of identifiers in analysis results.
//!
//! Every reference identifier a result claims is compared with the
//! transcript it was derived from. Claims are normalized (upper case,
//! punctuation removed) on both sides, so `case-4471` in a result matches
//! `CASE 4471` spoken in the transcript.
//!
//! The audit is read-only: it never changes states, results or inputs.

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::checkpoint::{write_json_atomic, CallStatus, CheckpointError, StateMap};
use crate::transcript::{SourceSnapshot, TranscriptRecord};

/// Result keys whose values are reference identifiers.
pub const DEFAULT_ID_KEYS: &[&str] = &[
    "case_id",
    "case_ids",
    "ticket_id",
    "ticket_ids",
    "reference",
    "reference_id",
    "reference_ids",
];

/// Outcome of checking one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// The identifier appears in the transcript.
    Consistent,
    /// The claim cannot be checked.
    Unverifiable,
    /// The identifier is not in the transcript, or the value is not an identifier at all.
    Fabricated,
}

/// One checked claim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuditFinding {
    /// Call whose result made the claim.
    pub call_id: String,
    /// JSON path of the claim inside the result, e.g. `entities.case_ids[0]`.
    pub field: String,
    /// The claimed value as it appears in the result.
    pub claimed_value: String,
    /// Verdict.
    pub verdict: Verdict,
    /// Short explanation.
    pub reason: String,
}

/// Verdict counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AuditSummary {
    /// `done` results inspected.
    pub calls_audited: usize,
    /// Claims found in their transcript.
    pub consistent: usize,
    /// Claims that could not be checked.
    pub unverifiable: usize,
    /// Claims absent from their transcript.
    pub fabricated: usize,
}

/// Audit output, written as JSON.
#[derive(Debug, Clone, Serialize)]
pub struct AuditReport {
    /// When the audit ran.
    pub generated_at: DateTime<Utc>,
    /// Verdict counts.
    pub summary: AuditSummary,
    /// Findings ordered by call id, then field path.
    pub findings: Vec<AuditFinding>,
}

impl AuditReport {
    /// Write the report atomically to `path`.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error on serialization or I/O failure.
    pub fn write(&self, path: &Path) -> Result<(), CheckpointError> {
        write_json_atomic(path, self)
    }
}

/// Cross-checks result identifiers against transcripts.
#[derive(Debug, Clone)]
pub struct IntegrityAuditor {
    id_keys: BTreeSet<String>,
}

impl Default for IntegrityAuditor {
    fn default() -> Self {
        Self::with_id_keys(DEFAULT_ID_KEYS.iter().copied())
    }
}

impl IntegrityAuditor {
    /// Auditor treating `keys` as reference-identifier fields.
    pub fn with_id_keys<'a>(keys: impl IntoIterator<Item = &'a str>) -> Self {
        Self {
            id_keys: keys.into_iter().map(str::to_owned).collect(),
        }
    }

    /// Audit every `done` result in `states` against `source`.
    pub fn audit(&self, states: &StateMap, source: &SourceSnapshot) -> AuditReport {
        let mut findings = Vec::new();
        let mut summary = AuditSummary::default();

        for (call_id, state) in states {
            if state.status != CallStatus::Done {
                continue;
            }
            let Some(result) = &state.result else {
                continue;
            };
            summary.calls_audited = summary.calls_audited.saturating_add(1);

            let mut audit = CallAudit {
                auditor: self,
                call_id,
                candidates: source.get(call_id).map(candidates_from),
                findings: &mut findings,
            };
            audit.walk(result, String::new(), false);
        }

        findings.sort_by(|a, b| (&a.call_id, &a.field).cmp(&(&b.call_id, &b.field)));
        for finding in &findings {
            let counter = match finding.verdict {
                Verdict::Consistent => &mut summary.consistent,
                Verdict::Unverifiable => &mut summary.unverifiable,
                Verdict::Fabricated => &mut summary.fabricated,
            };
            *counter = counter.saturating_add(1);
        }

        AuditReport {
            generated_at: Utc::now(),
            summary,
            findings,
        }
    }
}

/// Walk state for one call's result.
struct CallAudit<'a> {
    auditor: &'a IntegrityAuditor,
    call_id: &'a str,
    /// Normalized identifiers from the transcript; `None` if it is gone.
    candidates: Option<BTreeSet<String>>,
    findings: &'a mut Vec<AuditFinding>,
}

impl CallAudit<'_> {
    fn walk(&mut self, value: &Value, path: String, in_id_field: bool) {
        match value {
            Value::Object(map) => {
                for (key, child) in map {
                    let child_path = if path.is_empty() {
                        key.clone()
                    } else {
                        format!("{path}.{key}")
                    };
                    if key == "call_id" {
                        self.check_call_id(child, child_path);
                    } else {
                        let id_field = self.auditor.id_keys.contains(key.as_str());
                        self.walk(child, child_path, id_field);
                    }
                }
            }
            Value::Array(items) => {
                for (index, item) in items.iter().enumerate() {
                    self.walk(item, format!("{path}[{index}]"), in_id_field);
                }
            }
            Value::String(s) if in_id_field => self.check_id_claim(s, path),
            Value::Number(n) if in_id_field => self.check_id_claim(&n.to_string(), path),
            Value::String(s) => self.check_free_text(s, &path),
            _ => {}
        }
    }

    fn check_call_id(&mut self, value: &Value, field: String) {
        let claimed = match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        let (verdict, reason) = if normalize(&claimed) == normalize(self.call_id) {
            (Verdict::Consistent, "matches the record's call id")
        } else {
            (Verdict::Fabricated, "differs from the record's call id")
        };
        self.push(field, claimed, verdict, reason);
    }

    fn check_id_claim(&mut self, claimed: &str, field: String) {
        let trimmed = claimed.trim();
        if trimmed.is_empty() {
            return;
        }
        if looks_like_date(trimmed) {
            self.push(
                field,
                claimed.to_owned(),
                Verdict::Fabricated,
                "date placed in an identifier field",
            );
            return;
        }
        if looks_like_amount(trimmed) {
            self.push(
                field,
                claimed.to_owned(),
                Verdict::Fabricated,
                "currency amount placed in an identifier field",
            );
            return;
        }
        if !is_id_shaped(trimmed) {
            self.push(
                field,
                claimed.to_owned(),
                Verdict::Unverifiable,
                "value is not shaped like an identifier",
            );
            return;
        }
        self.verify_against_transcript(claimed, field);
    }

    fn check_free_text(&mut self, text: &str, path: &str) {
        let Some(re) = embedded_id_pattern() else {
            return;
        };
        for (index, m) in re.find_iter(text).enumerate() {
            let field = if index == 0 {
                path.to_owned()
            } else {
                format!("{path}#{index}")
            };
            if normalize(m.as_str()) == normalize(self.call_id) {
                self.push(
                    field,
                    m.as_str().to_owned(),
                    Verdict::Consistent,
                    "matches the record's call id",
                );
            } else {
                self.verify_against_transcript(m.as_str(), field);
            }
        }
    }

    fn verify_against_transcript(&mut self, claimed: &str, field: String) {
        let (verdict, reason) = match &self.candidates {
            None => (Verdict::Unverifiable, "transcript no longer in the source"),
            Some(candidates) if candidates.contains(&normalize(claimed)) => {
                (Verdict::Consistent, "identifier appears in the transcript")
            }
            Some(_) => (Verdict::Fabricated, "identifier does not appear in the transcript"),
        };
        self.push(field, claimed.to_owned(), verdict, reason);
    }

    fn push(&mut self, field: String, claimed_value: String, verdict: Verdict, reason: &str) {
        self.findings.push(AuditFinding {
            call_id: self.call_id.to_owned(),
            field,
            claimed_value,
            verdict,
            reason: reason.to_owned(),
        });
    }
}

/// Upper-case alphanumerics only.
pub fn normalize(value: &str) -> String {
    value
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Most alphanumeric runs an identifier may span ("TK 00 12 B").
const MAX_ID_RUNS: usize = 4;

/// Normalized identifier candidates in a transcript.
///
/// The transcript is cut at every non-alphanumeric character. Each run, and
/// each sequence of up to [`MAX_ID_RUNS`] consecutive runs joined together,
/// is a candidate, so `ref:CASE-4471`, `CASE-5000/CASE-5001` and the spoken
/// "case 4471" all yield their identifiers. Structured case ids are added as is.
fn candidates_from(record: &TranscriptRecord) -> BTreeSet<String> {
    let runs: Vec<String> = record
        .transcript
        .split(|c: char| !c.is_alphanumeric())
        .filter(|run| !run.is_empty())
        .map(normalize)
        .collect();

    let mut candidates = BTreeSet::new();
    for start in 0..runs.len() {
        let mut joined = String::new();
        for run in runs.iter().skip(start).take(MAX_ID_RUNS) {
            joined.push_str(run);
            candidates.insert(joined.clone());
        }
    }
    candidates.extend(record.case_ids.iter().map(|id| normalize(id)));
    candidates
}

fn is_id_shaped(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    let shaped = RE
        .get_or_init(|| Regex::new(r"^#?[A-Za-z0-9]+(?:[-_/. ][A-Za-z0-9]+){0,3}$").ok())
        .as_ref()
        .is_some_and(|re| re.is_match(value));
    shaped && value.chars().any(|c| c.is_ascii_digit()) && normalize(value).len() >= 3
}

fn looks_like_date(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:\d{4}[-/.]\d{1,2}[-/.]\d{1,2}|\d{1,2}[-/.]\d{1,2}[-/.]\d{2,4})$").ok()
    })
    .as_ref()
    .is_some_and(|re| re.is_match(value))
}

fn looks_like_amount(value: &str) -> bool {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^(?i:(?:₹|rs\.?|inr|\$|usd|€)\s?\d[\d,]*(?:\.\d+)?|\d[\d,]*\.\d{1,2}(?:\s?(?:inr|usd|rupees))?|\d[\d,]*\s?(?:inr|usd|rupees))$",
        )
        .ok()
    })
    .as_ref()
    .is_some_and(|re| re.is_match(value))
}

/// Identifier-shaped substrings inside free text.
fn embedded_id_pattern() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b[A-Z]{2,5}-\d{3,10}\b").ok())
        .as_ref()
}

//! Transcript source loading and change detection.
//!
//! The source is either a JSON file holding an array of records or a
//! directory of `*.json` files, each holding one record or an array. It is
//! re-read at the start of every cycle; [`SourceSnapshot::diff`] compares it
//! with the digests recorded in the checkpoint.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::checkpoint::StateMap;
use crate::vault::Category;

/// Shortest name part (in letters) redacted on its own.
const MIN_NAME_PART: usize = 3;

/// Errors raised while reading the transcript source.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    /// The source path could not be read.
    #[error("failed to read transcript source {path}: {source}")]
    Io {
        /// Path being read.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// A source file is not valid transcript JSON.
    #[error("invalid transcript JSON in {path}: {source}")]
    Parse {
        /// Offending file.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: serde_json::Error,
    },

    /// Two records share a call id.
    #[error("duplicate call_id {0:?} in transcript source")]
    DuplicateCallId(String),

    /// A record has an empty call id.
    #[error("transcript record with empty call_id in {0}")]
    EmptyCallId(PathBuf),
}

/// One input transcript. Never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptRecord {
    /// Unique call identifier.
    pub call_id: String,
    /// Raw transcript text.
    #[serde(alias = "text")]
    pub transcript: String,
    /// Customer name, when supplied as a structured field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer_name: Option<String>,
    /// Known phone numbers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phone_numbers: Vec<String>,
    /// Known case or ticket identifiers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub case_ids: Vec<String>,
}

impl TranscriptRecord {
    /// Structured sensitive values, used to seed the call's vault.
    ///
    /// The customer name is listed whole and by its parts, so a caller
    /// addressed by first name alone is still redacted.
    pub fn known_values(&self) -> Vec<(Category, String)> {
        let mut values = Vec::new();
        if let Some(name) = &self.customer_name {
            values.push((Category::Person, name.clone()));
            let parts: Vec<&str> = name.split_whitespace().collect();
            if parts.len() > 1 {
                values.extend(
                    parts
                        .into_iter()
                        .filter(|part| {
                            part.chars().filter(|c| c.is_alphabetic()).count() >= MIN_NAME_PART
                        })
                        .map(|part| (Category::Person, part.to_owned())),
                );
            }
        }
        values.extend(
            self.phone_numbers
                .iter()
                .map(|p| (Category::Phone, p.clone())),
        );
        values.extend(self.case_ids.iter().map(|c| (Category::CaseId, c.clone())));
        values
    }

    /// Hex SHA-256 over the record's canonical JSON form.
    pub fn digest(&self) -> String {
        // Field order is fixed by the struct, so the encoding is stable.
        let bytes = serde_json::to_vec(self).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }
}

/// Read every transcript record under `path`.
///
/// Directory entries are read in file-name order; non-`.json` files are
/// skipped.
///
/// # Errors
///
/// Returns [`SourceError`] on I/O or parse failure, or when a record has an
/// empty call id.
pub fn load_source(path: &Path) -> Result<Vec<TranscriptRecord>, SourceError> {
    let io_err = |source| SourceError::Io {
        path: path.to_owned(),
        source,
    };

    if !path.is_dir() {
        return read_records(path);
    }

    let mut files: Vec<PathBuf> = fs::read_dir(path)
        .map_err(io_err)?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|p| p.is_file() && p.extension().is_some_and(|ext| ext == "json"))
        .collect();
    files.sort();

    let mut records = Vec::new();
    for file in files {
        records.extend(read_records(&file)?);
    }
    Ok(records)
}

fn read_records(path: &Path) -> Result<Vec<TranscriptRecord>, SourceError> {
    let contents = fs::read_to_string(path).map_err(|source| SourceError::Io {
        path: path.to_owned(),
        source,
    })?;
    let parse_err = |source| SourceError::Parse {
        path: path.to_owned(),
        source,
    };

    if contents.trim().is_empty() {
        return Ok(Vec::new());
    }

    let value: Value = serde_json::from_str(&contents).map_err(parse_err)?;
    let records = match value {
        Value::Array(_) => {
            serde_json::from_value::<Vec<TranscriptRecord>>(value).map_err(parse_err)?
        }
        other => vec![serde_json::from_value::<TranscriptRecord>(other).map_err(parse_err)?],
    };

    if records.iter().any(|r| r.call_id.trim().is_empty()) {
        return Err(SourceError::EmptyCallId(path.to_owned()));
    }
    Ok(records)
}

/// Source contents at one point in time, keyed by call id.
#[derive(Debug, Clone, Default)]
pub struct SourceSnapshot {
    records: BTreeMap<String, TranscriptRecord>,
    digests: BTreeMap<String, String>,
}

/// Classification of source ids against recorded call states.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    /// Present in the source, unknown to the checkpoint.
    pub added: BTreeSet<String>,
    /// Present in both, digest differs.
    pub modified: BTreeSet<String>,
    /// Known to the checkpoint, gone from the source.
    pub removed: BTreeSet<String>,
    /// Present in both with a matching digest.
    pub unchanged: BTreeSet<String>,
}

impl ChangeSet {
    /// Whether the source differs from the recorded states at all.
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.modified.is_empty() && self.removed.is_empty())
    }
}

impl SourceSnapshot {
    /// Index `records` by call id.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::DuplicateCallId`] if two records share an id.
    pub fn from_records(records: Vec<TranscriptRecord>) -> Result<Self, SourceError> {
        let mut snapshot = Self::default();
        for record in records {
            let id = record.call_id.clone();
            if snapshot.records.contains_key(&id) {
                return Err(SourceError::DuplicateCallId(id));
            }
            snapshot.digests.insert(id.clone(), record.digest());
            snapshot.records.insert(id, record);
        }
        Ok(snapshot)
    }

    /// Load and index the source at `path`.
    ///
    /// # Errors
    ///
    /// See [`load_source`] and [`SourceSnapshot::from_records`].
    pub fn load(path: &Path) -> Result<Self, SourceError> {
        Self::from_records(load_source(path)?)
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the source holds no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Record for `call_id`.
    pub fn get(&self, call_id: &str) -> Option<&TranscriptRecord> {
        self.records.get(call_id)
    }

    /// Digest of the record for `call_id`.
    pub fn digest(&self, call_id: &str) -> Option<&str> {
        self.digests.get(call_id).map(String::as_str)
    }

    /// All call ids in order.
    pub fn ids(&self) -> BTreeSet<String> {
        self.records.keys().cloned().collect()
    }

    /// Iterate records in call id order.
    pub fn records(&self) -> impl Iterator<Item = &TranscriptRecord> {
        self.records.values()
    }

    /// Compare against the source digests recorded in `states`.
    ///
    /// A state without a recorded digest is treated as unchanged.
    pub fn diff(&self, states: &StateMap) -> ChangeSet {
        let mut changes = ChangeSet::default();
        for (id, digest) in &self.digests {
            match states.get(id) {
                None => {
                    changes.added.insert(id.clone());
                }
                Some(state) => match state.source_digest.as_deref() {
                    Some(recorded) if recorded != digest => {
                        changes.modified.insert(id.clone());
                    }
                    _ => {
                        changes.unchanged.insert(id.clone());
                    }
                },
            }
        }
        changes.removed = states
            .keys()
            .filter(|id| !self.records.contains_key(*id))
            .cloned()
            .collect();
        changes
    }
}

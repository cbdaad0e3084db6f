//! Crash-safe checkpoint persistence.
//!
//! Every commit walks three named steps:
//!
//! 1. [`CheckpointStore::write_temp`]: serialize to `<primary>.tmp` and fsync.
//! 2. [`CheckpointStore::rotate_backup`]: copy the current primary (if it
//!    validates) to `<primary>.bak` through its own temp file and rename.
//! 3. [`CheckpointStore::promote_temp`]: rename the temp file over the
//!    primary and fsync the directory.
//!
//! The primary path is only ever replaced by a rename, so a reader sees the
//! previous generation or the new one, never a partial document. A process
//! killed mid-commit leaves at most an orphaned temp file, which [`load`]
//! reports and ignores.
//!
//! [`load`]: CheckpointStore::load

pub mod state;

use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, warn};

pub use state::{CallState, CallStatus, CheckpointFile, FailureKind, StateMap, FORMAT_VERSION};

/// Errors raised by the checkpoint store.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Filesystem operation failed.
    #[error("checkpoint I/O failed at {path}: {source}")]
    Io {
        /// Path being accessed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// State could not be serialized.
    #[error("failed to serialize checkpoint: {0}")]
    Serialize(#[from] serde_json::Error),

    /// Neither the primary nor the backup holds a valid checkpoint.
    #[error("checkpoint state is corrupt (primary: {primary}; backup: {backup})")]
    CorruptState {
        /// Why the primary was rejected.
        primary: String,
        /// Why the backup was rejected.
        backup: String,
    },

    /// `promote_temp` was called without a prior `write_temp`.
    #[error("no staged checkpoint at {0}")]
    NothingStaged(PathBuf),
}

impl CheckpointError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_owned(),
            source,
        }
    }
}

/// Which file a [`LoadOutcome`] came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// The primary checkpoint.
    Primary,
    /// The primary was missing or invalid; the backup was used.
    Backup,
    /// Neither file exists: first run.
    Fresh,
}

/// Result of [`CheckpointStore::load`].
#[derive(Debug)]
pub struct LoadOutcome {
    /// Recovered call states.
    pub states: StateMap,
    /// File the states were read from.
    pub source: LoadSource,
    /// A temp file from an interrupted commit was found and ignored.
    pub orphaned_temp: bool,
    /// Calls that were `in_flight` at crash time and are `pending` again.
    pub reverted_in_flight: usize,
}

/// Outcome of [`CheckpointStore::verify_and_prune_backup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupVerdict {
    /// Primary verified; backup deleted.
    Pruned,
    /// Primary verified; there was no backup to delete.
    NoBackup,
    /// Primary failed verification; backup kept.
    Retained {
        /// Why verification failed.
        reason: String,
    },
}

/// Why a checkpoint file could not be used.
#[derive(Debug)]
enum ReadFailure {
    Missing,
    Invalid(String),
}

impl ReadFailure {
    fn describe(&self) -> String {
        match self {
            Self::Missing => "missing".to_owned(),
            Self::Invalid(reason) => reason.clone(),
        }
    }
}

/// Durable store for the call state map.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    primary: PathBuf,
    backup: PathBuf,
    temp: PathBuf,
    backup_temp: PathBuf,
}

impl CheckpointStore {
    /// Create a store rooted at `primary`. Sibling files use the suffixes
    /// `.bak`, `.tmp` and `.bak.tmp`.
    pub fn new(primary: impl Into<PathBuf>) -> Self {
        let primary = primary.into();
        let backup = with_suffix(&primary, ".bak");
        let temp = with_suffix(&primary, ".tmp");
        let backup_temp = with_suffix(&primary, ".bak.tmp");
        Self {
            primary,
            backup,
            temp,
            backup_temp,
        }
    }

    /// Path of the primary checkpoint.
    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    /// Path of the one-generation-behind backup.
    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Path of the staging file used during commits.
    pub fn temp_path(&self) -> &Path {
        &self.temp
    }

    /// Load the most recent valid checkpoint.
    ///
    /// Falls back to the backup when the primary is missing or invalid.
    /// `in_flight` calls are reverted to `pending`.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::CorruptState`] when no usable checkpoint
    /// exists but at least one of the files is present, so that completed
    /// work is never silently discarded.
    pub fn load(&self) -> Result<LoadOutcome, CheckpointError> {
        let orphaned_temp = self.temp.exists();
        if orphaned_temp {
            warn!(
                path = %self.temp.display(),
                "ignoring orphaned checkpoint temp file from an interrupted commit"
            );
        }

        let (file, source) = match read_validated(&self.primary) {
            Ok(file) => (Some(file), LoadSource::Primary),
            Err(primary_failure) => match (read_validated(&self.backup), primary_failure) {
                (Ok(file), failure) => {
                    warn!(
                        primary = %self.primary.display(),
                        reason = %failure.describe(),
                        "primary checkpoint unusable, recovered from backup"
                    );
                    (Some(file), LoadSource::Backup)
                }
                (Err(ReadFailure::Missing), ReadFailure::Missing) => (None, LoadSource::Fresh),
                (Err(backup_failure), primary_failure) => {
                    return Err(CheckpointError::CorruptState {
                        primary: primary_failure.describe(),
                        backup: backup_failure.describe(),
                    });
                }
            },
        };

        let mut states = file.map(|f| f.calls).unwrap_or_default();
        let reverted_in_flight = states
            .values_mut()
            .filter_map(|state| state.revert_in_flight().then_some(()))
            .count();

        info!(
            calls = states.len(),
            source = ?source,
            reverted_in_flight,
            "checkpoint loaded"
        );

        Ok(LoadOutcome {
            states,
            source,
            orphaned_temp,
            reverted_in_flight,
        })
    }

    /// Atomically persist `states` as the new primary.
    ///
    /// # Errors
    ///
    /// Returns an error if any step fails. The primary is untouched unless the
    /// final rename succeeded.
    pub fn commit(&self, states: &StateMap) -> Result<(), CheckpointError> {
        self.write_temp(states)?;
        self.rotate_backup()?;
        self.promote_temp()?;
        debug!(calls = states.len(), "checkpoint committed");
        Ok(())
    }

    /// Step 1: write the full state to the temp file and fsync it.
    ///
    /// # Errors
    ///
    /// Returns an error on serialization or I/O failure.
    pub fn write_temp(&self, states: &StateMap) -> Result<(), CheckpointError> {
        let file = CheckpointFile::new(states.clone());
        let bytes = serde_json::to_vec_pretty(&file)?;
        ensure_parent_dir(&self.temp)?;
        write_synced(&self.temp, &bytes)
    }

    /// Step 2: copy the current primary to the backup path.
    ///
    /// An invalid primary is never rotated in, so a good backup cannot be
    /// overwritten by a damaged generation. Returns whether a backup was
    /// written.
    ///
    /// # Errors
    ///
    /// Returns an error if copying or renaming fails.
    pub fn rotate_backup(&self) -> Result<bool, CheckpointError> {
        match read_validated(&self.primary) {
            Ok(_) => {}
            Err(ReadFailure::Missing) => return Ok(false),
            Err(ReadFailure::Invalid(reason)) => {
                warn!(
                    primary = %self.primary.display(),
                    %reason,
                    "primary checkpoint invalid, keeping existing backup"
                );
                return Ok(false);
            }
        }

        fs::copy(&self.primary, &self.backup_temp)
            .map_err(|e| CheckpointError::io(&self.backup_temp, e))?;
        File::open(&self.backup_temp)
            .and_then(|f| f.sync_all())
            .map_err(|e| CheckpointError::io(&self.backup_temp, e))?;
        fs::rename(&self.backup_temp, &self.backup)
            .map_err(|e| CheckpointError::io(&self.backup, e))?;
        Ok(true)
    }

    /// Step 3: atomically rename the temp file over the primary.
    ///
    /// # Errors
    ///
    /// Returns [`CheckpointError::NothingStaged`] if no temp file exists, or an
    /// I/O error if the rename fails.
    pub fn promote_temp(&self) -> Result<(), CheckpointError> {
        if !self.temp.exists() {
            return Err(CheckpointError::NothingStaged(self.temp.clone()));
        }
        fs::rename(&self.temp, &self.primary).map_err(|e| CheckpointError::io(&self.primary, e))?;
        sync_parent_dir(&self.primary)
    }

    /// Re-read the primary and delete the backup only if it verifies.
    ///
    /// Verification requires a parseable, internally consistent document that
    /// contains every id in `expected_ids`. This is the only code path that
    /// deletes the backup.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the backup exists but cannot be removed.
    pub fn verify_and_prune_backup(
        &self,
        expected_ids: &BTreeSet<String>,
    ) -> Result<BackupVerdict, CheckpointError> {
        let file = match read_validated(&self.primary) {
            Ok(file) => file,
            Err(failure) => {
                let reason = format!("primary checkpoint {}", failure.describe());
                warn!(%reason, "health check failed, keeping backup");
                return Ok(BackupVerdict::Retained { reason });
            }
        };

        let mut missing = expected_ids
            .iter()
            .filter(|id| !file.calls.contains_key(*id));
        if let Some(first_missing) = missing.next() {
            let count = missing.count().saturating_add(1);
            let reason = format!("{count} expected call(s) absent from primary");
            warn!(%reason, %first_missing, "health check failed, keeping backup");
            return Ok(BackupVerdict::Retained { reason });
        }

        if !self.backup.exists() {
            info!("health check passed, no backup to prune");
            return Ok(BackupVerdict::NoBackup);
        }
        fs::remove_file(&self.backup).map_err(|e| CheckpointError::io(&self.backup, e))?;
        info!(path = %self.backup.display(), "health check passed, backup deleted");
        Ok(BackupVerdict::Pruned)
    }
}

/// Atomically write any serializable value as pretty JSON at `path`.
///
/// Uses the same temp-write, fsync and rename sequence as checkpoint commits,
/// without backup rotation.
///
/// # Errors
///
/// Returns an error on serialization or I/O failure.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<(), CheckpointError> {
    let bytes = serde_json::to_vec_pretty(value)?;
    let temp = with_suffix(path, ".tmp");
    ensure_parent_dir(path)?;
    write_synced(&temp, &bytes)?;
    fs::rename(&temp, path).map_err(|e| CheckpointError::io(path, e))?;
    sync_parent_dir(path)
}

fn read_validated(path: &Path) -> Result<CheckpointFile, ReadFailure> {
    let bytes = match fs::read(path) {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(ReadFailure::Missing),
        Err(e) => return Err(ReadFailure::Invalid(format!("unreadable: {e}"))),
    };
    let file: CheckpointFile = serde_json::from_slice(&bytes)
        .map_err(|e| ReadFailure::Invalid(format!("not a valid checkpoint document: {e}")))?;
    file.validate().map_err(ReadFailure::Invalid)?;
    Ok(file)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), CheckpointError> {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        // Results hold rehydrated PII.
        options.mode(0o600);
    }

    let mut file = options.open(path).map_err(|e| CheckpointError::io(path, e))?;
    file.write_all(bytes)
        .map_err(|e| CheckpointError::io(path, e))?;
    file.sync_all().map_err(|e| CheckpointError::io(path, e))
}

fn ensure_parent_dir(path: &Path) -> Result<(), CheckpointError> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| CheckpointError::io(parent, e))
        }
        _ => Ok(()),
    }
}

fn sync_parent_dir(path: &Path) -> Result<(), CheckpointError> {
    #[cfg(unix)]
    {
        let parent = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| CheckpointError::io(parent, e))?;
    }
    #[cfg(not(unix))]
    let _ = path;
    Ok(())
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

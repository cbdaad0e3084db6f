//! In-memory call states with serialized, durable commits.
//!
//! Every mutation goes through the ledger's async mutex. Persisting
//! mutations hold the lock across the blocking checkpoint write, so commits
//! never interleave and the file always reflects a prefix of the mutations.

use std::collections::BTreeSet;

use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::checkpoint::{BackupVerdict, CallState, CheckpointStore, StateMap};
use crate::config::RemovedPolicy;
use crate::transcript::{ChangeSet, SourceSnapshot};

use super::PipelineError;

/// Shared call-state map backed by a [`CheckpointStore`].
#[derive(Debug)]
pub struct Ledger {
    store: CheckpointStore,
    states: Mutex<StateMap>,
}

impl Ledger {
    /// Wrap previously loaded `states`.
    pub fn new(store: CheckpointStore, states: StateMap) -> Self {
        Self {
            store,
            states: Mutex::new(states),
        }
    }

    /// The underlying store.
    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    /// Copy of the current states.
    pub async fn snapshot(&self) -> StateMap {
        self.states.lock().await.clone()
    }

    /// Apply `f` to the state of `call_id` in memory only.
    ///
    /// Returns `false` if the call is unknown.
    pub async fn mark<F>(&self, call_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut CallState),
    {
        let mut states = self.states.lock().await;
        match states.get_mut(call_id) {
            Some(state) => {
                f(state);
                true
            }
            None => false,
        }
    }

    /// Apply `f` to the state of `call_id` and commit the whole map.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError::UnknownCall`] if the call is not tracked, or a
    /// checkpoint error if the commit fails.
    pub async fn commit_outcome<F>(&self, call_id: &str, f: F) -> Result<(), PipelineError>
    where
        F: FnOnce(&mut CallState),
    {
        let mut states = self.states.lock().await;
        let state = states
            .get_mut(call_id)
            .ok_or_else(|| PipelineError::UnknownCall(call_id.to_owned()))?;
        f(state);
        self.persist(&states).await
    }

    /// Reconcile the states with a fresh source snapshot and commit if
    /// anything changed.
    ///
    /// Added calls become `pending`; modified calls are reset; removed calls
    /// are kept or dropped according to `policy`.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if the commit fails.
    pub async fn apply_changes(
        &self,
        snapshot: &SourceSnapshot,
        changes: &ChangeSet,
        policy: RemovedPolicy,
    ) -> Result<(), PipelineError> {
        let mut states = self.states.lock().await;
        let mut dirty = false;

        for id in &changes.added {
            if let Some(digest) = snapshot.digest(id) {
                states.insert(id.clone(), CallState::pending(id.clone(), digest));
                dirty = true;
            }
        }

        for id in &changes.modified {
            if let (Some(state), Some(digest)) = (states.get_mut(id), snapshot.digest(id)) {
                info!(call_id = %id, "source transcript changed, discarding previous result");
                state.reset_for_source(digest);
                dirty = true;
            }
        }

        // Adopt digests for states written without one.
        for id in &changes.unchanged {
            if let (Some(state), Some(digest)) = (states.get_mut(id), snapshot.digest(id)) {
                if state.source_digest.is_none() {
                    state.source_digest = Some(digest.to_owned());
                    dirty = true;
                }
            }
        }

        if !changes.removed.is_empty() {
            match policy {
                RemovedPolicy::Retain => {
                    info!(
                        removed = changes.removed.len(),
                        "transcripts removed from source, retaining their records"
                    );
                }
                RemovedPolicy::Purge => {
                    for id in &changes.removed {
                        states.remove(id);
                    }
                    info!(
                        removed = changes.removed.len(),
                        "transcripts removed from source, purging their records"
                    );
                    dirty = true;
                }
            }
        }

        if dirty {
            self.persist(&states).await?;
        }
        Ok(())
    }

    /// Run the backup health check against `expected_ids` on the blocking pool.
    ///
    /// # Errors
    ///
    /// Returns a checkpoint error if the backup cannot be removed.
    pub async fn verify_and_prune_backup(
        &self,
        expected_ids: BTreeSet<String>,
    ) -> Result<BackupVerdict, PipelineError> {
        // Hold the lock so no commit races the verification.
        let _states = self.states.lock().await;
        let store = self.store.clone();
        let verdict =
            tokio::task::spawn_blocking(move || store.verify_and_prune_backup(&expected_ids))
                .await
                .map_err(|e| PipelineError::Join(e.to_string()))??;
        Ok(verdict)
    }

    async fn persist(&self, states: &StateMap) -> Result<(), PipelineError> {
        let store = self.store.clone();
        let states = states.clone();
        let calls = states.len();
        tokio::task::spawn_blocking(move || store.commit(&states))
            .await
            .map_err(|e| PipelineError::Join(e.to_string()))??;
        debug!(calls, "ledger committed");
        Ok(())
    }
}

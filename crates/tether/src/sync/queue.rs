//! Durable, priority-ordered operation queue

use chrono::{DateTime, Utc};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::operation::{OperationId, SyncOperation};
use crate::storage::EntryStore;

/// Pending operations and conflicts share one entry, so moving an
/// operation between them is a single write
const QUEUE_KEY: &str = "sync/queue";

/// An operation set aside until someone decides how to resolve it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlaggedConflict {
    pub operation: SyncOperation,
    /// The remote's version, as reported by the transport
    pub remote: Value,
    pub flagged_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
struct QueueState {
    pending: Vec<SyncOperation>,
    conflicts: Vec<FlaggedConflict>,
}

/// Pending operations and flagged conflicts, persisted in a dedicated
/// [`EntryStore`] after every change.
///
/// Not synchronized; the engine holds it behind a lock.
pub struct DurableQueue {
    store: EntryStore,
    state: QueueState,
}

impl DurableQueue {
    /// Load the persisted queue, starting empty if nothing was saved
    pub fn open(store: EntryStore) -> Self {
        let state: QueueState = store.retrieve_serde(QUEUE_KEY).unwrap_or_default();

        if !state.pending.is_empty() || !state.conflicts.is_empty() {
            info!(
                "[SYNC] Restored {} pending operations and {} conflicts",
                state.pending.len(),
                state.conflicts.len()
            );
        }

        let mut queue = Self { store, state };
        queue.sort();
        queue
    }

    /// Ascending priority; stable, so equal priorities stay FIFO
    fn sort(&mut self) {
        self.state.pending.sort_by_key(|op| op.priority);
    }

    /// Write the queue through to disk. Returns false on failure.
    pub fn persist(&self) -> bool {
        let saved = self.store.store_serde(QUEUE_KEY, &self.state, None);
        if !saved {
            warn!("[SYNC] Failed to persist sync queue; changes are in memory only");
        }
        saved
    }

    pub fn push(&mut self, operation: SyncOperation) {
        self.state.pending.push(operation);
        self.sort();
    }

    pub fn pending(&self) -> &[SyncOperation] {
        &self.state.pending
    }

    pub fn len(&self) -> usize {
        self.state.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.pending.is_empty()
    }

    pub fn remove(&mut self, id: &OperationId) -> Option<SyncOperation> {
        let index = self.state.pending.iter().position(|op| &op.id == id)?;
        Some(self.state.pending.remove(index))
    }

    /// Replace an operation in place, keeping its position
    pub fn update(&mut self, operation: SyncOperation) -> bool {
        match self.state.pending.iter_mut().find(|op| op.id == operation.id) {
            Some(slot) => {
                *slot = operation;
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) -> usize {
        let removed = self.state.pending.len();
        self.state.pending.clear();
        removed
    }

    /// Move a pending operation aside as a conflict
    pub fn flag_conflict(&mut self, id: &OperationId, remote: Value) -> bool {
        let Some(operation) = self.remove(id) else {
            return false;
        };
        self.state.conflicts.push(FlaggedConflict {
            operation,
            remote,
            flagged_at: Utc::now(),
        });
        true
    }

    pub fn take_conflict(&mut self, id: &OperationId) -> Option<FlaggedConflict> {
        let index = self.state.conflicts.iter().position(|c| &c.operation.id == id)?;
        Some(self.state.conflicts.remove(index))
    }

    pub fn conflicts(&self) -> &[FlaggedConflict] {
        &self.state.conflicts
    }
}

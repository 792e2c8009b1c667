//! Durable state handle for a node slot.
//!
//! A [`Persister`] holds two byte blobs: the node's raft state (term, vote,
//! log) and its latest snapshot. Nodes treat it as their disk; the harness
//! keeps it across crashes so the next instance of the slot restarts from the
//! last persisted state.
//!
//! Clones share storage. [`Persister::copy`] produces an independent handle,
//! which is what the harness gives a restarted node so that a lingering
//! writer from the killed instance cannot touch the new instance's state.

use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Default, Clone)]
struct PersistedState {
    raft_state: Vec<u8>,
    snapshot: Vec<u8>,
}

/// Shared in-memory durable storage for one node.
#[derive(Debug, Default, Clone)]
pub struct Persister {
    inner: Arc<Mutex<PersistedState>>,
}

impl Persister {
    /// Create an empty persister.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, PersistedState> {
        // State is two plain blobs, so a poisoned lock still holds valid data.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create an independent handle holding the same bytes.
    pub fn copy(&self) -> Self {
        let state = self.lock().clone();
        Self {
            inner: Arc::new(Mutex::new(state)),
        }
    }

    /// Read the persisted raft state.
    pub fn read_raft_state(&self) -> Vec<u8> {
        self.lock().raft_state.clone()
    }

    /// Read the persisted snapshot.
    pub fn read_snapshot(&self) -> Vec<u8> {
        self.lock().snapshot.clone()
    }

    /// Replace the raft state, keeping the current snapshot.
    pub fn save_raft_state(&self, raft_state: Vec<u8>) {
        self.lock().raft_state = raft_state;
    }

    /// Atomically replace both the raft state and the snapshot.
    pub fn save(&self, raft_state: Vec<u8>, snapshot: Vec<u8>) {
        let mut state = self.lock();
        state.raft_state = raft_state;
        state.snapshot = snapshot;
    }

    /// Size of the persisted raft state in bytes.
    pub fn raft_state_size(&self) -> usize {
        self.lock().raft_state.len()
    }

    /// Size of the persisted snapshot in bytes.
    pub fn snapshot_size(&self) -> usize {
        self.lock().snapshot.len()
    }
}

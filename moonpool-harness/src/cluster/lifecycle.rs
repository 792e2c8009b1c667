//! Node lifecycle: start, crash, restart.
//!
//! A node "crash" cannot really stop code that is already running inside the
//! old instance, so every restart isolates the new instance instead:
//!
//! - fresh, never reused client end names, so messages addressed to the old
//!   instance's ends never reach the new one;
//! - a copy of the persister, so a still-running writer from the old
//!   instance cannot change what the new one reads;
//! - a fresh apply channel and listener; the old listener drains until the
//!   old instance drops its sender, and ignores everything it reads because
//!   the slot's generation moved on.

use std::sync::Arc;

use rand::Rng;
use rand::distr::Alphanumeric;
use tokio::sync::mpsc;

use super::ClusterHarness;
use super::listener;
use crate::error::HarnessResult;
use crate::network::RpcService;
use crate::node::{ConsensusNode, NodeFactory};
use crate::persister::Persister;
use crate::types::NodeId;

const IDENTITY_LEN: usize = 20;

/// A collision-resistant client end name.
fn random_identity() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(IDENTITY_LEN)
        .map(char::from)
        .collect()
}

impl<F: NodeFactory> ClusterHarness<F> {
    /// Start or restart the node in slot `node`.
    ///
    /// An existing instance is crashed first. The new instance gets fresh
    /// client ends (disabled until [`connect`](Self::connect)), a copy of
    /// the slot's persister and a new listener. If the persister holds a
    /// snapshot, the shadow log is primed from it before the node starts.
    ///
    /// # Errors
    ///
    /// - [`InvalidNode`](crate::HarnessError::InvalidNode) if `node` is out of range.
    /// - Snapshot errors if the persisted snapshot cannot be ingested.
    pub fn start_node(&self, node: NodeId) -> HarnessResult<()> {
        self.crash(node)?;

        let n = self.config.servers;
        let names: Vec<String> = (0..n).map(|_| random_identity()).collect();
        let peers = names
            .iter()
            .enumerate()
            .map(|(peer, name)| {
                let end = self.net.make_end(name.as_str());
                self.net.connect(name, peer);
                end
            })
            .collect();

        let (persister, generation) = {
            let mut state = self.shared.lock();
            state.generations[node] += 1;
            let generation = state.generations[node];
            state.end_names[node] = Some(names);
            state.shadow.set_last_applied(node, 0);

            let persister = match state.saved[node].as_ref().map(Persister::copy) {
                Some(persister) => {
                    let snapshot = persister.read_snapshot();
                    if !snapshot.is_empty() {
                        state.shadow.ingest_snapshot(node, &snapshot, None)?;
                    }
                    persister
                }
                None => Persister::new(),
            };
            state.saved[node] = Some(persister.clone());
            (persister, generation)
        };

        let (apply_tx, apply_rx) = mpsc::channel(self.config.apply_channel_capacity.max(1));
        let instance = self.factory.make(peers, node, persister, apply_tx);

        let handle = listener::spawn(
            self.shared.clone(),
            node,
            generation,
            &instance,
            apply_rx,
            self.config.listener,
            self.config.snapshot_interval,
        );
        {
            let mut state = self.shared.lock();
            state.nodes[node] = Some(instance.clone());
            // The previous listener keeps draining its channel but no longer
            // touches the slot, since its generation is stale.
            state.listeners[node] = Some(handle);
        }

        let service: Arc<dyn RpcService> = instance;
        self.net.add_server(node, service);
        tracing::debug!(node, "node started");
        Ok(())
    }

    /// Crash the node in slot `node`, keeping its persisted state.
    ///
    /// The slot is disconnected, its inbound service removed and the node
    /// killed. Crashing an empty slot only re-copies its persister.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidNode`](crate::HarnessError::InvalidNode) if `node`
    /// is out of range.
    pub fn crash(&self, node: NodeId) -> HarnessResult<()> {
        self.disconnect(node)?;
        self.net.delete_server(node);

        let instance = {
            let mut state = self.shared.lock();
            // Copy so a lingering writer in the old instance cannot reach the
            // handle the next instance will read.
            if let Some(saved) = state.saved[node].as_ref().map(Persister::copy) {
                state.saved[node] = Some(saved);
            }
            state.nodes[node].take()
        };

        if let Some(instance) = instance {
            instance.kill();
            tracing::debug!(node, "node crashed");
        }
        Ok(())
    }
}

//! The cluster harness.
//!
//! [`ClusterHarness`] owns every per-slot piece of state (node handle,
//! persister, connectivity, client end names, shadow log) and coordinates:
//!
//! - **lifecycle** ([`start_node`](ClusterHarness::start_node),
//!   [`crash`](ClusterHarness::crash)): fresh identities and persister
//!   copies on every restart,
//! - **listeners**: one task per live node draining its apply channel into
//!   the shadow logs,
//! - **faults** ([`connect`](ClusterHarness::connect),
//!   [`disconnect`](ClusterHarness::disconnect),
//!   [`set_unreliable`](ClusterHarness::set_unreliable), ...),
//! - **agreement** ([`submit_and_confirm`](ClusterHarness::submit_and_confirm),
//!   [`check_one_leader`](ClusterHarness::check_one_leader), ...).
//!
//! ## Locking
//!
//! All shared state lives behind one mutex. It is never held across a call
//! into a node or across an `.await`; node handles are cloned out first.

mod agreement;
mod faults;
mod lifecycle;
mod listener;

use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::HarnessConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::network::SimNetwork;
use crate::node::{ConsensusNode, NodeFactory};
use crate::persister::Persister;
use crate::shadow::ShadowLogs;
use crate::types::{Command, LogIndex, NodeId};

pub use agreement::WaitOutcome;

/// Per-scenario measurements, produced by [`ClusterHarness::end`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScenarioReport {
    /// Description passed to [`ClusterHarness::begin`].
    pub description: String,
    /// Wall-clock time since `begin`.
    pub elapsed: Duration,
    /// Number of node slots.
    pub peers: usize,
    /// RPCs sent since `begin`.
    pub rpcs: usize,
    /// Request bytes sent since `begin`.
    pub bytes: u64,
    /// Agreements reported since `begin` (growth of the max committed index).
    pub commands: LogIndex,
}

struct Baseline {
    description: String,
    started: Instant,
    rpcs: usize,
    bytes: u64,
    max_index: LogIndex,
}

struct ClusterState<N> {
    nodes: Vec<Option<Arc<N>>>,
    saved: Vec<Option<Persister>>,
    connected: Vec<bool>,
    end_names: Vec<Option<Vec<String>>>,
    shadow: ShadowLogs,
    apply_errors: Vec<Option<HarnessError>>,
    listeners: Vec<Option<JoinHandle<()>>>,
    /// Bumped on every start; listeners of older instances only drain.
    generations: Vec<u64>,
    baseline: Option<Baseline>,
}

/// State reachable from listener tasks.
struct Shared<N> {
    state: Mutex<ClusterState<N>>,
}

impl<N> Shared<N> {
    fn lock(&self) -> MutexGuard<'_, ClusterState<N>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Store a listener-detected failure; the first one per node wins.
    ///
    /// Failures seen by the listener of a replaced instance are dropped.
    fn record_error(&self, node: NodeId, generation: u64, err: HarnessError) {
        let mut state = self.lock();
        if state.generations[node] != generation {
            return;
        }
        tracing::error!(node, error = %err, "apply error");
        if state.apply_errors[node].is_none() {
            state.apply_errors[node] = Some(err);
        }
    }
}

/// A cluster of consensus nodes under test.
///
/// Created once per scenario with [`build`](Self::build) and torn down with
/// [`cleanup`](Self::cleanup). All lifecycle and fault operations must be
/// called from within a Tokio runtime, since they spawn listener tasks.
pub struct ClusterHarness<F: NodeFactory> {
    config: HarnessConfig,
    factory: F,
    net: SimNetwork,
    shared: Arc<Shared<F::Node>>,
    finished: CancellationToken,
    created: Instant,
    /// Slot after which the next proposal round starts.
    next_start: AtomicUsize,
}

impl<F: NodeFactory> ClusterHarness<F> {
    /// Start `config.servers` nodes and connect them all.
    ///
    /// # Errors
    ///
    /// Propagates any failure from [`start_node`](Self::start_node).
    pub fn build(config: HarnessConfig, factory: F) -> HarnessResult<Self> {
        let n = config.servers;
        let net = SimNetwork::new(config.network.clone());
        let state = ClusterState {
            nodes: vec![None; n],
            saved: vec![None; n],
            connected: vec![false; n],
            end_names: vec![None; n],
            shadow: ShadowLogs::new(n),
            apply_errors: vec![None; n],
            listeners: (0..n).map(|_| None).collect(),
            generations: vec![0; n],
            baseline: None,
        };
        let harness = Self {
            config,
            factory,
            net,
            shared: Arc::new(Shared {
                state: Mutex::new(state),
            }),
            finished: CancellationToken::new(),
            created: Instant::now(),
            next_start: AtomicUsize::new(0),
        };

        harness.set_unreliable(harness.config.unreliable);
        harness.set_long_delays(harness.config.long_delays);

        tracing::info!(
            servers = n,
            unreliable = harness.config.unreliable,
            listener = ?harness.config.listener,
            "building cluster"
        );
        for i in 0..n {
            harness.start_node(i)?;
        }
        for i in 0..n {
            harness.connect(i)?;
        }
        Ok(harness)
    }

    /// Number of node slots.
    pub fn servers(&self) -> usize {
        self.config.servers
    }

    /// The configuration this cluster was built with.
    pub fn config(&self) -> &HarnessConfig {
        &self.config
    }

    /// The simulated network.
    pub fn network(&self) -> &SimNetwork {
        &self.net
    }

    fn check_node(&self, node: NodeId) -> HarnessResult<()> {
        if node < self.config.servers {
            Ok(())
        } else {
            Err(HarnessError::InvalidNode {
                node,
                servers: self.config.servers,
            })
        }
    }

    /// The live node in slot `node`, or `None` while it is crashed.
    pub fn node(&self, node: NodeId) -> Option<Arc<F::Node>> {
        self.shared.lock().nodes.get(node).cloned().flatten()
    }

    /// Whether slot `node` is currently connected.
    pub fn is_connected(&self, node: NodeId) -> bool {
        self.shared
            .lock()
            .connected
            .get(node)
            .copied()
            .unwrap_or(false)
    }

    /// The persister currently associated with slot `node`.
    ///
    /// Writes through the returned handle are visible to the next instance
    /// started in that slot.
    pub fn persister(&self, node: NodeId) -> Option<Persister> {
        self.shared.lock().saved.get(node).cloned().flatten()
    }

    /// The command `node` reported at `index`, if any.
    pub fn shadow_entry(&self, node: NodeId, index: LogIndex) -> Option<Command> {
        self.check_node(node).ok()?;
        self.shared.lock().shadow.log(node).get(index).cloned()
    }

    /// Every index recorded in the shadow log of `node`, ascending.
    pub fn shadow_indices(&self, node: NodeId) -> Vec<LogIndex> {
        if self.check_node(node).is_err() {
            return Vec::new();
        }
        self.shared.lock().shadow.log(node).indices().collect()
    }

    /// Last index `node` applied, as tracked by the snapshot-aware listener
    /// or set by snapshot ingestion.
    pub fn last_applied(&self, node: NodeId) -> LogIndex {
        if self.check_node(node).is_err() {
            return 0;
        }
        self.shared.lock().shadow.last_applied(node)
    }

    /// Highest index any node reported as committed.
    pub fn max_index(&self) -> LogIndex {
        self.shared.lock().shadow.max_index()
    }

    /// The failure a listener recorded for `node`, if any.
    pub fn apply_error(&self, node: NodeId) -> Option<HarnessError> {
        self.shared.lock().apply_errors.get(node).cloned().flatten()
    }

    /// RPCs delivered to the current instance of slot `node`.
    pub fn rpc_count(&self, node: NodeId) -> usize {
        self.net.rpc_count(node)
    }

    /// RPCs sent on the network since it was created.
    pub fn rpc_total(&self) -> usize {
        self.net.total_count()
    }

    /// Request bytes sent on the network since it was created.
    pub fn bytes_total(&self) -> u64 {
        self.net.total_bytes()
    }

    /// Largest persisted raft state across all slots, in bytes.
    pub fn log_size(&self) -> usize {
        self.shared
            .lock()
            .saved
            .iter()
            .flatten()
            .map(Persister::raft_state_size)
            .max()
            .unwrap_or(0)
    }

    /// Whether [`cleanup`](Self::cleanup) has been called.
    pub fn check_finished(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Enforce the real-time ceiling of the scenario.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::ScenarioTimeout`] once the cluster has existed
    /// longer than `scenario_limit`.
    pub fn check_timeout(&self) -> HarnessResult<()> {
        if self.created.elapsed() > self.config.scenario_limit {
            return Err(HarnessError::ScenarioTimeout {
                limit: self.config.scenario_limit,
            });
        }
        Ok(())
    }

    /// Start measuring a scenario.
    pub fn begin(&self, description: impl Into<String>) {
        let description = description.into();
        tracing::info!(%description, "scenario begin");
        let rpcs = self.rpc_total();
        let bytes = self.bytes_total();
        let mut state = self.shared.lock();
        let max_index = state.shadow.max_index();
        state.baseline = Some(Baseline {
            description,
            started: Instant::now(),
            rpcs,
            bytes,
            max_index,
        });
    }

    /// Finish a scenario and report what it cost.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::ScenarioTimeout`] if the ceiling was exceeded.
    pub fn end(&self) -> HarnessResult<ScenarioReport> {
        self.check_timeout()?;
        let rpcs = self.rpc_total();
        let bytes = self.bytes_total();
        let state = self.shared.lock();
        let max_index = state.shadow.max_index();
        let report = match &state.baseline {
            Some(b) => ScenarioReport {
                description: b.description.clone(),
                elapsed: b.started.elapsed(),
                peers: self.config.servers,
                rpcs: rpcs.saturating_sub(b.rpcs),
                bytes: bytes.saturating_sub(b.bytes),
                commands: max_index.saturating_sub(b.max_index),
            },
            None => ScenarioReport {
                description: String::new(),
                elapsed: self.created.elapsed(),
                peers: self.config.servers,
                rpcs,
                bytes,
                commands: max_index,
            },
        };
        tracing::info!(
            description = %report.description,
            elapsed = ?report.elapsed,
            peers = report.peers,
            rpcs = report.rpcs,
            bytes = report.bytes,
            commands = report.commands,
            "scenario passed"
        );
        Ok(report)
    }

    /// Tear the cluster down: stop retries, kill every node, close the
    /// network and stop the listeners.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::ScenarioTimeout`] if the ceiling was exceeded.
    pub fn cleanup(&self) -> HarnessResult<()> {
        self.finished.cancel();
        let (nodes, listeners): (Vec<_>, Vec<_>) = {
            let mut state = self.shared.lock();
            let nodes = state.nodes.iter().flatten().cloned().collect();
            let listeners = state.listeners.iter_mut().filter_map(Option::take).collect();
            (nodes, listeners)
        };
        for node in nodes {
            node.kill();
        }
        self.net.cleanup();
        for listener in listeners {
            listener.abort();
        }
        tracing::info!("cluster cleaned up");
        self.check_timeout()
    }
}

impl<F: NodeFactory> Drop for ClusterHarness<F> {
    fn drop(&mut self) {
        if !self.finished.is_cancelled() {
            // Best effort: stop background activity if the scenario bailed out early.
            let _ = self.cleanup();
        }
    }
}

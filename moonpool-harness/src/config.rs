//! # Harness Configuration
//!
//! | Parameter | Field | Default | Used by |
//! |-----------|-------|---------|---------|
//! | Cluster size | `servers` | 3 | everything |
//! | Message loss | `unreliable` | false | network |
//! | Long timeouts to unreachable peers | `long_delays` | true | network |
//! | Listener mode | `listener` | `Plain` | apply listeners |
//! | Snapshot cadence | `snapshot_interval` | 10 | snapshot-aware listener |
//! | Apply channel capacity | `apply_channel_capacity` | 64 | lifecycle |
//! | Scenario ceiling | `scenario_limit` | 120s | `check_timeout` |
//! | Agreement budget | `agreement_budget` | 10s | `submit_and_confirm` |
//! | Commit window | `commit_window` | 2s | `submit_and_confirm` |
//! | Commit poll | `commit_poll` | 20ms | `submit_and_confirm` |
//! | Leader retry | `leader_retry` | 50ms | `submit_and_confirm` |
//! | Leader polls | `leader_polls` | 10 | `check_one_leader` |
//! | Leader poll interval | `leader_poll_interval` | 450-550ms | `check_one_leader` |
//! | Wait attempts | `wait_attempts` | 30 | `wait_for_commit` |
//! | Wait backoff | `wait_initial_backoff`..`wait_max_backoff` | 10ms..1s | `wait_for_commit` |
//!
//! ```rust
//! use moonpool_harness::{HarnessConfig, ListenerMode};
//!
//! let config = HarnessConfig::new(5)
//!     .with_unreliable(true)
//!     .with_listener(ListenerMode::SnapshotAware);
//! assert_eq!(config.servers, 5);
//! assert_eq!(config.snapshot_interval, 10);
//! ```

use std::ops::Range;
use std::time::Duration;

use crate::network::NetworkConfiguration;

/// How apply listeners validate notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ListenerMode {
    /// Check committed commands only; snapshot notifications are ignored.
    #[default]
    Plain,
    /// Also ingest installed snapshots, require strictly consecutive
    /// indices, and periodically ask nodes to compact their logs.
    SnapshotAware,
}

/// Configuration for a [`ClusterHarness`](crate::ClusterHarness).
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    /// Number of node slots.
    pub servers: usize,
    /// Start with message loss and short delays enabled.
    pub unreliable: bool,
    /// Start with long timeouts for calls to unreachable peers.
    pub long_delays: bool,
    /// Listener mode used for every node.
    pub listener: ListenerMode,
    /// Take a snapshot whenever `(index + 1) % snapshot_interval == 0`.
    pub snapshot_interval: u64,
    /// Capacity of each node's apply channel.
    pub apply_channel_capacity: usize,
    /// Real-time ceiling for a whole scenario.
    pub scenario_limit: Duration,
    /// Outer budget for one `submit_and_confirm`.
    pub agreement_budget: Duration,
    /// How long to wait for an accepted proposal to commit.
    pub commit_window: Duration,
    /// Poll interval inside `commit_window`.
    pub commit_poll: Duration,
    /// Pause when no node accepted a proposal.
    pub leader_retry: Duration,
    /// Number of polls `check_one_leader` makes.
    pub leader_polls: usize,
    /// Sleep between `check_one_leader` polls.
    pub leader_poll_interval: Range<Duration>,
    /// Number of attempts `wait_for_commit` makes.
    pub wait_attempts: usize,
    /// First `wait_for_commit` backoff.
    pub wait_initial_backoff: Duration,
    /// Backoff stops doubling once it reaches this value.
    pub wait_max_backoff: Duration,
    /// Simulated network parameters.
    pub network: NetworkConfiguration,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            servers: 3,
            unreliable: false,
            long_delays: true,
            listener: ListenerMode::Plain,
            snapshot_interval: 10,
            apply_channel_capacity: 64,
            scenario_limit: Duration::from_secs(120),
            agreement_budget: Duration::from_secs(10),
            commit_window: Duration::from_secs(2),
            commit_poll: Duration::from_millis(20),
            leader_retry: Duration::from_millis(50),
            leader_polls: 10,
            leader_poll_interval: Duration::from_millis(450)..Duration::from_millis(550),
            wait_attempts: 30,
            wait_initial_backoff: Duration::from_millis(10),
            wait_max_backoff: Duration::from_secs(1),
            network: NetworkConfiguration::default(),
        }
    }
}

impl HarnessConfig {
    /// Default configuration for `servers` nodes.
    pub fn new(servers: usize) -> Self {
        Self {
            servers,
            ..Self::default()
        }
    }

    /// Start the network unreliable.
    pub fn with_unreliable(mut self, unreliable: bool) -> Self {
        self.unreliable = unreliable;
        self
    }

    /// Start with or without long delays.
    pub fn with_long_delays(mut self, long_delays: bool) -> Self {
        self.long_delays = long_delays;
        self
    }

    /// Choose the listener mode.
    pub fn with_listener(mut self, listener: ListenerMode) -> Self {
        self.listener = listener;
        self
    }

    /// Shorthand for [`ListenerMode::SnapshotAware`].
    pub fn with_snapshots(self) -> Self {
        self.with_listener(ListenerMode::SnapshotAware)
    }

    /// Change the snapshot cadence. Values below 1 are treated as 1.
    pub fn with_snapshot_interval(mut self, interval: u64) -> Self {
        self.snapshot_interval = interval.max(1);
        self
    }

    /// Replace the simulated network parameters.
    pub fn with_network(mut self, network: NetworkConfiguration) -> Self {
        self.network = network;
        self
    }

    /// Change the leader polling schedule.
    pub fn with_leader_polling(mut self, polls: usize, interval: Range<Duration>) -> Self {
        self.leader_polls = polls;
        self.leader_poll_interval = interval;
        self
    }

    /// Change the agreement budgets.
    pub fn with_agreement_budget(mut self, budget: Duration, commit_window: Duration) -> Self {
        self.agreement_budget = budget;
        self.commit_window = commit_window;
        self
    }

    /// Change the scenario ceiling.
    pub fn with_scenario_limit(mut self, limit: Duration) -> Self {
        self.scenario_limit = limit;
        self
    }
}

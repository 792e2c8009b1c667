//! # Moonpool Harness
//!
//! Fault-injection and invariant-checking harness for replicated-log
//! (consensus) implementations.
//!
//! The harness does not implement consensus. It drives a cluster of opaque
//! [`ConsensusNode`] instances over a [`SimNetwork`], injects failures
//! (crashes, restarts, partitions, unreliable, delayed and reordered
//! delivery) and continuously checks the safety properties every correct
//! implementation must uphold:
//!
//! - **Agreement**: no two nodes commit different commands at the same index.
//! - **In-order delivery**: committed entries are applied one index at a time.
//! - **Snapshot consistency**: an installed snapshot matches the index that
//!   announced it.
//! - **Single leader per term**: at most one connected node claims leadership
//!   in any given term.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                      ClusterHarness                          │
//! │  lifecycle (start/crash)   faults (connect/unreliable/...)   │
//! │  agreement (submit_and_confirm, check_one_leader, ...)       │
//! ├──────────────────────┬───────────────────┬───────────────────┤
//! │  ShadowLog per node  │  listener tasks   │  Persister copies │
//! │  (cross-node checks) │  (drain applyCh)  │  (crash isolation)│
//! ├──────────────────────┴───────────────────┴───────────────────┤
//! │            SimNetwork (ends, servers, drop/delay)            │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use moonpool_harness::{ClusterHarness, Command, HarnessConfig};
//!
//! let cluster = ClusterHarness::build(HarnessConfig::new(3), MyRaftFactory)?;
//! cluster.begin("basic agreement");
//! let index = cluster.submit_and_confirm(Command::from("x"), 3, false).await?;
//! assert_eq!(cluster.count_committed(index)?.0, 3);
//! cluster.end()?;
//! cluster.cleanup()?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod network;
pub mod node;
pub mod persister;
pub mod shadow;
pub mod snapshot;
pub mod types;

pub use cluster::{ClusterHarness, ScenarioReport, WaitOutcome};
pub use config::{HarnessConfig, ListenerMode};
pub use error::{HarnessError, HarnessResult};
pub use network::{NetworkConfiguration, PeerLink, RpcService, SimNetwork};
pub use node::{ConsensusNode, NodeFactory};
pub use persister::Persister;
pub use shadow::{ShadowLog, ShadowLogs};
pub use snapshot::{CodecError, SnapshotImage, decode_snapshot, encode_snapshot};
pub use types::{ApplyMsg, Command, LogIndex, NodeId, Proposal, Term};

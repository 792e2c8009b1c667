//! The node collaborator interface.
//!
//! The harness treats a consensus implementation as an opaque capability:
//! anything that can accept proposals, report its term and leadership, take
//! a compaction hint and be stopped can be tested. Nodes reach their peers
//! through [`PeerLink`]s and receive calls by implementing [`RpcService`].
//!
//! ## Raft mapping
//!
//! | Method | Raft |
//! |--------|------|
//! | [`ConsensusNode::propose`] | `Start(command)` |
//! | [`ConsensusNode::state`] | `GetState()` |
//! | [`ConsensusNode::snapshot`] | `Snapshot(index, bytes)` |
//! | [`ConsensusNode::kill`] | `Kill()` |

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::network::{PeerLink, RpcService};
use crate::persister::Persister;
use crate::types::{ApplyMsg, Command, LogIndex, NodeId, Proposal, Term};

/// A single replica of the consensus implementation under test.
///
/// None of these methods may block waiting on the network or on the apply
/// channel; the harness calls them from its polling loops.
pub trait ConsensusNode: RpcService {
    /// Start agreement on `command`.
    ///
    /// Returns immediately. A proposal with `is_leader == false` tells the
    /// caller to try another node.
    fn propose(&self, command: Command) -> Proposal;

    /// Current term and whether this node believes it is leader.
    fn state(&self) -> (Term, bool);

    /// The service has snapshotted everything up to and including `index`;
    /// the node may discard that prefix of its log.
    fn snapshot(&self, index: LogIndex, snapshot: Vec<u8>);

    /// Stop all background activity. Must be idempotent.
    fn kill(&self);
}

/// Constructs node instances for the harness.
pub trait NodeFactory: Send + Sync + 'static {
    /// The node type produced.
    type Node: ConsensusNode;

    /// Build a node for slot `me`.
    ///
    /// `peers[j]` reaches slot `j` (including `peers[me]`). The node must
    /// restore its state from `persister` and deliver every committed entry,
    /// in order, on `apply_tx`.
    fn make(
        &self,
        peers: Vec<PeerLink>,
        me: NodeId,
        persister: Persister,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Arc<Self::Node>;
}

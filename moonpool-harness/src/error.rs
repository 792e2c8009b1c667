//! Error types for the harness.
//!
//! Every failure the harness can report falls into one of three groups:
//!
//! | Group | Variants | Retried? |
//! |-------|----------|----------|
//! | Safety violation | `DivergentCommit`, `OutOfOrderApply`, `MissingPredecessor`, `SnapshotIndexMismatch`, `MultipleLeaders`, `TermDisagreement`, `UnexpectedLeader`, `CommittedValueMismatch` | never |
//! | Snapshot payload | `MissingSnapshot`, `SnapshotDecode` | never |
//! | Liveness | `NoLeader`, `InsufficientCommits`, `AgreementFailed`, `ScenarioTimeout` | only inside `submit_and_confirm` with retry |
//! | Usage | `Cancelled`, `InvalidNode` | n/a |
//!
//! A node that merely turns out not to be leader, or a term that advances
//! while waiting for a commit, is not an error.

use std::time::Duration;

use thiserror::Error;

use crate::snapshot::CodecError;
use crate::types::{Command, LogIndex, NodeId, Term};

/// Errors reported by the harness.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HarnessError {
    /// Two nodes committed different commands at the same index.
    #[error("commit index={index} server={node} {command} != server={other} {other_command}")]
    DivergentCommit {
        /// The index both nodes committed.
        index: LogIndex,
        /// Node applying the new entry.
        node: NodeId,
        /// Command it applied.
        command: Command,
        /// Node that had already committed the index.
        other: NodeId,
        /// Command that node committed.
        other_command: Command,
    },

    /// A node applied an entry that does not follow its previous one.
    #[error("server {node} apply out of order, expected index {expected}, got {got}")]
    OutOfOrderApply {
        /// Offending node.
        node: NodeId,
        /// Index the harness expected next.
        expected: LogIndex,
        /// Index the node applied.
        got: LogIndex,
    },

    /// A node applied an entry whose predecessor it never applied.
    #[error("server {node} apply out of order {index}")]
    MissingPredecessor {
        /// Offending node.
        node: NodeId,
        /// Index applied without its predecessor.
        index: LogIndex,
    },

    /// An installed snapshot covers a different index than announced.
    #[error("server {node} snapshot covers index {decoded}, but was announced at {announced}")]
    SnapshotIndexMismatch {
        /// Offending node.
        node: NodeId,
        /// Index carried by the apply notification.
        announced: LogIndex,
        /// Index decoded from the snapshot payload.
        decoded: LogIndex,
    },

    /// More than one connected node claims leadership in one term.
    #[error("term {term} has {} (>1) leaders: {leaders:?}", .leaders.len())]
    MultipleLeaders {
        /// The contested term.
        term: Term,
        /// Every node claiming leadership in it.
        leaders: Vec<NodeId>,
    },

    /// Connected nodes report different terms.
    #[error("servers disagree on term: server {node} has {term}, server {other} has {other_term}")]
    TermDisagreement {
        /// First node seen.
        node: NodeId,
        /// Its term.
        term: Term,
        /// Node that disagrees.
        other: NodeId,
        /// Its term.
        other_term: Term,
    },

    /// A connected node claims leadership when none was expected.
    #[error("expected no leader among connected servers, but {node} claims to be leader")]
    UnexpectedLeader {
        /// The node claiming leadership.
        node: NodeId,
    },

    /// Nodes hold different commands at an index being counted.
    #[error("committed values do not match: index {index}, {expected}, {found}")]
    CommittedValueMismatch {
        /// The index being counted.
        index: LogIndex,
        /// First value seen.
        expected: Command,
        /// Conflicting value.
        found: Command,
    },

    /// A snapshot was expected but the payload is empty.
    #[error("server {node}: nil snapshot")]
    MissingSnapshot {
        /// Node whose snapshot was empty.
        node: NodeId,
    },

    /// A snapshot payload could not be decoded.
    #[error("server {node}: snapshot decode error: {source}")]
    SnapshotDecode {
        /// Node whose snapshot failed to decode.
        node: NodeId,
        /// Underlying codec failure.
        #[source]
        source: CodecError,
    },

    /// No node claimed leadership within the polling budget.
    #[error("expected one leader, got none")]
    NoLeader,

    /// Fewer nodes than required committed an index.
    #[error("only {committed} decided for index {index}; wanted {wanted}")]
    InsufficientCommits {
        /// The index waited on.
        index: LogIndex,
        /// Nodes that committed it.
        committed: usize,
        /// Nodes required.
        wanted: usize,
    },

    /// `submit_and_confirm` gave up.
    #[error("one({command}) failed to reach agreement")]
    AgreementFailed {
        /// The command that was submitted.
        command: Command,
    },

    /// The scenario exceeded its real-time ceiling.
    #[error("test took longer than {limit:?}")]
    ScenarioTimeout {
        /// The configured ceiling.
        limit: Duration,
    },

    /// The harness was cleaned up while an operation was retrying.
    #[error("harness finished before {command} reached agreement")]
    Cancelled {
        /// The command that was being submitted.
        command: Command,
    },

    /// A node slot outside `0..n` was addressed.
    #[error("no such server {node} (cluster has {servers})")]
    InvalidNode {
        /// Requested slot.
        node: NodeId,
        /// Cluster size.
        servers: usize,
    },
}

impl HarnessError {
    /// Whether this error is a violation of a consensus safety property.
    ///
    /// Safety violations must never be retried.
    pub fn is_safety_violation(&self) -> bool {
        matches!(
            self,
            Self::DivergentCommit { .. }
                | Self::OutOfOrderApply { .. }
                | Self::MissingPredecessor { .. }
                | Self::SnapshotIndexMismatch { .. }
                | Self::MultipleLeaders { .. }
                | Self::TermDisagreement { .. }
                | Self::UnexpectedLeader { .. }
                | Self::CommittedValueMismatch { .. }
        )
    }

    /// Whether this error reports a liveness timeout.
    pub fn is_liveness_timeout(&self) -> bool {
        matches!(
            self,
            Self::NoLeader
                | Self::InsufficientCommits { .. }
                | Self::AgreementFailed { .. }
                | Self::ScenarioTimeout { .. }
        )
    }
}

/// Result alias for harness operations.
pub type HarnessResult<T> = Result<T, HarnessError>;

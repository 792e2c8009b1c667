//! Core types shared between the harness and the nodes it drives.
//!
//! - [`Command`]: opaque command value replicated through the log
//! - [`ApplyMsg`]: notification a node emits when it commits an entry or
//!   installs a snapshot
//! - [`Proposal`]: result of submitting a command to a node

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Position in the replicated log. The first real entry is at index 1.
pub type LogIndex = u64;

/// Consensus epoch number.
pub type Term = u64;

/// Index of a node slot in the cluster, `0..n`.
pub type NodeId = usize;

/// An opaque command value.
///
/// The harness only compares commands for equality and prints them in
/// failure messages, so any JSON-representable value works. Strings and
/// integers convert directly:
///
/// ```
/// use moonpool_harness::Command;
///
/// assert_eq!(Command::from("x"), Command::from("x".to_string()));
/// assert_ne!(Command::from(1u64), Command::from("1"));
/// ```
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct Command(Value);

impl Command {
    /// The placeholder stored at index 0 of a snapshot image.
    pub const fn null() -> Self {
        Self(Value::Null)
    }

    /// Wrap an arbitrary JSON value.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Whether this is the null placeholder.
    pub fn is_null(&self) -> bool {
        self.0.is_null()
    }

    /// Borrow the underlying value.
    pub fn value(&self) -> &Value {
        &self.0
    }
}

impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for Command {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl From<u64> for Command {
    fn from(n: u64) -> Self {
        Self(Value::from(n))
    }
}

impl From<i64> for Command {
    fn from(n: i64) -> Self {
        Self(Value::from(n))
    }
}

/// Notification emitted by a node on its apply channel.
///
/// The harness only ever consumes these; nodes produce them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// An entry became committed and is being applied.
    Command {
        /// Log index of the entry. Must be exactly one past the previous
        /// applied index, except right after a snapshot install.
        index: LogIndex,
        /// The committed command.
        command: Command,
    },
    /// The node installed a snapshot received from a leader.
    Snapshot {
        /// Last log index covered by the snapshot.
        index: LogIndex,
        /// Term of the entry at `index`.
        term: Term,
        /// Encoded snapshot image.
        data: Vec<u8>,
    },
}

/// Result of [`ConsensusNode::propose`](crate::ConsensusNode::propose).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Proposal {
    /// Index the command will occupy if it is ever committed.
    pub index: LogIndex,
    /// The node's current term.
    pub term: Term,
    /// `false` means the node is not leader; try another node.
    pub is_leader: bool,
}

impl Proposal {
    /// A rejection from a node that does not believe it is leader.
    pub const fn rejected(term: Term) -> Self {
        Self {
            index: 0,
            term,
            is_leader: false,
        }
    }
}

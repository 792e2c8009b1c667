//! Shadow logs: the harness-side record of what each node committed.
//!
//! Every committed entry a node reports is recorded in that node's
//! [`ShadowLog`] and compared against every other node's record at the same
//! index. This is where the agreement invariant is enforced:
//!
//! > For any index `k` and nodes `i`, `j` that both hold an entry at `k`,
//! > the entries are equal.
//!
//! Snapshots re-base a node's shadow log: the whole mapping is replaced with
//! the snapshot's entries and the node's last-applied index jumps to the
//! snapshot's index.
//!
//! [`ShadowLogs`] is not synchronized on its own. The cluster keeps it behind
//! its single lock, so the O(n) cross-node check never races with another
//! listener.

use std::collections::BTreeMap;

use crate::error::{HarnessError, HarnessResult};
use crate::snapshot::{SnapshotImage, decode_snapshot};
use crate::types::{Command, LogIndex, NodeId};

/// Committed entries reported by one node, keyed by log index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShadowLog {
    entries: BTreeMap<LogIndex, Command>,
}

impl ShadowLog {
    /// Create an empty shadow log.
    pub fn new() -> Self {
        Self::default()
    }

    /// The command recorded at `index`, if any.
    pub fn get(&self, index: LogIndex) -> Option<&Command> {
        self.entries.get(&index)
    }

    /// Whether an entry is recorded at `index`.
    pub fn contains(&self, index: LogIndex) -> bool {
        self.entries.contains_key(&index)
    }

    /// Number of recorded entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Recorded indices in ascending order.
    pub fn indices(&self) -> impl Iterator<Item = LogIndex> + '_ {
        self.entries.keys().copied()
    }

    fn insert(&mut self, index: LogIndex, command: Command) {
        self.entries.insert(index, command);
    }

    fn from_image(image: SnapshotImage) -> Self {
        let entries = image
            .entries
            .into_iter()
            .enumerate()
            .map(|(j, command)| (j as LogIndex, command))
            .collect();
        Self { entries }
    }

    /// Entries `0..=index`, with the null placeholder for missing ones.
    fn prefix(&self, index: LogIndex) -> Vec<Command> {
        (0..=index)
            .map(|j| self.entries.get(&j).cloned().unwrap_or_default())
            .collect()
    }
}

/// Shadow logs and last-applied indices for every node of a cluster.
#[derive(Debug, Clone)]
pub struct ShadowLogs {
    logs: Vec<ShadowLog>,
    last_applied: Vec<LogIndex>,
    max_index: LogIndex,
}

impl ShadowLogs {
    /// Empty shadow logs for `servers` nodes.
    pub fn new(servers: usize) -> Self {
        Self {
            logs: vec![ShadowLog::new(); servers],
            last_applied: vec![0; servers],
            max_index: 0,
        }
    }

    /// The shadow log of `node`.
    ///
    /// # Panics
    ///
    /// Panics if `node` is out of range.
    pub fn log(&self, node: NodeId) -> &ShadowLog {
        &self.logs[node]
    }

    /// Highest index any node has reported as committed.
    pub fn max_index(&self) -> LogIndex {
        self.max_index
    }

    /// Last index `node` applied, or the index of its last snapshot.
    pub fn last_applied(&self, node: NodeId) -> LogIndex {
        self.last_applied[node]
    }

    /// Overwrite the last-applied index of `node`.
    pub fn set_last_applied(&mut self, node: NodeId, index: LogIndex) {
        self.last_applied[node] = index;
    }

    /// Record that `node` committed `command` at `index`.
    ///
    /// The entry is recorded even if it diverges, so later checks see what
    /// the node actually applied.
    ///
    /// Returns whether `index - 1` was already recorded for `node`, which
    /// the caller uses to detect out-of-order application.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::DivergentCommit`] if another node committed a
    /// different command at `index`.
    pub fn check_logs(
        &mut self,
        node: NodeId,
        index: LogIndex,
        command: &Command,
    ) -> HarnessResult<bool> {
        let mut divergence = None;
        for (other, log) in self.logs.iter().enumerate() {
            if let Some(old) = log.get(index) {
                if old != command {
                    tracing::error!(
                        node,
                        other,
                        index,
                        %command,
                        %old,
                        "divergent commit"
                    );
                    divergence = Some(HarnessError::DivergentCommit {
                        index,
                        node,
                        command: command.clone(),
                        other,
                        other_command: old.clone(),
                    });
                }
            }
        }

        let previous_present = index
            .checked_sub(1)
            .is_some_and(|prev| self.logs[node].contains(prev));
        self.logs[node].insert(index, command.clone());
        if index > self.max_index {
            self.max_index = index;
        }

        match divergence {
            Some(err) => Err(err),
            None => Ok(previous_present),
        }
    }

    /// Replace the shadow log of `node` with the contents of a snapshot.
    ///
    /// `expected` is the index announced alongside the snapshot, or `None`
    /// when the snapshot is read back from persisted state.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::MissingSnapshot`] if `data` is empty.
    /// - [`HarnessError::SnapshotDecode`] if `data` is not a snapshot image.
    /// - [`HarnessError::SnapshotIndexMismatch`] if the decoded index
    ///   differs from `expected`.
    pub fn ingest_snapshot(
        &mut self,
        node: NodeId,
        data: &[u8],
        expected: Option<LogIndex>,
    ) -> HarnessResult<LogIndex> {
        if data.is_empty() {
            return Err(HarnessError::MissingSnapshot { node });
        }
        let image =
            decode_snapshot(data).map_err(|source| HarnessError::SnapshotDecode { node, source })?;
        if let Some(announced) = expected {
            if announced != image.last_included_index {
                return Err(HarnessError::SnapshotIndexMismatch {
                    node,
                    announced,
                    decoded: image.last_included_index,
                });
            }
        }

        let index = image.last_included_index;
        tracing::debug!(node, index, entries = image.entries.len(), "ingested snapshot");
        self.logs[node] = ShadowLog::from_image(image);
        self.last_applied[node] = index;
        Ok(index)
    }

    /// Build the snapshot image of `node` through `index`.
    pub fn snapshot_image(&self, node: NodeId, index: LogIndex) -> SnapshotImage {
        SnapshotImage::new(index, self.logs[node].prefix(index))
    }

    /// How many nodes recorded an entry at `index`, and what it is.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::CommittedValueMismatch`] if two nodes hold
    /// different commands at `index`.
    pub fn committed(&self, index: LogIndex) -> HarnessResult<(usize, Option<Command>)> {
        let mut count = 0;
        let mut value: Option<&Command> = None;
        for log in &self.logs {
            if let Some(command) = log.get(index) {
                if let Some(expected) = value {
                    if expected != command {
                        return Err(HarnessError::CommittedValueMismatch {
                            index,
                            expected: expected.clone(),
                            found: command.clone(),
                        });
                    }
                }
                count += 1;
                value = Some(command);
            }
        }
        Ok((count, value.cloned()))
    }
}

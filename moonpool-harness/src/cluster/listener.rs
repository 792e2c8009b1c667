//! Apply-channel listeners.
//!
//! One task per live node drains its apply channel and feeds the shadow
//! logs. A listener never stops on a validation failure: it records the
//! failure in the node's error slot and keeps reading, so a node blocked on
//! a full channel can never deadlock behind a broken check. The failure
//! surfaces the next time `count_committed` runs.

use std::sync::{Arc, Weak};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::Shared;
use crate::config::ListenerMode;
use crate::error::{HarnessError, HarnessResult};
use crate::node::ConsensusNode;
use crate::snapshot::encode_snapshot;
use crate::types::{ApplyMsg, Command, LogIndex, NodeId};

/// Start the listener for instance `generation` of slot `node`.
///
/// Only a weak handle to the instance is kept, so a killed node is dropped
/// once the harness forgets it.
pub(super) fn spawn<N: ConsensusNode>(
    shared: Arc<Shared<N>>,
    node: NodeId,
    generation: u64,
    instance: &Arc<N>,
    apply_rx: mpsc::Receiver<ApplyMsg>,
    mode: ListenerMode,
    snapshot_interval: u64,
) -> JoinHandle<()> {
    let listener = Listener {
        shared,
        node,
        generation,
    };
    match mode {
        ListenerMode::Plain => tokio::spawn(listener.plain(apply_rx)),
        ListenerMode::SnapshotAware => tokio::spawn(listener.snapshot_aware(
            Arc::downgrade(instance),
            apply_rx,
            snapshot_interval,
        )),
    }
}

/// Map a missing predecessor to a failure.
fn require_predecessor(
    node: NodeId,
    index: LogIndex,
    checked: HarnessResult<bool>,
) -> HarnessResult<()> {
    let previous_present = checked?;
    if index > 1 && !previous_present {
        return Err(HarnessError::MissingPredecessor { node, index });
    }
    Ok(())
}

/// Whether `index` is the last entry of a snapshot period.
fn ends_period(index: LogIndex, interval: u64) -> bool {
    index
        .checked_add(1)
        .is_some_and(|next| next % interval.max(1) == 0)
}

struct Listener<N> {
    shared: Arc<Shared<N>>,
    node: NodeId,
    generation: u64,
}

impl<N: ConsensusNode> Listener<N> {
    async fn plain(self, mut apply_rx: mpsc::Receiver<ApplyMsg>) {
        let node = self.node;
        while let Some(msg) = apply_rx.recv().await {
            let ApplyMsg::Command { index, command } = msg else {
                continue;
            };
            let checked = {
                let mut state = self.shared.lock();
                if state.generations[node] != self.generation {
                    continue;
                }
                state.shadow.check_logs(node, index, &command)
            };
            if let Err(err) = require_predecessor(node, index, checked) {
                self.shared.record_error(node, self.generation, err);
            }
        }
        tracing::trace!(node, "plain listener exiting");
    }

    async fn snapshot_aware(
        self,
        instance: Weak<N>,
        mut apply_rx: mpsc::Receiver<ApplyMsg>,
        snapshot_interval: u64,
    ) {
        let node = self.node;
        while let Some(msg) = apply_rx.recv().await {
            let outcome = match msg {
                ApplyMsg::Snapshot { index, data, .. } => {
                    let mut state = self.shared.lock();
                    if state.generations[node] != self.generation {
                        continue;
                    }
                    state
                        .shadow
                        .ingest_snapshot(node, &data, Some(index))
                        .map(|_| ())
                }
                ApplyMsg::Command { index, command } => {
                    self.apply_command(&instance, index, &command, snapshot_interval)
                }
            };
            if let Err(err) = outcome {
                self.shared.record_error(node, self.generation, err);
            }
        }
        tracing::trace!(node, "snapshot listener exiting");
    }

    fn apply_command(
        &self,
        instance: &Weak<N>,
        index: LogIndex,
        command: &Command,
        snapshot_interval: u64,
    ) -> HarnessResult<()> {
        let node = self.node;
        let (outcome, image) = {
            let mut state = self.shared.lock();
            if state.generations[node] != self.generation {
                return Ok(());
            }
            let last_applied = state.shadow.last_applied(node);
            let outcome = match last_applied.checked_add(1) {
                Some(expected) if expected == index => {
                    let checked = state.shadow.check_logs(node, index, command);
                    require_predecessor(node, index, checked)
                }
                expected => Err(HarnessError::OutOfOrderApply {
                    node,
                    expected: expected.unwrap_or(last_applied),
                    got: index,
                }),
            };
            if outcome.is_ok() {
                state.shadow.set_last_applied(node, index);
            }
            let image = ends_period(index, snapshot_interval)
                .then(|| state.shadow.snapshot_image(node, index));
            (outcome, image)
        };

        let (Some(image), Some(instance)) = (image, instance.upgrade()) else {
            return outcome;
        };
        match encode_snapshot(&image) {
            Ok(data) => {
                tracing::debug!(node, index, "requesting log compaction");
                instance.snapshot(index, data);
            }
            Err(err) => tracing::warn!(node, index, error = %err, "failed to encode snapshot"),
        }
        outcome
    }
}

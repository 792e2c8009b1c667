//! Agreement orchestration and cluster-wide leadership assertions.
//!
//! Everything here polls: node state is sampled with the cluster lock
//! released, and waits are plain sleeps that end early once the harness is
//! cleaned up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};

use super::ClusterHarness;
use crate::error::{HarnessError, HarnessResult};
use crate::network::sample_duration;
use crate::node::{ConsensusNode, NodeFactory};
use crate::types::{Command, LogIndex, NodeId, Term};

/// Result of [`ClusterHarness::wait_for_commit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Enough nodes committed the index; carries the committed command.
    Committed(Option<Command>),
    /// Some node moved past the observed term, so the proposal may have
    /// been superseded. Not a failure.
    TermMoved,
}

/// Double `current`, never past `max`.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    current.saturating_mul(2).min(max)
}

impl<F: NodeFactory> ClusterHarness<F> {
    /// Live nodes in connected slots, cloned out of the lock.
    fn connected_nodes(&self) -> Vec<(NodeId, Arc<F::Node>)> {
        let state = self.shared.lock();
        state
            .nodes
            .iter()
            .enumerate()
            .filter(|(i, _)| state.connected[*i])
            .filter_map(|(i, node)| node.clone().map(|node| (i, node)))
            .collect()
    }

    fn live_nodes(&self) -> Vec<Arc<F::Node>> {
        self.shared.lock().nodes.iter().flatten().cloned().collect()
    }

    /// Sleep for `duration` unless the harness finishes first.
    async fn pause(&self, duration: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = self.finished.cancelled() => {}
        }
    }

    /// Find the unique leader among connected nodes.
    ///
    /// Polls up to `leader_polls` times, sleeping a random
    /// `leader_poll_interval` before each poll. Returns the leader of the
    /// highest term seen in the first poll that finds any leader.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::MultipleLeaders`] if a term has two leaders.
    /// - [`HarnessError::NoLeader`] if no poll finds a leader.
    pub async fn check_one_leader(&self) -> HarnessResult<NodeId> {
        for _ in 0..self.config.leader_polls {
            self.pause(sample_duration(&self.config.leader_poll_interval))
                .await;

            let mut leaders: BTreeMap<Term, Vec<NodeId>> = BTreeMap::new();
            for (i, node) in self.connected_nodes() {
                let (term, is_leader) = node.state();
                if is_leader {
                    leaders.entry(term).or_default().push(i);
                }
            }

            for (term, nodes) in &leaders {
                if nodes.len() > 1 {
                    tracing::error!(term, leaders = ?nodes, "multiple leaders");
                    return Err(HarnessError::MultipleLeaders {
                        term: *term,
                        leaders: nodes.clone(),
                    });
                }
            }

            if let Some((term, nodes)) = leaders.iter().next_back() {
                tracing::debug!(term, leader = nodes[0], "found leader");
                return Ok(nodes[0]);
            }
        }
        Err(HarnessError::NoLeader)
    }

    /// The term every connected node agrees on, or `None` if no node is
    /// connected.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::TermDisagreement`] if two connected nodes
    /// report different terms.
    pub fn check_terms(&self) -> HarnessResult<Option<Term>> {
        let mut seen: Option<(NodeId, Term)> = None;
        for (i, node) in self.connected_nodes() {
            let (term, _) = node.state();
            match seen {
                None => seen = Some((i, term)),
                Some((first, first_term)) if first_term != term => {
                    return Err(HarnessError::TermDisagreement {
                        node: first,
                        term: first_term,
                        other: i,
                        other_term: term,
                    });
                }
                Some(_) => {}
            }
        }
        Ok(seen.map(|(_, term)| term))
    }

    /// Assert that no connected node believes it is leader.
    ///
    /// # Errors
    ///
    /// Returns [`HarnessError::UnexpectedLeader`] naming the first
    /// connected node that claims leadership.
    pub fn check_no_leader(&self) -> HarnessResult<()> {
        for (i, node) in self.connected_nodes() {
            if node.state().1 {
                return Err(HarnessError::UnexpectedLeader { node: i });
            }
        }
        Ok(())
    }

    /// How many nodes committed `index`, and the command they agree on.
    ///
    /// # Errors
    ///
    /// - Any failure a listener recorded, lowest slot first.
    /// - [`HarnessError::CommittedValueMismatch`] if nodes disagree at
    ///   `index`.
    pub fn count_committed(&self, index: LogIndex) -> HarnessResult<(usize, Option<Command>)> {
        let state = self.shared.lock();
        if let Some(err) = state.apply_errors.iter().flatten().next() {
            return Err(err.clone());
        }
        state.shadow.committed(index)
    }

    /// Wait until at least `needed` nodes committed `index`.
    ///
    /// Backs off exponentially between polls. When `start_term` is given
    /// and any live node reaches a later term, gives up with
    /// [`WaitOutcome::TermMoved`] since the proposal may have been lost.
    ///
    /// # Errors
    ///
    /// - [`HarnessError::InsufficientCommits`] if too few nodes committed
    ///   after the last attempt.
    /// - Anything [`count_committed`](Self::count_committed) reports.
    pub async fn wait_for_commit(
        &self,
        index: LogIndex,
        needed: usize,
        start_term: Option<Term>,
    ) -> HarnessResult<WaitOutcome> {
        let mut backoff = self.config.wait_initial_backoff;
        for _ in 0..self.config.wait_attempts {
            let (committed, _) = self.count_committed(index)?;
            if committed >= needed {
                break;
            }
            self.pause(backoff).await;
            backoff = next_backoff(backoff, self.config.wait_max_backoff);
            if let Some(start_term) = start_term {
                let moved = self
                    .live_nodes()
                    .iter()
                    .any(|node| node.state().0 > start_term);
                if moved {
                    tracing::debug!(index, start_term, "term moved while waiting");
                    return Ok(WaitOutcome::TermMoved);
                }
            }
        }

        let (committed, command) = self.count_committed(index)?;
        if committed < needed {
            return Err(HarnessError::InsufficientCommits {
                index,
                committed,
                wanted: needed,
            });
        }
        Ok(WaitOutcome::Committed(command))
    }

    /// Drive `command` to agreement on at least `needed` nodes.
    ///
    /// Offers the command to connected nodes in round-robin order until one
    /// accepts it as leader, then polls for the commit. Gives up after
    /// `agreement_budget`.
    ///
    /// | Phase | Step |
    /// |-------|------|
    /// | searching | propose to each connected node; pause `leader_retry` if none accepts |
    /// | accepted | poll every `commit_poll` for `commit_window` |
    /// | window expired | fail, or search again when `retry` is set |
    ///
    /// # Errors
    ///
    /// - [`HarnessError::AgreementFailed`] if the window or budget runs out.
    /// - [`HarnessError::Cancelled`] if the harness finished first.
    /// - Any safety violation surfaced by
    ///   [`count_committed`](Self::count_committed).
    pub async fn submit_and_confirm(
        &self,
        command: Command,
        needed: usize,
        retry: bool,
    ) -> HarnessResult<LogIndex> {
        let started = Instant::now();
        let servers = self.config.servers;

        while started.elapsed() < self.config.agreement_budget && !self.check_finished() {
            let mut accepted = None;
            for _ in 0..servers {
                let slot = (self.next_start.load(Ordering::Relaxed) + 1) % servers;
                self.next_start.store(slot, Ordering::Relaxed);
                let node = {
                    let state = self.shared.lock();
                    if state.connected[slot] {
                        state.nodes[slot].clone()
                    } else {
                        None
                    }
                };
                let Some(node) = node else {
                    continue;
                };
                let proposal = node.propose(command.clone());
                if proposal.is_leader {
                    tracing::trace!(slot, index = proposal.index, term = proposal.term, "proposal accepted");
                    accepted = Some(proposal.index);
                    break;
                }
            }

            let Some(index) = accepted else {
                self.pause(self.config.leader_retry).await;
                continue;
            };

            let window = Instant::now();
            while window.elapsed() < self.config.commit_window {
                let (committed, value) = self.count_committed(index)?;
                if committed > 0 && committed >= needed && value.as_ref() == Some(&command) {
                    tracing::debug!(index, %command, committed, "agreement reached");
                    return Ok(index);
                }
                self.pause(self.config.commit_poll).await;
                if self.check_finished() {
                    break;
                }
            }

            if self.check_finished() {
                break;
            }
            if !retry {
                return Err(HarnessError::AgreementFailed { command });
            }
            self.pause(self.config.leader_retry).await;
        }

        if self.check_finished() {
            return Err(HarnessError::Cancelled { command });
        }
        Err(HarnessError::AgreementFailed { command })
    }
}

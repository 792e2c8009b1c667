//! Network fault injection.
//!
//! Connectivity is controlled per slot by enabling or disabling client ends:
//! slot `i` owns `end_names[i][j]` (its outbound end towards `j`), and reaches
//! `i` inbound through `end_names[j][i]`.
//!
//! | Operation | Outbound ends of `i` | Inbound ends towards `i` |
//! |-----------|----------------------|--------------------------|
//! | `disconnect(i)` | all off | all off |
//! | `connect(i)` | on towards connected peers | on from connected peers |

use super::ClusterHarness;
use crate::error::HarnessResult;
use crate::node::NodeFactory;
use crate::types::NodeId;

impl<F: NodeFactory> ClusterHarness<F> {
    /// Attach slot `node` to the network.
    ///
    /// Only links to and from peers that are themselves connected are
    /// enabled, so a partition between other slots is preserved.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidNode`](crate::HarnessError::InvalidNode) if `node`
    /// is out of range.
    pub fn connect(&self, node: NodeId) -> HarnessResult<()> {
        self.check_node(node)?;
        let links = {
            let mut state = self.shared.lock();
            state.connected[node] = true;
            let mut links = Vec::new();
            for peer in 0..self.config.servers {
                if !state.connected[peer] {
                    continue;
                }
                if let Some(names) = &state.end_names[node] {
                    links.push(names[peer].clone());
                }
                if let Some(names) = &state.end_names[peer] {
                    links.push(names[node].clone());
                }
            }
            links
        };
        for name in &links {
            self.net.enable(name, true);
        }
        tracing::debug!(node, "connect");
        Ok(())
    }

    /// Detach slot `node` from the network in both directions.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidNode`](crate::HarnessError::InvalidNode) if `node`
    /// is out of range.
    pub fn disconnect(&self, node: NodeId) -> HarnessResult<()> {
        self.check_node(node)?;
        let links = {
            let mut state = self.shared.lock();
            state.connected[node] = false;
            let mut links = Vec::new();
            for peer in 0..self.config.servers {
                if let Some(names) = &state.end_names[node] {
                    links.push(names[peer].clone());
                }
                if let Some(names) = &state.end_names[peer] {
                    links.push(names[node].clone());
                }
            }
            links
        };
        for name in &links {
            self.net.enable(name, false);
        }
        tracing::debug!(node, "disconnect");
        Ok(())
    }

    /// Toggle message loss and short delays on the whole network.
    pub fn set_unreliable(&self, unreliable: bool) {
        tracing::debug!(unreliable, "set network reliability");
        self.net.set_reliable(!unreliable);
    }

    /// Toggle long timeouts for calls to unreachable peers.
    pub fn set_long_delays(&self, long_delays: bool) {
        tracing::debug!(long_delays, "set long delays");
        self.net.set_long_delays(long_delays);
    }

    /// Toggle long random delays on replies.
    pub fn set_long_reordering(&self, long_reordering: bool) {
        tracing::debug!(long_reordering, "set long reordering");
        self.net.set_long_reordering(long_reordering);
    }

    /// Remove the inbound service of slot `node` without killing it.
    ///
    /// # Errors
    ///
    /// Returns [`InvalidNode`](crate::HarnessError::InvalidNode) if `node`
    /// is out of range.
    pub fn remove_server(&self, node: NodeId) -> HarnessResult<()> {
        self.check_node(node)?;
        self.net.delete_server(node);
        Ok(())
    }
}

//! Simulated RPC network used between nodes.
//!
//! See [`SimNetwork`] for delivery semantics and [`NetworkConfiguration`]
//! for the magnitudes of each fault mode.

mod config;
mod sim;

pub use config::{NetworkConfiguration, sample_duration};
pub use sim::{PeerLink, RpcService, SimNetwork};

//! In-memory RPC network with controllable faults.
//!
//! Nodes talk to each other through named client ends ([`PeerLink`]). Each
//! end is bound to a target server slot and can be enabled or disabled
//! independently, which is how the harness partitions nodes: disabling every
//! end into and out of a slot isolates it completely.
//!
//! A call resolves to `None` whenever the request or reply is lost. Lost
//! calls do not fail instantly: they take a random timeout first, like a
//! real network would.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

use super::config::{NetworkConfiguration, sample_duration};
use crate::types::NodeId;

/// Server-side handler for calls arriving over the network.
#[async_trait]
pub trait RpcService: Send + Sync + 'static {
    /// Handle one request. Returning `None` is equivalent to a lost reply.
    async fn handle(&self, method: &str, args: Vec<u8>) -> Option<Vec<u8>>;
}

struct EndState {
    server: Option<NodeId>,
    enabled: bool,
}

struct ServerEntry {
    service: Arc<dyn RpcService>,
    generation: u64,
    count: usize,
}

#[derive(Default)]
struct NetState {
    reliable: bool,
    long_delays: bool,
    long_reordering: bool,
    finished: bool,
    ends: HashMap<String, EndState>,
    servers: HashMap<NodeId, ServerEntry>,
    next_generation: u64,
    total_count: usize,
    total_bytes: u64,
}

/// Why a call never reached a server.
enum Lost {
    Finished,
    Unreachable { long_delays: bool },
}

/// Where a call is routed, captured under the lock.
struct Route {
    server: NodeId,
    generation: u64,
    service: Arc<dyn RpcService>,
}

/// Simulated network shared by every node of a cluster.
///
/// Cloning yields another handle to the same network.
#[derive(Clone)]
pub struct SimNetwork {
    state: Arc<Mutex<NetState>>,
    config: Arc<NetworkConfiguration>,
}

impl Default for SimNetwork {
    fn default() -> Self {
        Self::new(NetworkConfiguration::default())
    }
}

impl SimNetwork {
    /// Create a reliable network with no ends and no servers.
    pub fn new(config: NetworkConfiguration) -> Self {
        let state = NetState {
            reliable: true,
            ..NetState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            config: Arc::new(config),
        }
    }

    fn lock(&self) -> MutexGuard<'_, NetState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Create a client end. It starts disabled and bound to no server.
    pub fn make_end(&self, name: impl Into<String>) -> PeerLink {
        let name = name.into();
        let mut state = self.lock();
        if state.ends.contains_key(&name) {
            tracing::warn!(end = %name, "client end created twice, resetting it");
        }
        state.ends.insert(
            name.clone(),
            EndState {
                server: None,
                enabled: false,
            },
        );
        PeerLink {
            name,
            net: self.clone(),
        }
    }

    /// Bind a client end to a server slot.
    pub fn connect(&self, name: &str, server: NodeId) {
        if let Some(end) = self.lock().ends.get_mut(name) {
            end.server = Some(server);
        }
    }

    /// Enable or disable a client end.
    pub fn enable(&self, name: &str, enabled: bool) {
        if let Some(end) = self.lock().ends.get_mut(name) {
            end.enabled = enabled;
        }
    }

    /// Toggle message loss and short delays.
    pub fn set_reliable(&self, reliable: bool) {
        self.lock().reliable = reliable;
    }

    /// Toggle long timeouts for calls to unreachable servers.
    pub fn set_long_delays(&self, long_delays: bool) {
        self.lock().long_delays = long_delays;
    }

    /// Toggle long random delays on replies.
    pub fn set_long_reordering(&self, long_reordering: bool) {
        self.lock().long_reordering = long_reordering;
    }

    /// Register the inbound service of a slot, replacing any previous one.
    pub fn add_server(&self, id: NodeId, service: Arc<dyn RpcService>) {
        let mut state = self.lock();
        state.next_generation += 1;
        let generation = state.next_generation;
        state.servers.insert(
            id,
            ServerEntry {
                service,
                generation,
                count: 0,
            },
        );
    }

    /// Remove the inbound service of a slot. In-flight replies are discarded.
    pub fn delete_server(&self, id: NodeId) {
        self.lock().servers.remove(&id);
    }

    /// Requests delivered to the current service of slot `id`.
    pub fn rpc_count(&self, id: NodeId) -> usize {
        self.lock().servers.get(&id).map_or(0, |s| s.count)
    }

    /// Requests sent on the network, delivered or not.
    pub fn total_count(&self) -> usize {
        self.lock().total_count
    }

    /// Request payload bytes sent on the network.
    pub fn total_bytes(&self) -> u64 {
        self.lock().total_bytes
    }

    /// Tear the network down. Later calls fail immediately.
    pub fn cleanup(&self) {
        let mut state = self.lock();
        state.finished = true;
        state.servers.clear();
    }

    fn route(&self, name: &str, args_len: usize) -> Result<Route, Lost> {
        let mut state = self.lock();
        if state.finished {
            return Err(Lost::Finished);
        }
        state.total_count += 1;
        state.total_bytes += args_len as u64;
        let long_delays = state.long_delays;

        let target = match state.ends.get(name) {
            Some(EndState {
                server: Some(server),
                enabled: true,
            }) => *server,
            _ => return Err(Lost::Unreachable { long_delays }),
        };
        match state.servers.get_mut(&target) {
            Some(entry) => {
                entry.count += 1;
                Ok(Route {
                    server: target,
                    generation: entry.generation,
                    service: entry.service.clone(),
                })
            }
            None => Err(Lost::Unreachable { long_delays }),
        }
    }

    fn is_alive(&self, name: &str, route: &Route) -> bool {
        let state = self.lock();
        let end_ok = state
            .ends
            .get(name)
            .is_some_and(|e| e.enabled && e.server == Some(route.server));
        let server_ok = state
            .servers
            .get(&route.server)
            .is_some_and(|s| s.generation == route.generation);
        !state.finished && end_ok && server_ok
    }

    fn modes(&self) -> (bool, bool) {
        let state = self.lock();
        (state.reliable, state.long_reordering)
    }

    async fn deliver(&self, name: &str, method: &str, args: Vec<u8>) -> Option<Vec<u8>> {
        let route = match self.route(name, args.len()) {
            Ok(route) => route,
            Err(Lost::Finished) => return None,
            Err(Lost::Unreachable { long_delays }) => {
                let range = if long_delays {
                    &self.config.long_unreachable_delay
                } else {
                    &self.config.unreachable_delay
                };
                tokio::time::sleep(sample_duration(range)).await;
                return None;
            }
        };

        let (reliable, _) = self.modes();
        if !reliable {
            tokio::time::sleep(sample_duration(&self.config.short_delay)).await;
            if chance(self.config.request_drop_probability) {
                tracing::trace!(end = name, method, "request dropped");
                return None;
            }
        }

        let service = route.service.clone();
        let method_owned = method.to_string();
        let mut handler =
            tokio::spawn(async move { service.handle(&method_owned, args).await });

        // The handler keeps running if the server goes away; its reply is discarded.
        let reply = loop {
            tokio::select! {
                res = &mut handler => break res.ok().flatten(),
                _ = tokio::time::sleep(self.config.liveness_poll) => {
                    if !self.is_alive(name, &route) {
                        return None;
                    }
                }
            }
        };

        if !self.is_alive(name, &route) {
            return None;
        }
        let (reliable, long_reordering) = self.modes();
        if !reliable && chance(self.config.reply_drop_probability) {
            tracing::trace!(end = name, method, "reply dropped");
            return None;
        }
        if long_reordering && chance(self.config.reorder_probability) {
            tokio::time::sleep(self.reorder_delay()).await;
        }
        reply
    }

    fn reorder_delay(&self) -> Duration {
        let spread = self.config.reorder_spread.as_millis() as u64;
        let mut rng = rand::rng();
        let bound = rng.random_range(1..=spread.max(1));
        self.config.reorder_base + Duration::from_millis(rng.random_range(0..bound))
    }
}

fn chance(probability: f64) -> bool {
    rand::rng().random_bool(probability.clamp(0.0, 1.0))
}

/// A named client end from one node towards one peer slot.
#[derive(Clone)]
pub struct PeerLink {
    name: String,
    net: SimNetwork,
}

impl PeerLink {
    /// The end's globally unique name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send a request and wait for the reply.
    ///
    /// Returns `None` if the request or reply was lost, the target is
    /// unreachable, or the handler returned nothing.
    pub async fn call(&self, method: &str, args: Vec<u8>) -> Option<Vec<u8>> {
        self.net.deliver(&self.name, method, args).await
    }
}

impl std::fmt::Debug for PeerLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerLink").field("name", &self.name).finish()
    }
}

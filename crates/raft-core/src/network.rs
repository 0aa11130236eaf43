//! # network
//!
//! why: run whole clusters inside one process with controllable faults
//! relations: implements transport.rs, delivers to node.rs handlers; used by tests and raft-sim
//! what: LocalNetwork (registry, partitions, unreliable mode), Endpoint

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use rand::Rng;
use tracing::trace;

use crate::error::TransportError;
use crate::message::{NodeId, RaftMessage};
use crate::node::RaftNode;
use crate::transport::Transport;

/// Chance out of 1000 that an unreliable network loses a request or a reply.
const DROP_PER_MILLE: u32 = 100;
/// Upper bound of the extra latency an unreliable network adds.
const UNRELIABLE_DELAY_MS: u64 = 27;
/// Upper bound of the wait before a call to or from a disconnected node fails.
const UNREACHABLE_DELAY_MS: u64 = 50;

#[derive(Default)]
struct NetworkState {
    nodes: RwLock<HashMap<NodeId, Weak<RaftNode>>>,
    connected: RwLock<HashSet<NodeId>>,
    unreliable: AtomicBool,
    rpc_count: AtomicU64,
}

impl NetworkState {
    fn is_connected(&self, id: NodeId) -> bool {
        self.connected.read().contains(&id)
    }

    fn should_drop(&self) -> bool {
        self.unreliable.load(Ordering::Relaxed)
            && rand::thread_rng().gen_range(0..1000) < DROP_PER_MILLE
    }
}

/// An in-process message bus between [`RaftNode`]s.
///
/// Nodes are registered by id and start out connected. A message gets
/// through only if both ends are connected when it is sent, and its reply
/// only if both are still connected when the handler returns.
///
/// Cloning is cheap and every clone controls the same network.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    state: Arc<NetworkState>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// The transport a node with `id` uses to reach its peers.
    pub fn endpoint(&self, id: NodeId) -> Arc<dyn Transport> {
        Arc::new(Endpoint {
            from: id,
            state: Arc::clone(&self.state),
        })
    }

    /// Route messages for `node.id()` to `node`, replacing an earlier registration.
    pub fn register(&self, node: &Arc<RaftNode>) {
        let id = node.id();
        self.state.nodes.write().insert(id, Arc::downgrade(node));
        self.state.connected.write().insert(id);
    }

    pub fn unregister(&self, id: NodeId) {
        self.state.nodes.write().remove(&id);
        self.state.connected.write().remove(&id);
    }

    pub fn connect(&self, id: NodeId) {
        trace!(node = id, "connected");
        self.state.connected.write().insert(id);
    }

    pub fn disconnect(&self, id: NodeId) {
        trace!(node = id, "disconnected");
        self.state.connected.write().remove(&id);
    }

    pub fn is_connected(&self, id: NodeId) -> bool {
        self.state.is_connected(id)
    }

    /// With `false`, messages are delayed at random and some are lost.
    pub fn set_reliable(&self, reliable: bool) {
        self.state.unreliable.store(!reliable, Ordering::Relaxed);
    }

    /// Calls issued through any endpoint so far.
    pub fn rpc_count(&self) -> u64 {
        self.state.rpc_count.load(Ordering::Relaxed)
    }
}

/// One node's view of a [`LocalNetwork`].
struct Endpoint {
    from: NodeId,
    state: Arc<NetworkState>,
}

impl Endpoint {
    fn reachable(&self, to: NodeId) -> bool {
        self.state.is_connected(self.from) && self.state.is_connected(to)
    }

    async fn fail_slowly(&self, to: NodeId) -> Result<RaftMessage, TransportError> {
        let delay = rand::thread_rng().gen_range(0..UNREACHABLE_DELAY_MS);
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Err(TransportError::Unreachable { from: self.from, to })
    }
}

#[async_trait]
impl Transport for Endpoint {
    async fn call(&self, to: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError> {
        self.state.rpc_count.fetch_add(1, Ordering::Relaxed);

        if !message.is_request() {
            return Err(TransportError::UnexpectedReply);
        }
        if !self.reachable(to) {
            return self.fail_slowly(to).await;
        }
        if self.state.unreliable.load(Ordering::Relaxed) {
            let delay = rand::thread_rng().gen_range(0..UNRELIABLE_DELAY_MS);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if self.state.should_drop() {
            return Err(TransportError::Dropped { to });
        }

        let handler = self.state.nodes.read().get(&to).and_then(Weak::upgrade);
        let node = handler.ok_or(TransportError::NoSuchPeer(to))?;
        let reply = node
            .handle_message(message)
            .ok_or(TransportError::Dropped { to })?;

        if !self.reachable(to) {
            return self.fail_slowly(to).await;
        }
        if self.state.should_drop() {
            return Err(TransportError::Dropped { to });
        }
        Ok(reply)
    }
}

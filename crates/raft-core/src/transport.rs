//! # transport
//!
//! why: keep the consensus engine independent of how messages travel between nodes
//! relations: implemented by network.rs (in-process), wrapped by rpc.rs, answered by node.rs
//! what: Transport trait

use async_trait::async_trait;

use crate::error::TransportError;
use crate::message::{NodeId, RaftMessage};

/// Delivers one request to a peer and returns its reply.
///
/// Implementations give no ordering or delivery guarantee across calls and
/// may take arbitrarily long; callers bound the wait with [`crate::RpcGuard`].
#[async_trait]
pub trait Transport: Send + Sync {
    async fn call(&self, to: NodeId, message: RaftMessage) -> Result<RaftMessage, TransportError>;
}

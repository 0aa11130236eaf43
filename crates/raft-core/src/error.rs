//! # error
//!
//! why: name the few failures that escape the engine
//! relations: returned by node construction and config parsing; TransportError by transports
//! what: RaftError, TransportError

use std::io;

use thiserror::Error;

use crate::message::NodeId;

/// Failures that stop a node from starting.
///
/// Everything recoverable at runtime (timeouts, lost quorum, gaps) is
/// resolved by state transitions and never reaches the caller.
#[derive(Debug, Error)]
pub enum RaftError {
    #[error("persisted state cannot be decoded: {0}")]
    CorruptState(#[source] serde_json::Error),
    #[error("storage failure: {0}")]
    Storage(#[from] io::Error),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Why a single call through a [`crate::Transport`] did not produce a reply.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("node {to} unreachable from node {from}")]
    Unreachable { from: NodeId, to: NodeId },
    #[error("message to node {to} was lost")]
    Dropped { to: NodeId },
    #[error("node {to} did not answer in time")]
    TimedOut { to: NodeId },
    #[error("no node registered as {0}")]
    NoSuchPeer(NodeId),
    #[error("peer answered with a reply of the wrong kind")]
    UnexpectedReply,
}

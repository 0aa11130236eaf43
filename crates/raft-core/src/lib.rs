//! # raft-core
//!
//! why: implement single-leader log replication with elections, gap repair and persistence
//! relations: schedules work on raft-dispatch, persists through raft-storage, driven by raft-sim
//! what: RaftNode and its public contract, message types, transports, configuration

pub mod config;
mod election;
pub mod error;
pub mod log;
pub mod message;
pub mod network;
pub mod node;
mod replication;
pub mod rpc;
pub mod transport;

pub use config::RaftConfig;
pub use error::{RaftError, TransportError};
pub use log::ReplicatedLog;
pub use message::{Command, LogIndex, NodeId, RaftMessage, Term};
pub use network::LocalNetwork;
pub use node::{ApplyMsg, NodeState, NodeStatus, RaftNode};
pub use rpc::RpcGuard;
pub use transport::Transport;

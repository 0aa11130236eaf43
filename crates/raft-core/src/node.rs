//! # node
//!
//! why: own one peer's consensus state and expose the contract applications use
//! relations: holds log.rs under one lock, drives election.rs and replication.rs,
//!            persists through raft-storage, schedules work on raft-dispatch
//! what: NodeState, RaftNode (spawn, start, get_state, kill), ApplyMsg, NodeStatus

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use raft_dispatch::{Dispatcher, LaneId};
use raft_storage::Persister;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::config::RaftConfig;
use crate::error::RaftError;
use crate::log::ReplicatedLog;
use crate::message::{Command, LogIndex, NodeId, RaftMessage, Term};
use crate::rpc::RpcGuard;
use crate::transport::Transport;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - accepts leader messages, votes when asked
    #[default]
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - replicates submissions, sends heartbeats
    Leader,
}

impl NodeState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Candidate,
            2 => Self::Leader,
            _ => Self::Follower,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            Self::Follower => 0,
            Self::Candidate => 1,
            Self::Leader => 2,
        }
    }
}

/// A record handed to the application, in commit order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyMsg {
    /// A newly committed command at 1-based `index`.
    Command { index: LogIndex, command: Command },
    /// Reserved for state snapshots; never produced.
    Snapshot { term: Term, index: LogIndex, data: Vec<u8> },
}

/// Point-in-time view of a node, for observers and tests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeStatus {
    pub id: NodeId,
    pub role: NodeState,
    pub term: Term,
    pub commit_index: LogIndex,
    /// Committed entries plus the leader's in-flight entry, if any.
    pub log_len: u64,
    pub pending_len: u64,
}

/// What survives a restart.
#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct PersistentState {
    pub current_term: Term,
    pub log: Vec<Command>,
    pub pending_term: Term,
    pub commit_index: LogIndex,
    /// Highest term this node granted a vote in, its own candidacy included.
    #[serde(default)]
    pub voted_term: Term,
}

impl PersistentState {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, RaftError> {
        let state: Self = serde_json::from_slice(bytes).map_err(RaftError::CorruptState)?;
        if state.commit_index != state.log.len() as LogIndex {
            return Err(RaftError::CorruptState(serde::de::Error::custom(format!(
                "commit index {} does not match {} logged commands",
                state.commit_index,
                state.log.len()
            ))));
        }
        Ok(state)
    }
}

/// State guarded by the node lock.
pub(crate) struct NodeCore {
    pub(crate) log: ReplicatedLog,
    pub(crate) voted_term: Term,
}

/// One member of a Raft cluster.
///
/// All mutable consensus state sits behind a single lock that is never held
/// across an await point. Role, term and last leader contact are mirrored in
/// atomics so the ticker and `get_state` can read them without locking; they
/// are only written with the lock held.
pub struct RaftNode {
    pub(crate) id: NodeId,
    /// Every other member.
    pub(crate) peers: Vec<NodeId>,
    pub(crate) config: RaftConfig,
    pub(crate) core: Mutex<NodeCore>,
    role: AtomicU8,
    current_term: AtomicU64,
    /// Milliseconds since `epoch` at the last accepted leader message or granted vote.
    last_contact: AtomicU64,
    /// Highest index handed out by `start`.
    pub(crate) next_index: AtomicU64,
    dead: AtomicBool,
    epoch: Instant,
    pub(crate) guard: RpcGuard,
    pub(crate) dispatcher: Dispatcher,
    submit_lane: LaneId,
    apply_lane: LaneId,
    apply_tx: mpsc::Sender<ApplyMsg>,
    persister: Arc<dyn Persister>,
}

impl RaftNode {
    /// Create a node, restore whatever `persister` holds, and start its ticker.
    ///
    /// `peers` lists the cluster members; `id` itself is ignored if present.
    /// Committed commands are sent on `apply_tx` in index order. A restored
    /// node comes back as a follower and does not re-send its log.
    ///
    /// Must be called inside a tokio runtime.
    pub fn spawn(
        id: NodeId,
        peers: Vec<NodeId>,
        transport: Arc<dyn Transport>,
        persister: Arc<dyn Persister>,
        config: RaftConfig,
        apply_tx: mpsc::Sender<ApplyMsg>,
    ) -> Result<Arc<Self>, RaftError> {
        config.validate()?;
        let restored = match persister.load()? {
            Some(bytes) => PersistentState::decode(&bytes)?,
            None => PersistentState::default(),
        };
        let commit_index = restored.commit_index;

        let dispatcher = Dispatcher::new(config.dispatcher());
        let submit_lane = dispatcher.new_lane();
        let apply_lane = dispatcher.new_lane();

        let node = Arc::new(Self {
            id,
            peers: peers.into_iter().filter(|&peer| peer != id).collect(),
            config,
            core: Mutex::new(NodeCore {
                log: ReplicatedLog::restore(restored.log, restored.pending_term),
                voted_term: restored.voted_term,
            }),
            role: AtomicU8::new(NodeState::Follower.as_u8()),
            current_term: AtomicU64::new(restored.current_term),
            last_contact: AtomicU64::new(0),
            next_index: AtomicU64::new(commit_index),
            dead: AtomicBool::new(false),
            epoch: Instant::now(),
            guard: RpcGuard::new(transport),
            dispatcher,
            submit_lane,
            apply_lane,
            apply_tx,
            persister,
        });

        info!(
            node = id,
            term = restored.current_term,
            commit_index,
            peers = ?node.peers,
            "node started"
        );
        tokio::spawn(Arc::clone(&node).run_ticker());
        Ok(node)
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    /// Submit `command` for replication.
    ///
    /// Returns the index the command will occupy if it commits, the current
    /// term, and whether this node is leader. With `false` nothing was
    /// accepted. The call never waits for replication.
    pub fn start(self: &Arc<Self>, command: Command) -> (LogIndex, Term, bool) {
        let term = self.term();
        if self.killed() || self.role() != NodeState::Leader {
            return (0, term, false);
        }

        let index = self.next_index.fetch_add(1, Ordering::SeqCst) + 1;
        let node = Arc::clone(self);
        let submitted = self
            .dispatcher
            .submit(self.submit_lane, async move {
                node.replicate(term, index, command).await;
            });
        if let Err(e) = submitted {
            self.next_index.fetch_sub(1, Ordering::SeqCst);
            debug!(node = self.id, error = %e, "submission rejected");
            return (0, term, false);
        }
        debug!(node = self.id, term, index, "command accepted");
        (index, term, true)
    }

    /// Current term and whether this node believes it is leader.
    pub fn get_state(&self) -> (Term, bool) {
        (self.term(), self.role() == NodeState::Leader)
    }

    pub fn status(&self) -> NodeStatus {
        let core = self.core.lock();
        NodeStatus {
            id: self.id,
            role: self.role(),
            term: self.term(),
            commit_index: core.log.commit_index(),
            log_len: core.log.commit_index() + u64::from(core.log.has_tentative()),
            pending_len: core.log.pending().entries.len() as u64,
        }
    }

    /// Copy of every committed command, in index order.
    pub fn committed_log(&self) -> Vec<Command> {
        self.core.lock().log.committed().to_vec()
    }

    /// Bytes currently held by the persister.
    pub fn persisted_size(&self) -> Result<usize, RaftError> {
        Ok(self.persister.state_size()?)
    }

    /// Log compaction is not supported; the request is ignored.
    pub fn snapshot(&self, index: LogIndex, data: Vec<u8>) {
        debug!(node = self.id, index, bytes = data.len(), "snapshot ignored");
    }

    /// Stop the node: drop queued work, give up leadership, and let every
    /// background loop exit at its next check.
    pub fn kill(&self) {
        if self.dead.swap(true, Ordering::SeqCst) {
            return;
        }
        self.dispatcher.shutdown();
        let mut core = self.core.lock();
        core.log.take_tentative();
        self.set_role(NodeState::Follower);
        self.persist(&core);
        info!(node = self.id, term = self.term(), "node killed");
    }

    pub fn killed(&self) -> bool {
        self.dead.load(Ordering::SeqCst)
    }

    /// Answer a request from a peer. Replies, and anything sent to a killed
    /// node, produce `None`.
    pub fn handle_message(&self, message: RaftMessage) -> Option<RaftMessage> {
        if self.killed() {
            return None;
        }
        match message {
            RaftMessage::RequestVote(args) => {
                Some(RaftMessage::RequestVoteReply(self.handle_request_vote(args)))
            }
            RaftMessage::AppendEntries(args) => {
                Some(RaftMessage::AppendEntriesReply(self.handle_append_entries(args)))
            }
            RaftMessage::RequestVoteReply(_) | RaftMessage::AppendEntriesReply(_) => None,
        }
    }

    // -- shared helpers for election.rs and replication.rs --

    pub(crate) fn role(&self) -> NodeState {
        NodeState::from_u8(self.role.load(Ordering::SeqCst))
    }

    pub(crate) fn set_role(&self, role: NodeState) {
        self.role.store(role.as_u8(), Ordering::SeqCst);
    }

    pub(crate) fn term(&self) -> Term {
        self.current_term.load(Ordering::SeqCst)
    }

    pub(crate) fn set_term(&self, term: Term) {
        self.current_term.store(term, Ordering::SeqCst);
    }

    /// Whether this node still leads `term`.
    pub(crate) fn leads(&self, term: Term) -> bool {
        !self.killed() && self.role() == NodeState::Leader && self.term() == term
    }

    pub(crate) fn cluster_size(&self) -> usize {
        self.peers.len() + 1
    }

    pub(crate) fn is_majority(&self, count: usize) -> bool {
        count * 2 > self.cluster_size()
    }

    pub(crate) fn touch(&self) {
        let now = self.epoch.elapsed().as_millis() as u64;
        self.last_contact.store(now, Ordering::SeqCst);
    }

    pub(crate) fn since_last_contact(&self) -> Duration {
        let now = self.epoch.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_contact.load(Ordering::SeqCst)))
    }

    /// Become a follower: drop the in-flight entry and every queued
    /// submission, release reserved indexes, and persist.
    pub(crate) fn step_down(&self, core: &mut NodeCore, reason: &str) {
        let was = self.role();
        self.set_role(NodeState::Follower);
        core.log.take_tentative();
        self.next_index.store(core.log.commit_index(), Ordering::SeqCst);
        let dropped = self.dispatcher.purge(self.submit_lane).unwrap_or_default();
        self.persist(core);
        if was != NodeState::Follower {
            info!(
                node = self.id,
                term = self.term(),
                from = ?was,
                dropped_submissions = dropped,
                reason,
                "stepped down"
            );
        }
    }

    /// Write the recoverable state. A failed write is logged and the node
    /// keeps running on its in-memory state.
    pub(crate) fn persist(&self, core: &NodeCore) {
        let state = PersistentState {
            current_term: self.term(),
            log: core.log.committed().to_vec(),
            pending_term: core.log.pending_term(),
            commit_index: core.log.commit_index(),
            voted_term: core.voted_term,
        };
        let result = serde_json::to_vec(&state)
            .map_err(RaftError::CorruptState)
            .and_then(|bytes| self.persister.save(&bytes).map_err(RaftError::Storage));
        if let Err(e) = result {
            error!(node = self.id, error = %e, "failed to persist state");
        }
    }

    /// Queue newly committed commands for the application.
    ///
    /// Called with the node lock held so that batches enter the apply lane
    /// in commit order.
    pub(crate) fn deliver(&self, entries: Vec<(LogIndex, Command)>) {
        if entries.is_empty() {
            return;
        }
        let tx = self.apply_tx.clone();
        let id = self.id;
        let queued = self.dispatcher.submit(self.apply_lane, async move {
            for (index, command) in entries {
                if tx.send(ApplyMsg::Command { index, command }).await.is_err() {
                    debug!(node = id, index, "apply receiver dropped");
                    return;
                }
            }
        });
        if let Err(e) = queued {
            debug!(node = self.id, error = %e, "apply delivery skipped");
        }
    }
}

//! # replication
//!
//! why: turn accepted commands into entries committed on a majority, and keep followers caught up
//! relations: extends node.rs, sends through rpc.rs, reshapes log.rs; started by election.rs
//! what: submission round (replicate), retrying appends, replenish, heartbeat loop, append handling

use std::sync::Arc;

use futures::future::join_all;
use tokio::sync::oneshot;
use tracing::{debug, info, trace, warn};

use crate::message::{
    AppendEntriesArgs, AppendEntriesReply, Command, LogIndex, NodeId, RaftMessage, Term,
};
use crate::node::{NodeState, RaftNode};

impl RaftNode {
    /// One submission round, run on the submission lane.
    ///
    /// The command sits in the tentative slot while every peer is asked to
    /// stage it. A majority of acknowledgments commits it; anything less
    /// rolls it back and steps this node down.
    pub(crate) async fn replicate(self: &Arc<Self>, term: Term, index: LogIndex, command: Command) {
        let args = {
            let mut core = self.core.lock();
            if !self.leads(term) {
                debug!(node = self.id, term, index, "no longer leader, submission dropped");
                return;
            }
            let commit_index = core.log.commit_index();
            if commit_index + 1 != index {
                warn!(node = self.id, index, commit_index, "reserved index out of sequence, submission dropped");
                return;
            }
            core.log.append_tentative(command.clone());
            AppendEntriesArgs {
                term,
                leader_id: self.id,
                entries: vec![command.clone()],
                first_index: index,
                leader_commit: commit_index,
                replenish: false,
            }
        };

        let outcomes = join_all(
            self.peers
                .iter()
                .map(|&peer| self.send_append_with_retry(peer, term, args.clone())),
        )
        .await;
        let acked: Vec<NodeId> = self
            .peers
            .iter()
            .zip(outcomes)
            .filter_map(|(&peer, ok)| ok.then_some(peer))
            .collect();
        let acks = acked.len() + 1;

        {
            let mut core = self.core.lock();
            if !self.leads(term) || !core.log.has_tentative() {
                debug!(node = self.id, term, index, "superseded during replication");
                return;
            }
            if !self.is_majority(acks) {
                core.log.take_tentative();
                warn!(node = self.id, term, index, acks, "no majority, rolled back");
                self.step_down(&mut core, "lost majority");
                return;
            }
            let committed = core.log.commit_tentative().unwrap_or(index);
            self.persist(&core);
            self.deliver(vec![(committed, command)]);
            info!(node = self.id, term, commit_index = committed, acks, "committed");
        }

        // tell the peers that staged the entry to promote it
        let notice = AppendEntriesArgs::heartbeat(term, self.id, index);
        for peer in acked {
            let node = Arc::clone(self);
            let args = notice.clone();
            let queued = self.dispatcher.submit_any(async move {
                let message = RaftMessage::AppendEntries(args);
                match node.guard.call(peer, message, node.config.rpc_timeout).await {
                    Ok(RaftMessage::AppendEntriesReply(reply)) => {
                        node.handle_append_reply(peer, term, reply).await;
                    }
                    Ok(_) => {}
                    Err(e) => trace!(node = node.id, peer, error = %e, "commit notice lost"),
                }
            });
            if queued.is_err() {
                break;
            }
        }
    }

    /// Send an append, retrying a bounded number of times while no reply
    /// arrives. Returns whether the peer ended up holding the entries.
    pub(crate) async fn send_append_with_retry(
        self: &Arc<Self>,
        peer: NodeId,
        term: Term,
        args: AppendEntriesArgs,
    ) -> bool {
        let message = RaftMessage::AppendEntries(args);
        let mut reply = self
            .guard
            .call(peer, message.clone(), self.config.append_timeout)
            .await;
        let mut attempt = 0;
        while reply.is_err() && attempt < self.config.append_retries && self.leads(term) {
            attempt += 1;
            trace!(node = self.id, peer, attempt, "retrying append");
            reply = self
                .guard
                .call(peer, message.clone(), self.config.append_retry_timeout)
                .await;
        }

        match reply {
            Ok(RaftMessage::AppendEntriesReply(reply)) => self.handle_append_reply(peer, term, reply).await,
            Ok(other) => {
                debug!(node = self.id, peer, method = other.method(), "unexpected reply");
                false
            }
            Err(e) => {
                debug!(node = self.id, peer, error = %e, "append failed");
                false
            }
        }
    }

    /// React to a follower's answer. A gap triggers a replenish; a newer term
    /// ends this node's leadership.
    pub(crate) async fn handle_append_reply(
        self: &Arc<Self>,
        peer: NodeId,
        term: Term,
        reply: AppendEntriesReply,
    ) -> bool {
        if reply.success {
            return true;
        }
        if reply.term > term {
            self.observe_newer_term(peer, reply.term);
            return false;
        }
        match reply.expect_entries_start {
            Some(start) => self.replenish(peer, term, start).await,
            None => false,
        }
    }

    /// Send `peer` everything from 0-based `start` on, tentative entry included.
    pub(crate) async fn replenish(self: &Arc<Self>, peer: NodeId, term: Term, start: u64) -> bool {
        let args = {
            let core = self.core.lock();
            if !self.leads(term) {
                return false;
            }
            AppendEntriesArgs {
                term,
                leader_id: self.id,
                entries: core.log.suffix_from(start),
                first_index: start + 1,
                leader_commit: core.log.commit_index(),
                replenish: true,
            }
        };
        info!(node = self.id, peer, start, entries = args.entries.len(), "replenishing follower");

        let message = RaftMessage::AppendEntries(args);
        match self
            .guard
            .call(peer, message, self.config.replenish_timeout)
            .await
        {
            Ok(RaftMessage::AppendEntriesReply(reply)) if reply.success => true,
            Ok(RaftMessage::AppendEntriesReply(reply)) => {
                if reply.term > term {
                    self.observe_newer_term(peer, reply.term);
                }
                false
            }
            Ok(_) => false,
            Err(e) => {
                debug!(node = self.id, peer, error = %e, "replenish failed");
                false
            }
        }
    }

    fn observe_newer_term(&self, peer: NodeId, newer: Term) {
        let mut core = self.core.lock();
        if self.role() == NodeState::Leader {
            info!(node = self.id, peer, newer, "peer is in a newer term");
            self.step_down(&mut core, "newer term");
        }
    }

    /// Send heartbeats every interval while this node leads `term`.
    pub(crate) async fn run_heartbeat(self: Arc<Self>, term: Term) {
        while self.leads(term) {
            let replies = self.broadcast_heartbeat(term).await;
            if !self.peers.is_empty() && replies == 0 {
                let mut core = self.core.lock();
                if self.leads(term) {
                    warn!(node = self.id, term, "no peer answered heartbeat");
                    self.step_down(&mut core, "isolated");
                }
                break;
            }
            tokio::time::sleep(self.config.heartbeat_interval).await;
        }
        debug!(node = self.id, term, "heartbeat stopped");
    }

    /// Fan one heartbeat round out over the general lanes and count the
    /// peers that answered at all.
    async fn broadcast_heartbeat(self: &Arc<Self>, term: Term) -> usize {
        let mut answers = Vec::with_capacity(self.peers.len());
        for &peer in &self.peers {
            let (tx, rx) = oneshot::channel();
            let node = Arc::clone(self);
            let queued = self.dispatcher.submit_any(async move {
                let _ = tx.send(node.heartbeat_peer(peer, term).await);
            });
            if queued.is_ok() {
                answers.push(rx);
            }
        }
        join_all(answers)
            .await
            .into_iter()
            .filter(|answer| matches!(answer, Ok(true)))
            .count()
    }

    async fn heartbeat_peer(self: &Arc<Self>, peer: NodeId, term: Term) -> bool {
        let args = {
            let core = self.core.lock();
            if !self.leads(term) {
                return false;
            }
            AppendEntriesArgs::heartbeat(term, self.id, core.log.commit_index())
        };
        match self
            .guard
            .call(peer, RaftMessage::AppendEntries(args), self.config.append_timeout)
            .await
        {
            Ok(RaftMessage::AppendEntriesReply(reply)) => {
                self.handle_append_reply(peer, term, reply).await;
                true
            }
            Ok(_) => true,
            Err(e) => {
                trace!(node = self.id, peer, error = %e, "heartbeat lost");
                false
            }
        }
    }

    /// Accept a message from a leader.
    ///
    /// Messages from an older term are refused. Otherwise the sender's term
    /// becomes current and leader contact is refreshed. A commit index ahead
    /// of ours promotes pending entries, or reports where our log ends when
    /// the pending batch cannot cover it. New entries then replace the
    /// pending batch.
    pub fn handle_append_entries(&self, args: AppendEntriesArgs) -> AppendEntriesReply {
        let mut core = self.core.lock();
        let current = self.term();
        let refuse = |term| AppendEntriesReply {
            term,
            success: false,
            expect_entries_start: None,
        };

        if self.killed() || args.term < current {
            trace!(node = self.id, leader = args.leader_id, stale = args.term, current, "refusing append");
            return refuse(current);
        }

        match self.role() {
            NodeState::Leader
                if args.term > current || args.leader_commit > core.log.commit_index() =>
            {
                self.step_down(&mut core, "another leader is ahead");
            }
            NodeState::Leader => {
                debug!(node = self.id, rival = args.leader_id, "ignoring append from rival leader");
                return refuse(current);
            }
            NodeState::Candidate => {
                debug!(node = self.id, leader = args.leader_id, term = args.term, "leader found, abandoning candidacy");
                self.set_role(NodeState::Follower);
            }
            NodeState::Follower => {}
        }

        let mut changed = args.term != current;
        self.set_term(args.term);
        self.touch();

        let mut reply = AppendEntriesReply {
            term: args.term,
            success: true,
            expect_entries_start: None,
        };

        if args.leader_commit > core.log.commit_index() && !args.replenish {
            core.log.retain_pending_for(args.term);
            match core.log.promote_to(args.leader_commit) {
                Ok(promoted) => {
                    debug!(node = self.id, commit_index = args.leader_commit, promoted = promoted.len(), "advanced commit index");
                    self.persist(&core);
                    self.deliver(promoted);
                }
                Err(gap) => {
                    debug!(
                        node = self.id,
                        leader_commit = args.leader_commit,
                        expect = gap.expect_entries_start,
                        "gap in log"
                    );
                    reply.success = false;
                    reply.expect_entries_start = Some(gap.expect_entries_start);
                }
            }
        }

        if !args.entries.is_empty() {
            trace!(node = self.id, first_index = args.first_index, entries = args.entries.len(), replenish = args.replenish, "staging entries");
            core.log.stage(args.entries, args.first_index, args.term);
            changed = true;
        }

        if changed {
            self.persist(&core);
        }
        reply
    }
}

//! # election
//!
//! why: replace a silent leader and keep at most one leader per term
//! relations: extends node.rs, sends through rpc.rs, hands over to replication.rs on victory
//! what: ticker loop, run_election, become_leader, request vote handling

use std::cmp::max;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures::stream::{FuturesUnordered, StreamExt};
use rand::Rng;
use tracing::{debug, info, trace};

use crate::message::{RaftMessage, RequestVoteArgs, RequestVoteReply, Term};
use crate::node::{NodeState, RaftNode};

impl RaftNode {
    /// Check for leader silence every tick until the node is killed.
    pub(crate) async fn run_ticker(self: Arc<Self>) {
        let tolerance = self.config.election_tolerance();
        while !self.killed() {
            tokio::time::sleep(self.config.tick_interval).await;
            if self.role() == NodeState::Leader || self.since_last_contact() < tolerance {
                continue;
            }

            self.run_election().await;

            let backoff = {
                let min = self.config.election_backoff_min.as_millis() as u64;
                let max = self.config.election_backoff_max.as_millis() as u64;
                rand::thread_rng().gen_range(min..max)
            };
            tokio::time::sleep(std::time::Duration::from_millis(backoff)).await;
        }
        debug!(node = self.id, "ticker stopped");
    }

    /// Stand for election once. Returns whether this node became leader.
    pub(crate) async fn run_election(self: &Arc<Self>) -> bool {
        let args = {
            let mut core = self.core.lock();
            if self.killed() || self.role() != NodeState::Follower {
                return false;
            }
            let term = max(self.term(), core.voted_term) + 1;
            core.voted_term = term;
            self.set_role(NodeState::Candidate);
            self.persist(&core);
            RequestVoteArgs {
                term,
                candidate_id: self.id,
                commit_index: core.log.commit_index(),
            }
        };
        let term = args.term;
        info!(node = self.id, term, commit_index = args.commit_index, "starting election");

        let mut votes = 1;
        let mut requests: FuturesUnordered<_> = self
            .peers
            .iter()
            .map(|&peer| {
                let node = Arc::clone(self);
                let message = RaftMessage::RequestVote(args.clone());
                async move {
                    let reply = node.guard.call(peer, message, node.config.rpc_timeout).await;
                    (peer, reply)
                }
            })
            .collect();

        while !self.is_majority(votes) {
            let Some((peer, reply)) = requests.next().await else {
                break;
            };
            if self.killed() || self.role() != NodeState::Candidate {
                debug!(node = self.id, term, "candidacy superseded");
                break;
            }
            match reply {
                Ok(RaftMessage::RequestVoteReply(reply)) if reply.vote_granted => {
                    votes += 1;
                    trace!(node = self.id, term, peer, votes, "vote granted");
                }
                Ok(RaftMessage::RequestVoteReply(reply)) => {
                    debug!(node = self.id, term, peer, peer_term = reply.term, "vote refused");
                    break;
                }
                Ok(other) => debug!(node = self.id, peer, method = other.method(), "unexpected reply"),
                Err(e) => trace!(node = self.id, peer, error = %e, "vote request failed"),
            }
        }
        drop(requests);

        if self.is_majority(votes) && self.become_leader(term) {
            return true;
        }
        {
            let core = self.core.lock();
            if self.role() == NodeState::Candidate {
                self.set_role(NodeState::Follower);
                self.persist(&core);
            }
        }
        debug!(node = self.id, term, votes, "election lost");
        false
    }

    /// Take office for `term` unless the candidacy was superseded meanwhile.
    pub(crate) fn become_leader(self: &Arc<Self>, term: Term) -> bool {
        {
            let mut core = self.core.lock();
            if self.killed() || self.role() != NodeState::Candidate || term <= self.term() {
                return false;
            }
            self.set_term(term);
            core.log.take_tentative();
            self.next_index
                .store(core.log.commit_index(), Ordering::SeqCst);
            self.set_role(NodeState::Leader);
            self.persist(&core);
            info!(
                node = self.id,
                term,
                commit_index = core.log.commit_index(),
                "became leader"
            );
        }
        tokio::spawn(Arc::clone(self).run_heartbeat(term));
        true
    }

    /// Decide a vote request.
    ///
    /// A vote is refused when this node leads, when the proposal is not newer
    /// than both the current term and the last term voted in, or when this
    /// node has committed more than the candidate. Granting yields any
    /// candidacy of our own.
    pub fn handle_request_vote(&self, args: RequestVoteArgs) -> RequestVoteReply {
        let mut core = self.core.lock();
        let term = self.term();
        let refuse = |reason: &str| {
            debug!(node = self.id, candidate = args.candidate_id, proposed = args.term, reason, "refusing vote");
            RequestVoteReply {
                term,
                vote_granted: false,
            }
        };

        if self.killed() {
            return refuse("killed");
        }
        if self.role() == NodeState::Leader {
            return refuse("already leader");
        }
        if args.term <= term {
            return refuse("stale term");
        }
        if args.term <= core.voted_term {
            return refuse("already voted in term");
        }
        if core.log.commit_index() > args.commit_index {
            return refuse("candidate is behind");
        }

        core.voted_term = args.term;
        if self.role() == NodeState::Candidate {
            self.set_role(NodeState::Follower);
        }
        self.touch();
        self.persist(&core);
        info!(node = self.id, candidate = args.candidate_id, term = args.term, "vote granted");
        RequestVoteReply {
            term,
            vote_granted: true,
        }
    }
}

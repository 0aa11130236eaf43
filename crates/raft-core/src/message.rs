//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: built by election.rs and replication.rs, carried by transport.rs, answered by node.rs
//! what: RequestVote and AppendEntries arguments and replies, the RaftMessage envelope

use serde::{Deserialize, Serialize};

/// Identifies a cluster member.
pub type NodeId = u64;

/// Election epoch.
pub type Term = u64;

/// 1-based position in the replicated log; 0 means "no entry".
pub type LogIndex = u64;

/// An opaque application command. The application encodes and decodes it.
pub type Command = Vec<u8>;

/// Vote request sent by a candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteArgs {
    /// Term the candidate proposes to lead.
    pub term: Term,
    pub candidate_id: NodeId,
    /// Candidate's commit index; voters that have committed more refuse.
    pub commit_index: LogIndex,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestVoteReply {
    /// Voter's current term.
    pub term: Term,
    pub vote_granted: bool,
}

/// Leader to follower message: new entries, a commit notification, a
/// heartbeat, or a replenish of a missing suffix.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesArgs {
    pub term: Term,
    pub leader_id: NodeId,
    /// Entries to stage; empty for heartbeats and commit notifications.
    pub entries: Vec<Command>,
    /// Log index of `entries[0]`.
    pub first_index: LogIndex,
    pub leader_commit: LogIndex,
    /// Set when `entries` backfills a gap the follower reported.
    pub replenish: bool,
}

impl AppendEntriesArgs {
    /// A message carrying no entries, only the leader's commit index.
    pub fn heartbeat(term: Term, leader_id: NodeId, leader_commit: LogIndex) -> Self {
        Self {
            term,
            leader_id,
            entries: Vec::new(),
            first_index: leader_commit + 1,
            leader_commit,
            replenish: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendEntriesReply {
    /// Receiver's current term; higher than the sender's when the sender is stale.
    pub term: Term,
    pub success: bool,
    /// 0-based position the receiver needs entries from, when it reports a gap.
    pub expect_entries_start: Option<u64>,
}

/// All messages exchanged between nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteArgs),
    RequestVoteReply(RequestVoteReply),
    AppendEntries(AppendEntriesArgs),
    AppendEntriesReply(AppendEntriesReply),
}

impl RaftMessage {
    /// Name of the remote procedure this message invokes or answers.
    pub fn method(&self) -> &'static str {
        match self {
            RaftMessage::RequestVote(_) | RaftMessage::RequestVoteReply(_) => "Raft.RequestVote",
            RaftMessage::AppendEntries(_) | RaftMessage::AppendEntriesReply(_) => {
                "Raft.AppendEntries"
            }
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, RaftMessage::RequestVote(_) | RaftMessage::AppendEntries(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_carries_no_entries() {
        let msg = AppendEntriesArgs::heartbeat(4, 2, 9);
        assert!(msg.entries.is_empty());
        assert_eq!(msg.first_index, 10);
        assert!(!msg.replenish);
    }

    #[test]
    fn requests_and_replies_share_a_method() {
        let request = RaftMessage::RequestVote(RequestVoteArgs {
            term: 1,
            candidate_id: 1,
            commit_index: 0,
        });
        let reply = RaftMessage::RequestVoteReply(RequestVoteReply {
            term: 1,
            vote_granted: true,
        });
        assert_eq!(request.method(), reply.method());
        assert!(request.is_request());
        assert!(!reply.is_request());
    }

    #[test]
    fn message_survives_json_encoding() {
        let msg = RaftMessage::AppendEntries(AppendEntriesArgs {
            term: 3,
            leader_id: 1,
            entries: vec![b"set x 1".to_vec()],
            first_index: 5,
            leader_commit: 4,
            replenish: false,
        });
        let json = serde_json::to_string(&msg).unwrap();
        let back: RaftMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(back, msg);
    }
}

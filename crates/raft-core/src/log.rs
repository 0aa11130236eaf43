//! # log
//!
//! why: manage the append-only log of commands that raft replicates
//! relations: owned by node.rs under the node lock, driven by replication.rs, persisted via raft-storage
//! what: ReplicatedLog (committed prefix, leader tentative tail, follower pending batch), Gap

use crate::message::{Command, LogIndex, Term};

/// Commands received from a leader but not yet known to be committed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingBatch {
    /// Term of the leader message that staged the batch.
    pub term: Term,
    /// Log index of `entries[0]`.
    pub first_index: LogIndex,
    pub entries: Vec<Command>,
}

/// Returned when a follower cannot reach the commit index a leader asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Gap {
    /// 0-based position of the first missing entry, i.e. the committed length.
    pub expect_entries_start: u64,
}

/// The replicated log of one node.
///
/// Only committed commands live in `entries`, so the commit index is always
/// `entries.len()`. A leader keeps the command it is replicating in a
/// tentative tail slot; a follower keeps staged commands in a pending batch.
#[derive(Debug, Clone, Default)]
pub struct ReplicatedLog {
    entries: Vec<Command>,
    tentative: Option<Command>,
    pending: PendingBatch,
}

impl ReplicatedLog {
    #[cfg(test)]
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild from persisted parts. The pending batch itself is never persisted.
    pub fn restore(entries: Vec<Command>, pending_term: Term) -> Self {
        let first_index = entries.len() as LogIndex + 1;
        Self {
            entries,
            tentative: None,
            pending: PendingBatch {
                term: pending_term,
                first_index,
                entries: Vec::new(),
            },
        }
    }

    pub fn commit_index(&self) -> LogIndex {
        self.entries.len() as LogIndex
    }

    pub fn committed(&self) -> &[Command] {
        &self.entries
    }

    /// Committed command at 1-based `index`.
    #[cfg(test)]
    pub fn get(&self, index: LogIndex) -> Option<&Command> {
        let position = usize::try_from(index.checked_sub(1)?).ok()?;
        self.entries.get(position)
    }

    // -- leader side --

    /// Place `command` in the tentative slot, replacing anything left there.
    pub fn append_tentative(&mut self, command: Command) {
        self.tentative = Some(command);
    }

    pub fn has_tentative(&self) -> bool {
        self.tentative.is_some()
    }

    /// Roll back the tentative command.
    pub fn take_tentative(&mut self) -> Option<Command> {
        self.tentative.take()
    }

    /// Move the tentative command into the committed log and return its index.
    pub fn commit_tentative(&mut self) -> Option<LogIndex> {
        let command = self.tentative.take()?;
        self.entries.push(command);
        Some(self.commit_index())
    }

    /// Everything from 0-based `start` to the end, tentative tail included.
    ///
    /// This is what a replenish sends to a follower that reported a gap.
    pub fn suffix_from(&self, start: u64) -> Vec<Command> {
        let start = usize::try_from(start).unwrap_or(usize::MAX);
        let mut suffix: Vec<Command> = self.entries.get(start..).map(<[_]>::to_vec).unwrap_or_default();
        if let Some(tentative) = &self.tentative {
            suffix.push(tentative.clone());
        }
        suffix
    }

    // -- follower side --

    pub fn pending(&self) -> &PendingBatch {
        &self.pending
    }

    pub fn pending_term(&self) -> Term {
        self.pending.term
    }

    /// Drop the pending batch if it was staged under a different term, and
    /// adopt `term` as the batch term.
    pub fn retain_pending_for(&mut self, term: Term) {
        if self.pending.term != term {
            self.pending.entries.clear();
            self.pending.first_index = self.commit_index() + 1;
            self.pending.term = term;
        }
    }

    /// Replace the pending batch.
    pub fn stage(&mut self, entries: Vec<Command>, first_index: LogIndex, term: Term) {
        self.pending = PendingBatch {
            term,
            first_index,
            entries,
        };
    }

    /// Promote pending commands until the commit index reaches `leader_commit`.
    ///
    /// Returns the newly committed `(index, command)` pairs in index order.
    /// Commands past `leader_commit` stay pending. A batch that does not start
    /// right after the committed prefix is discarded first. If the log plus the
    /// batch still falls short, nothing changes and the gap is reported.
    pub fn promote_to(&mut self, leader_commit: LogIndex) -> Result<Vec<(LogIndex, Command)>, Gap> {
        let have = self.commit_index();
        if leader_commit <= have {
            return Ok(Vec::new());
        }
        if !self.pending.entries.is_empty() && self.pending.first_index != have + 1 {
            self.pending.entries.clear();
        }
        if have + (self.pending.entries.len() as LogIndex) < leader_commit {
            return Err(Gap {
                expect_entries_start: have,
            });
        }

        let needed = (leader_commit - have) as usize;
        let promoted: Vec<(LogIndex, Command)> = self
            .pending
            .entries
            .drain(..needed)
            .zip(have + 1..)
            .map(|(command, index)| (index, command))
            .collect();
        self.entries
            .extend(promoted.iter().map(|(_, command)| command.clone()));
        self.pending.first_index = leader_commit + 1;
        Ok(promoted)
    }
}

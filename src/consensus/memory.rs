//! In-process consensus engine.
//!
//! A single ordered log shared by every simulated member. A proposal
//! commits once a majority of voters is online; otherwise the proposer
//! waits on a condition variable until the deadline. The leader is the
//! lowest-numbered online voter while a majority is reachable, and the term
//! advances whenever the leader changes.
//!
//! Committed `AddMember` / `RemoveMember` commands update the voter set, so
//! membership changes are linearized with every other command.

use super::{Command, ConsensusEngine, LogEntry, LogPosition, MemberId};
use crate::core::error::ConsensusError;
use parking_lot::{Condvar, Mutex};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug)]
struct ConsensusState {
    voters: BTreeSet<MemberId>,
    offline: BTreeSet<MemberId>,
    entries: VecDeque<LogEntry>,
    /// Index of `entries[0]`, or the next index when `entries` is empty.
    first_index: u64,
    last: LogPosition,
    term: u64,
    last_leader: Option<MemberId>,
    progress: BTreeMap<MemberId, LogPosition>,
}

impl ConsensusState {
    fn online_voters(&self) -> impl Iterator<Item = &MemberId> {
        self.voters.iter().filter(|m| !self.offline.contains(m))
    }

    fn has_majority(&self) -> bool {
        !self.voters.is_empty() && self.online_voters().count() * 2 > self.voters.len()
    }

    fn leader(&self) -> Option<MemberId> {
        if self.has_majority() {
            self.online_voters().next().copied()
        } else {
            None
        }
    }

    fn observe_leader(&mut self) {
        let leader = self.leader();
        if leader.is_some() && leader != self.last_leader {
            self.term += 1;
            self.last_leader = leader;
        }
    }

    fn append(&mut self, command: Command) -> LogPosition {
        let position = LogPosition::new(self.last.index + 1, self.term);
        match &command {
            Command::AddMember { member_id } => {
                self.voters.insert(*member_id);
            }
            Command::RemoveMember { member_id } => {
                self.voters.remove(member_id);
            }
            _ => {}
        }
        if self.entries.is_empty() {
            self.first_index = position.index;
        }
        self.entries.push_back(LogEntry::new(position, command));
        self.last = position;
        position
    }
}

/// Shared in-memory consensus log.
#[derive(Debug)]
pub struct InMemoryConsensus {
    state: Mutex<ConsensusState>,
    changed: Condvar,
}

impl InMemoryConsensus {
    /// Create an engine with the given initial voters, all online.
    pub fn new(initial_voters: impl IntoIterator<Item = MemberId>) -> Self {
        Self {
            state: Mutex::new(ConsensusState {
                voters: initial_voters.into_iter().collect(),
                offline: BTreeSet::new(),
                entries: VecDeque::new(),
                first_index: 1,
                last: LogPosition::ZERO,
                term: 0,
                last_leader: None,
                progress: BTreeMap::new(),
            }),
            changed: Condvar::new(),
        }
    }

    /// Mark a member reachable or unreachable.
    pub fn set_online(&self, member: MemberId, online: bool) {
        let mut state = self.state.lock();
        if online {
            state.offline.remove(&member);
        } else {
            state.offline.insert(member);
        }
        state.observe_leader();
        drop(state);
        self.changed.notify_all();
    }

    /// Whether a member is currently reachable.
    pub fn is_online(&self, member: MemberId) -> bool {
        !self.state.lock().offline.contains(&member)
    }

    /// Current term.
    pub fn term(&self) -> u64 {
        self.state.lock().term
    }

    /// Continue an empty log after `base`, as if everything up to it had
    /// been committed and compacted.
    ///
    /// Used by a standalone member whose durable state is ahead of a freshly
    /// created engine. Has no effect once entries exist.
    pub fn resume_after(&self, base: LogPosition) {
        let mut state = self.state.lock();
        if !state.entries.is_empty() || base.index <= state.last.index {
            return;
        }
        state.first_index = base.index + 1;
        state.last = base;
        state.term = state.term.max(base.term);
        tracing::debug!(base = %base, "consensus log resumed");
    }

    /// Number of entries currently retained.
    pub fn retained_len(&self) -> usize {
        self.state.lock().entries.len()
    }
}

impl ConsensusEngine for InMemoryConsensus {
    fn propose(
        &self,
        proposer: MemberId,
        command: Command,
        timeout: Duration,
    ) -> Result<LogPosition, ConsensusError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();

        loop {
            state.observe_leader();
            if state.has_majority() && !state.offline.contains(&proposer) {
                let kind = command.kind();
                let position = state.append(command);
                drop(state);
                self.changed.notify_all();
                tracing::trace!(proposer, kind, position = %position, "command committed");
                return Ok(position);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ConsensusError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
            self.changed.wait_for(&mut state, deadline - now);
        }
    }

    fn committed_entries(
        &self,
        from_index: u64,
        max_entries: usize,
    ) -> Result<Vec<LogEntry>, ConsensusError> {
        let state = self.state.lock();
        let from_index = from_index.max(1);
        if from_index < state.first_index {
            return Err(ConsensusError::Compacted {
                first_retained: state.first_index,
            });
        }

        let skip = (from_index - state.first_index) as usize;
        Ok(state
            .entries
            .iter()
            .skip(skip)
            .take(max_entries)
            .cloned()
            .collect())
    }

    fn first_retained_index(&self) -> u64 {
        self.state.lock().first_index
    }

    fn last_position(&self) -> LogPosition {
        self.state.lock().last
    }

    fn leader(&self) -> Option<MemberId> {
        let mut state = self.state.lock();
        state.observe_leader();
        state.leader()
    }

    fn roster(&self) -> Vec<MemberId> {
        self.state.lock().voters.iter().copied().collect()
    }

    fn report_applied(&self, member: MemberId, position: LogPosition) {
        let mut state = self.state.lock();
        let entry = state.progress.entry(member).or_default();
        *entry = position;
    }

    fn applied_positions(&self) -> BTreeMap<MemberId, LogPosition> {
        self.state.lock().progress.clone()
    }

    fn compact_to(&self, index: u64) {
        let mut state = self.state.lock();
        let bound = index.min(state.last.index);
        while state
            .entries
            .front()
            .is_some_and(|entry| entry.index() <= bound)
        {
            state.entries.pop_front();
        }
        if bound + 1 > state.first_index {
            state.first_index = bound + 1;
            tracing::debug!(first_retained = state.first_index, "consensus log compacted");
        }
    }
}

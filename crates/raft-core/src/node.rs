//! # node
//!
//! why: define the raft node state machine and state transitions
//! relations: uses message.rs for rpc types, log.rs for entries; driven by raft-kv
//! what: NodeState, RaftNode, vote/append/snapshot handlers, commit and compaction bookkeeping
//!
//! the node never touches the network, a clock or a disk. every handler mutates
//! the in-memory state and reports what the caller must do next (reply, reset the
//! election timer, persist part of the log).

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{Command, LogEntry, NodeStatus, RaftConfig, RaftMessage, Snapshot};

pub type NodeId = u64;

/// The three possible states a Raft node can be in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive state - listens for heartbeats, votes when asked
    Follower,
    /// Transitional state - requesting votes to become leader
    Candidate,
    /// Active state - manages log replication, sends heartbeats
    Leader,
}

impl Default for NodeState {
    fn default() -> Self {
        Self::Follower
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// The durable (term, vote) pair
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
}

/// How the log changed while handling AppendEntries
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogChange {
    /// entries were only appended, starting at `from_index`
    Appended { from_index: u64 },
    /// a conflicting suffix was truncated; the whole log must be rewritten
    Rewritten,
}

/// Result of handling an AppendEntries request
#[derive(Debug, Clone)]
pub struct AppendOutcome {
    pub response: RaftMessage,
    /// request came from a legitimate leader
    pub reset_timer: bool,
    pub log_change: Option<LogChange>,
    pub commit_advanced: bool,
}

/// Result of handling an InstallSnapshot request
#[derive(Debug, Clone)]
pub struct InstallOutcome {
    pub response: RaftMessage,
    pub reset_timer: bool,
    /// the snapshot replaced local state and must be replayed and persisted
    pub installed: bool,
}

/// A single Raft node in the cluster
#[derive(Debug)]
pub struct RaftNode {
    /// Unique identifier for this node
    pub id: NodeId,
    /// Every member of the cluster, this node included
    pub cluster_nodes: Vec<NodeId>,
    pub config: RaftConfig,
    /// Current state (Follower, Candidate, or Leader)
    pub state: NodeState,
    /// Current term number
    pub current_term: u64,
    /// Node ID that received our vote in current term (if any)
    pub voted_for: Option<NodeId>,
    /// Last leader heard from in the current term
    pub leader_id: Option<NodeId>,
    /// Entries after the snapshot: `log[i].index == snapshot_index + 1 + i`
    pub log: Vec<LogEntry>,
    /// Last index covered by the latest snapshot (0 when none)
    pub snapshot_index: u64,
    pub snapshot_term: u64,
    pub commit_index: u64,
    pub last_applied: u64,
    /// Votes granted to us in the current election, our own included
    pub votes_received: Vec<NodeId>,
    /// Leader only: next index to send to each peer
    pub next_index: HashMap<NodeId, u64>,
    /// Leader only: highest index known replicated on each peer
    pub match_index: HashMap<NodeId, u64>,
}

impl RaftNode {
    /// Create a new Raft node in Follower state
    pub fn new(id: NodeId, cluster_nodes: Vec<NodeId>) -> Self {
        Self::with_config(id, cluster_nodes, RaftConfig::default())
    }

    pub fn with_config(id: NodeId, mut cluster_nodes: Vec<NodeId>, config: RaftConfig) -> Self {
        if !cluster_nodes.contains(&id) {
            cluster_nodes.push(id);
        }
        Self {
            id,
            cluster_nodes,
            config,
            state: NodeState::Follower,
            current_term: 0,
            voted_for: None,
            leader_id: None,
            log: Vec::new(),
            snapshot_index: 0,
            snapshot_term: 0,
            commit_index: 0,
            last_applied: 0,
            votes_received: Vec::new(),
            next_index: HashMap::new(),
            match_index: HashMap::new(),
        }
    }

    /// Cluster members other than this node
    pub fn peers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.cluster_nodes.iter().copied().filter(move |&n| n != self.id)
    }

    pub fn is_leader(&self) -> bool {
        self.state == NodeState::Leader
    }

    pub fn hard_state(&self) -> HardState {
        HardState {
            current_term: self.current_term,
            voted_for: self.voted_for,
        }
    }

    pub fn restore_hard_state(&mut self, hard_state: HardState) {
        self.current_term = hard_state.current_term;
        self.voted_for = hard_state.voted_for;
    }

    // -- quorum --

    /// Strict majority of the full membership
    pub fn quorum_size(&self) -> usize {
        self.cluster_nodes.len() / 2 + 1
    }

    pub fn has_quorum(&self) -> bool {
        self.votes_received.len() >= self.quorum_size()
    }

    // -- log helpers --

    pub fn last_log_index(&self) -> u64 {
        self.log.last().map(|e| e.index).unwrap_or(self.snapshot_index)
    }

    pub fn last_log_term(&self) -> u64 {
        self.log.last().map(|e| e.term).unwrap_or(self.snapshot_term)
    }

    /// Entry at an absolute index, if it is still in the log
    pub fn get_entry(&self, index: u64) -> Option<&LogEntry> {
        if index <= self.snapshot_index {
            return None;
        }
        self.log.get((index - self.snapshot_index - 1) as usize)
    }

    /// Term of the entry at `index`, 0 when unknown
    pub fn get_term_at(&self, index: u64) -> u64 {
        if index == 0 {
            return 0;
        }
        if index == self.snapshot_index {
            return self.snapshot_term;
        }
        self.get_entry(index).map(|e| e.term).unwrap_or(0)
    }

    /// Entries from `start_index` (inclusive) to the end of the log
    pub fn get_entries_from(&self, start_index: u64) -> Vec<LogEntry> {
        let start = start_index.max(self.snapshot_index + 1);
        let offset = (start - self.snapshot_index - 1) as usize;
        self.log.get(offset..).map(<[LogEntry]>::to_vec).unwrap_or_default()
    }

    /// Candidate's log is at least as up-to-date as ours
    pub fn is_log_up_to_date(&self, last_log_index: u64, last_log_term: u64) -> bool {
        let our_term = self.last_log_term();
        last_log_term > our_term
            || (last_log_term == our_term && last_log_index >= self.last_log_index())
    }

    fn truncate_from(&mut self, index: u64) {
        if index > self.snapshot_index {
            self.log.truncate((index - self.snapshot_index - 1) as usize);
        }
    }

    // -- role transitions --

    /// Election timeout fired: become candidate for the next term
    ///
    /// returns the VoteRequest to broadcast. a single-node cluster wins at once.
    pub fn start_election(&mut self) -> RaftMessage {
        self.state = NodeState::Candidate;
        self.current_term += 1;
        self.voted_for = Some(self.id);
        self.leader_id = None;
        self.votes_received = vec![self.id];
        self.next_index.clear();
        self.match_index.clear();

        let request = RaftMessage::VoteRequest {
            term: self.current_term,
            candidate_id: self.id,
            last_log_index: self.last_log_index(),
            last_log_term: self.last_log_term(),
        };

        if self.has_quorum() {
            self.become_leader();
        }
        request
    }

    /// Step down, adopting `term` if it is newer
    pub fn become_follower(&mut self, term: u64) {
        if term > self.current_term {
            self.current_term = term;
            self.voted_for = None;
            self.leader_id = None;
        }
        self.state = NodeState::Follower;
        self.votes_received.clear();
        self.next_index.clear();
        self.match_index.clear();
    }

    pub fn become_leader(&mut self) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.id);
        self.votes_received.clear();

        let next = self.last_log_index() + 1;
        let peers: Vec<NodeId> = self.peers().collect();
        self.next_index = peers.iter().map(|&p| (p, next)).collect();
        self.match_index = peers.iter().map(|&p| (p, 0)).collect();
    }

    // -- elections --

    /// Handle a VoteRequest; returns the response and whether to reset the election timer
    pub fn handle_vote_request(
        &mut self,
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    ) -> (RaftMessage, bool) {
        if term < self.current_term {
            return (self.vote_response(false), false);
        }
        if term > self.current_term {
            self.become_follower(term);
        }

        let free_to_vote = self.voted_for.map_or(true, |v| v == candidate_id);
        let granted = free_to_vote && self.is_log_up_to_date(last_log_index, last_log_term);
        if granted {
            self.voted_for = Some(candidate_id);
        }
        (self.vote_response(granted), granted)
    }

    fn vote_response(&self, vote_granted: bool) -> RaftMessage {
        RaftMessage::VoteResponse {
            term: self.current_term,
            vote_granted,
        }
    }

    /// Count a vote; returns true when this response made us leader
    pub fn handle_vote_response(&mut self, term: u64, vote_granted: bool, from: NodeId) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if self.state != NodeState::Candidate || term != self.current_term || !vote_granted {
            return false;
        }
        if !self.votes_received.contains(&from) {
            self.votes_received.push(from);
        }
        if self.has_quorum() {
            self.become_leader();
            return true;
        }
        false
    }

    // -- leader replication --

    /// Append a client command to the leader's log
    pub fn append_entry(&mut self, command: Command) -> Option<LogEntry> {
        if !self.is_leader() {
            return None;
        }
        let entry = LogEntry::new(self.current_term, self.last_log_index() + 1, command);
        self.log.push(entry.clone());
        Some(entry)
    }

    /// Peer has fallen behind the compacted prefix
    pub fn needs_snapshot(&self, peer: NodeId) -> bool {
        self.snapshot_index > 0
            && self.next_index.get(&peer).map_or(false, |&next| next <= self.snapshot_index)
    }

    /// AppendEntries carrying everything from the peer's next index
    pub fn create_append_entries(&self, peer: NodeId) -> Option<RaftMessage> {
        self.append_entries_for(peer, true)
    }

    /// Empty AppendEntries anchored at the peer's next index
    pub fn create_heartbeat(&self, peer: NodeId) -> Option<RaftMessage> {
        self.append_entries_for(peer, false)
    }

    fn append_entries_for(&self, peer: NodeId, with_entries: bool) -> Option<RaftMessage> {
        if !self.is_leader() || self.needs_snapshot(peer) {
            return None;
        }
        let next = *self.next_index.get(&peer)?;
        let prev_log_index = next.saturating_sub(1);
        let entries = if with_entries {
            self.get_entries_from(next)
        } else {
            Vec::new()
        };
        Some(RaftMessage::AppendEntries {
            term: self.current_term,
            leader_id: self.id,
            prev_log_index,
            prev_log_term: self.get_term_at(prev_log_index),
            entries,
            leader_commit: self.commit_index,
        })
    }

    pub fn create_install_snapshot(&self, snapshot: &Snapshot) -> Option<RaftMessage> {
        if !self.is_leader() {
            return None;
        }
        Some(RaftMessage::InstallSnapshot {
            term: self.current_term,
            leader_id: self.id,
            last_included_index: snapshot.last_included_index,
            last_included_term: snapshot.last_included_term,
            entries: snapshot.entries.clone(),
        })
    }

    /// Record a peer's answer to AppendEntries
    ///
    /// `last_sent_index` is prev_log_index + number of entries in the request.
    /// returns true when the commit index advanced.
    pub fn handle_append_entries_response(
        &mut self,
        term: u64,
        success: bool,
        from: NodeId,
        last_sent_index: u64,
    ) -> bool {
        if term > self.current_term {
            self.become_follower(term);
            return false;
        }
        if !self.is_leader() || term < self.current_term {
            return false;
        }

        if success {
            let matched = self.match_index.entry(from).or_insert(0);
            *matched = (*matched).max(last_sent_index);
            let next = *matched + 1;
            self.next_index.insert(from, next);
            self.advance_commit_index()
        } else {
            let next = self.next_index.entry(from).or_insert(1);
            if *next > 1 {
                *next -= 1;
            }
            false
        }
    }

    pub fn handle_install_snapshot_response(
        &mut self,
        term: u64,
        from: NodeId,
        last_included_index: u64,
    ) -> bool {
        self.handle_append_entries_response(term, true, from, last_included_index)
    }

    /// Move the commit index to the highest current-term entry held by a quorum
    pub fn advance_commit_index(&mut self) -> bool {
        if !self.is_leader() {
            return false;
        }
        let mut replicated: Vec<u64> = self
            .peers()
            .map(|p| self.match_index.get(&p).copied().unwrap_or(0))
            .collect();
        replicated.push(self.last_log_index());
        replicated.sort_unstable_by(|a, b| b.cmp(a));

        let candidate = replicated[self.quorum_size() - 1];
        if candidate > self.commit_index && self.get_term_at(candidate) == self.current_term {
            self.commit_index = candidate;
            return true;
        }
        false
    }

    // -- follower side --

    /// Handle AppendEntries from a (claimed) leader
    pub fn handle_append_entries(
        &mut self,
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    ) -> AppendOutcome {
        if term < self.current_term {
            return AppendOutcome {
                response: self.append_response(false),
                reset_timer: false,
                log_change: None,
                commit_advanced: false,
            };
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);

        // entries at or below the snapshot are committed and match by definition
        let anchored = prev_log_index <= self.snapshot_index
            || (prev_log_index <= self.last_log_index()
                && self.get_term_at(prev_log_index) == prev_log_term);
        if !anchored {
            return AppendOutcome {
                response: self.append_response(false),
                reset_timer: true,
                log_change: None,
                commit_advanced: false,
            };
        }

        let last_new_index = prev_log_index + entries.len() as u64;
        let mut log_change = None;
        for (offset, entry) in entries.into_iter().enumerate() {
            let index = prev_log_index + 1 + offset as u64;
            if index <= self.snapshot_index {
                continue;
            }
            match self.get_entry(index).map(|e| e.term) {
                Some(existing) if existing == entry.term => continue,
                Some(_) => {
                    self.truncate_from(index);
                    self.log.push(LogEntry { index, ..entry });
                    log_change = Some(LogChange::Rewritten);
                }
                None => {
                    self.log.push(LogEntry { index, ..entry });
                    if log_change.is_none() {
                        log_change = Some(LogChange::Appended { from_index: index });
                    }
                }
            }
        }

        let mut commit_advanced = false;
        if leader_commit > self.commit_index {
            let verified = leader_commit.min(last_new_index).min(self.last_log_index());
            if verified > self.commit_index {
                self.commit_index = verified;
                commit_advanced = true;
            }
        }

        AppendOutcome {
            response: self.append_response(true),
            reset_timer: true,
            log_change,
            commit_advanced,
        }
    }

    fn append_response(&self, success: bool) -> RaftMessage {
        RaftMessage::AppendEntriesResponse {
            term: self.current_term,
            success,
        }
    }

    /// Handle InstallSnapshot; the caller replays and persists the image when `installed`
    pub fn handle_install_snapshot(
        &mut self,
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
    ) -> InstallOutcome {
        if term < self.current_term {
            return InstallOutcome {
                response: RaftMessage::InstallSnapshotResponse { term: self.current_term },
                reset_timer: false,
                installed: false,
            };
        }
        if term > self.current_term || self.state != NodeState::Follower {
            self.become_follower(term);
        }
        self.leader_id = Some(leader_id);

        let response = RaftMessage::InstallSnapshotResponse { term: self.current_term };
        if last_included_index <= self.commit_index {
            return InstallOutcome {
                response,
                reset_timer: true,
                installed: false,
            };
        }

        let keeps_suffix = last_included_index <= self.last_log_index()
            && self.get_term_at(last_included_index) == last_included_term;
        if keeps_suffix {
            let covered = (last_included_index - self.snapshot_index) as usize;
            self.log.drain(..covered);
        } else {
            self.log.clear();
        }
        self.snapshot_index = last_included_index;
        self.snapshot_term = last_included_term;
        self.commit_index = last_included_index;
        self.last_applied = last_included_index;

        InstallOutcome {
            response,
            reset_timer: true,
            installed: true,
        }
    }

    // -- apply & compaction --

    /// Committed entries not yet applied, in index order; advances last_applied
    pub fn get_entries_to_apply(&mut self) -> Vec<LogEntry> {
        let mut entries = Vec::new();
        while self.last_applied < self.commit_index {
            self.last_applied += 1;
            if let Some(entry) = self.get_entry(self.last_applied) {
                entries.push(entry.clone());
            }
        }
        entries
    }

    /// Drop the log prefix up to `through` (clamped to the applied index)
    ///
    /// returns the removed entries; the snapshot base moves to `through`
    pub fn compact_log(&mut self, through: u64) -> Vec<LogEntry> {
        let through = through.min(self.last_applied).min(self.last_log_index());
        if through <= self.snapshot_index {
            return Vec::new();
        }
        let term = self.get_term_at(through);
        let covered = (through - self.snapshot_index) as usize;
        let removed: Vec<LogEntry> = self.log.drain(..covered).collect();
        self.snapshot_index = through;
        self.snapshot_term = term;
        removed
    }

    /// Seed the log base from a snapshot loaded at startup
    pub fn restore_snapshot(&mut self, last_included_index: u64, last_included_term: u64) {
        self.log.retain(|e| e.index > last_included_index);
        self.snapshot_index = last_included_index;
        self.snapshot_term = last_included_term;
        self.commit_index = self.commit_index.max(last_included_index);
        self.last_applied = self.last_applied.max(last_included_index);
    }

    /// Append persisted entries after the snapshot; stops at the first gap
    pub fn load_log(&mut self, entries: Vec<LogEntry>) -> usize {
        let mut loaded = 0;
        for entry in entries {
            if entry.index <= self.last_log_index() {
                continue;
            }
            if entry.index != self.last_log_index() + 1 {
                break;
            }
            self.log.push(entry);
            loaded += 1;
        }
        loaded
    }

    /// Re-establish a persisted commit index, never past the log's end
    pub fn restore_commit_index(&mut self, commit_index: u64) {
        let bounded = commit_index.min(self.last_log_index());
        self.commit_index = self.commit_index.max(bounded);
    }

    pub fn status(&self) -> NodeStatus {
        NodeStatus {
            node_id: self.id,
            role: self.state,
            current_term: self.current_term,
            voted_for: self.voted_for,
            current_leader: self.leader_id,
            log_size: self.log.len(),
            commit_index: self.commit_index,
            last_applied: self.last_applied,
        }
    }
}

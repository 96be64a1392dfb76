//! # message
//!
//! why: define all raft rpc message types for node communication
//! relations: produced and consumed by node.rs, carried by raft-kv transports
//! what: VoteRequest, VoteResponse, AppendEntries, InstallSnapshot and their responses

use serde::{Deserialize, Serialize};

use crate::node::NodeId;
use crate::LogEntry;

/// All possible Raft messages between nodes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RaftMessage {
    /// Request a vote during leader election
    VoteRequest {
        term: u64,
        candidate_id: NodeId,
        last_log_index: u64,
        last_log_term: u64,
    },
    /// Response to a vote request
    VoteResponse { term: u64, vote_granted: bool },
    /// Replicate log entries (also serves as heartbeat when entries is empty)
    AppendEntries {
        term: u64,
        leader_id: NodeId,
        prev_log_index: u64,
        prev_log_term: u64,
        entries: Vec<LogEntry>,
        leader_commit: u64,
    },
    /// Response to AppendEntries
    AppendEntriesResponse { term: u64, success: bool },
    /// Ship a compacted state image to a follower that fell behind the leader's log
    InstallSnapshot {
        term: u64,
        leader_id: NodeId,
        last_included_index: u64,
        last_included_term: u64,
        entries: Vec<LogEntry>,
    },
    /// Response to InstallSnapshot
    InstallSnapshotResponse { term: u64 },
}

impl RaftMessage {
    /// The term carried by any message
    pub fn term(&self) -> u64 {
        match self {
            RaftMessage::VoteRequest { term, .. }
            | RaftMessage::VoteResponse { term, .. }
            | RaftMessage::AppendEntries { term, .. }
            | RaftMessage::AppendEntriesResponse { term, .. }
            | RaftMessage::InstallSnapshot { term, .. }
            | RaftMessage::InstallSnapshotResponse { term } => *term,
        }
    }

    /// Short name for logs
    pub fn kind(&self) -> &'static str {
        match self {
            RaftMessage::VoteRequest { .. } => "VoteRequest",
            RaftMessage::VoteResponse { .. } => "VoteResponse",
            RaftMessage::AppendEntries { .. } => "AppendEntries",
            RaftMessage::AppendEntriesResponse { .. } => "AppendEntriesResponse",
            RaftMessage::InstallSnapshot { .. } => "InstallSnapshot",
            RaftMessage::InstallSnapshotResponse { .. } => "InstallSnapshotResponse",
        }
    }
}

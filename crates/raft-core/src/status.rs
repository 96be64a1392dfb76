//! # status
//!
//! why: expose a read-only view of a node for monitoring
//! relations: built by RaftNode::status, published by raft-kv
//! what: NodeStatus

use serde::{Deserialize, Serialize};

use crate::{NodeId, NodeState};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub node_id: NodeId,
    pub role: NodeState,
    pub current_term: u64,
    pub voted_for: Option<NodeId>,
    pub current_leader: Option<NodeId>,
    pub log_size: usize,
    pub commit_index: u64,
    pub last_applied: u64,
}

//! # error
//!
//! why: give the consensus core one typed failure surface
//! relations: wrapped by raft-kv's KvError
//! what: RaftError

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RaftError {
    #[error("invalid raft configuration: {0}")]
    InvalidConfig(String),

    /// the log holds an entry the state machine cannot apply
    #[error("corrupt log entry at index {index}: {reason}")]
    CorruptEntry { index: u64, reason: String },

    #[error("unknown operation: {0}")]
    UnknownOperation(String),
}

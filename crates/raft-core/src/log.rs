//! # log
//!
//! why: describe the commands that raft replicates and the log entries carrying them
//! relations: used by node.rs for replication, persisted via raft-storage, applied by state_machine.rs
//! what: Operation, Command, LogEntry

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::RaftError;

/// The key-value operations a client can propose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    Put,
    Get,
    Delete,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Put => write!(f, "PUT"),
            Operation::Get => write!(f, "GET"),
            Operation::Delete => write!(f, "DELETE"),
        }
    }
}

impl FromStr for Operation {
    type Err = RaftError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "PUT" => Ok(Operation::Put),
            "GET" => Ok(Operation::Get),
            "DELETE" => Ok(Operation::Delete),
            _ => Err(RaftError::UnknownOperation(s.to_string())),
        }
    }
}

/// A client command: an operation on a key, with a value for puts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub operation: Operation,
    pub key: String,
    pub value: Option<String>,
}

impl Command {
    pub fn new(operation: Operation, key: impl Into<String>, value: Option<String>) -> Self {
        Self {
            operation,
            key: key.into(),
            value,
        }
    }

    pub fn put(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(Operation::Put, key, Some(value.into()))
    }

    pub fn get(key: impl Into<String>) -> Self {
        Self::new(Operation::Get, key, None)
    }

    pub fn delete(key: impl Into<String>) -> Self {
        Self::new(Operation::Delete, key, None)
    }
}

/// A single entry in the replicated log
///
/// entries are immutable once created; a conflicting entry is replaced as a whole
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term when this entry was created
    pub term: u64,
    /// The index of this entry in the log (1-indexed, 0 means "no entry")
    pub index: u64,
    /// The command to be applied to the state machine
    pub command: Command,
}

impl LogEntry {
    /// Create a new log entry
    pub fn new(term: u64, index: u64, command: Command) -> Self {
        Self {
            term,
            index,
            command,
        }
    }
}

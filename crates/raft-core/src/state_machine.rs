//! # state_machine
//!
//! why: define the deterministic key-value target that committed entries are applied to
//! relations: driven by raft-kv's apply path, restored from snapshot.rs
//! what: StateMachine trait, MemoryStateMachine, apply_entry

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{LogEntry, Operation, RaftError};

/// Key-value map that committed log entries are applied to
///
/// implementations must be deterministic: the same sequence of calls always
/// yields the same contents, with no side effects outside their own storage
pub trait StateMachine {
    fn put(&mut self, key: &str, value: &str);

    fn get(&self, key: &str) -> Option<String>;

    fn delete(&mut self, key: &str);

    /// drop every key (used before restoring a snapshot)
    fn clear(&mut self);
}

/// What applying one entry produced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyResult {
    /// PUT or DELETE acknowledged
    Ok,
    /// GET result
    Value(Option<String>),
}

/// Apply a committed entry to the state machine
///
/// a PUT without a value can only come from a corrupted log and is refused
/// before anything is mutated
pub fn apply_entry(
    machine: &mut dyn StateMachine,
    entry: &LogEntry,
) -> Result<ApplyResult, RaftError> {
    let command = &entry.command;
    match command.operation {
        Operation::Put => {
            let value = command.value.as_deref().ok_or_else(|| RaftError::CorruptEntry {
                index: entry.index,
                reason: format!("PUT {} carries no value", command.key),
            })?;
            machine.put(&command.key, value);
            Ok(ApplyResult::Ok)
        }
        Operation::Get => Ok(ApplyResult::Value(machine.get(&command.key))),
        Operation::Delete => {
            machine.delete(&command.key);
            Ok(ApplyResult::Ok)
        }
    }
}

/// In-memory state machine backed by an ordered map
#[derive(Debug, Default, Clone)]
pub struct MemoryStateMachine {
    data: BTreeMap<String, String>,
}

impl MemoryStateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl StateMachine for MemoryStateMachine {
    fn put(&mut self, key: &str, value: &str) {
        self.data.insert(key.to_string(), value.to_string());
    }

    fn get(&self, key: &str) -> Option<String> {
        self.data.get(key).cloned()
    }

    fn delete(&mut self, key: &str) {
        self.data.remove(key);
    }

    fn clear(&mut self) {
        self.data.clear();
    }
}

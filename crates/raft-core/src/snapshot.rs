//! # snapshot
//!
//! why: bound log growth by replacing the applied prefix with a compacted state image
//! relations: built by raft-kv's apply path, persisted via raft-storage, shipped in InstallSnapshot
//! what: Snapshot, the compaction fold and state machine restore

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{Command, LogEntry, Operation, StateMachine};

/// State machine image as of `last_included_index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// one PUT per live key, tagged with the entry that last wrote it
    pub entries: Vec<LogEntry>,
    pub last_included_index: u64,
    pub last_included_term: u64,
    pub created_at: DateTime<Utc>,
}

impl Snapshot {
    pub fn new(entries: Vec<LogEntry>, last_included_index: u64, last_included_term: u64) -> Self {
        Self {
            entries,
            last_included_index,
            last_included_term,
            created_at: Utc::now(),
        }
    }

    /// Fold the previous image and a freshly compacted log prefix into a new image
    ///
    /// GETs leave no trace, DELETEs drop the key; the result is sorted by key
    pub fn compact_entries(previous: Option<&Snapshot>, applied: &[LogEntry]) -> Vec<LogEntry> {
        let mut live: BTreeMap<String, LogEntry> = BTreeMap::new();
        let history = previous
            .map(|s| s.entries.as_slice())
            .unwrap_or_default()
            .iter()
            .chain(applied);

        for entry in history {
            match entry.command.operation {
                Operation::Put => {
                    if entry.command.value.is_some() {
                        live.insert(entry.command.key.clone(), entry.clone());
                    }
                }
                Operation::Delete => {
                    live.remove(&entry.command.key);
                }
                Operation::Get => {}
            }
        }

        live.into_values()
            .map(|e| {
                let command = Command::new(Operation::Put, e.command.key, e.command.value);
                LogEntry::new(e.term, e.index, command)
            })
            .collect()
    }

    /// Replace the machine's contents with this image
    pub fn restore_into(&self, machine: &mut dyn StateMachine) {
        machine.clear();
        for entry in &self.entries {
            match (&entry.command.operation, &entry.command.value) {
                (Operation::Put, Some(value)) => machine.put(&entry.command.key, value),
                (Operation::Delete, _) => machine.delete(&entry.command.key),
                _ => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStateMachine;

    #[test]
    fn compaction_keeps_last_write_per_key() {
        let applied = vec![
            LogEntry::new(1, 1, Command::put("a", "1")),
            LogEntry::new(1, 2, Command::put("b", "2")),
            LogEntry::new(2, 3, Command::put("a", "3")),
            LogEntry::new(2, 4, Command::get("b")),
            LogEntry::new(2, 5, Command::delete("b")),
        ];

        let entries = Snapshot::compact_entries(None, &applied);

        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].command, Command::put("a", "3"));
        assert_eq!(entries[0].index, 3);
    }

    #[test]
    fn compaction_carries_previous_image_forward() {
        let first_prefix = [LogEntry::new(1, 1, Command::put("a", "1"))];
        let first = Snapshot::new(Snapshot::compact_entries(None, &first_prefix), 1, 1);

        let second_prefix = [LogEntry::new(1, 2, Command::put("b", "2"))];
        let entries = Snapshot::compact_entries(Some(&first), &second_prefix);

        let keys: Vec<_> = entries.iter().map(|e| e.command.key.as_str()).collect();
        assert_eq!(keys, vec!["a", "b"]);
    }

    #[test]
    fn restore_replaces_machine_contents() {
        let mut machine = MemoryStateMachine::new();
        machine.put("stale", "x");
        let snapshot = Snapshot::new(vec![LogEntry::new(1, 1, Command::put("a", "1"))], 1, 1);

        snapshot.restore_into(&mut machine);

        assert_eq!(machine.get("stale"), None);
        assert_eq!(machine.get("a"), Some("1".to_string()));
    }
}

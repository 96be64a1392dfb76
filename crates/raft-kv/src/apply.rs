//! # apply
//!
//! why: turn committed log entries into state machine changes and client answers
//! relations: runs under the node lock, called from node.rs and replication.rs
//! what: apply_committed, take_snapshot

use raft_core::{apply_entry, Snapshot};
use tracing::{debug, info};

use crate::error::{KvError, Result};
use crate::node::Shared;

impl Shared {
    /// Apply (last_applied, commit_index] in order and answer waiting proposals
    ///
    /// the commit index is made durable first, so a restart re-applies no further
    /// than what was known committed
    pub(crate) fn apply_committed(&mut self) -> Result<()> {
        self.storage.save_commit_index(self.raft.commit_index)?;

        let entries = self.raft.get_entries_to_apply();
        if entries.is_empty() {
            return Ok(());
        }
        for entry in &entries {
            let outcome = apply_entry(self.machine.as_mut(), entry);
            let waiter = self.pending.remove(&entry.index);
            match outcome {
                Ok(result) => {
                    if let Some(pending) = waiter {
                        let answer = if pending.term == entry.term {
                            Ok(result)
                        } else {
                            Err(KvError::Consensus(format!(
                                "entry {} was replaced by a later leader",
                                entry.index
                            )))
                        };
                        let _ = pending.tx.send(answer);
                    }
                }
                Err(e) => {
                    if let Some(pending) = waiter {
                        let _ = pending.tx.send(Err(KvError::Consensus(e.to_string())));
                    }
                    return Err(e.into());
                }
            }
        }
        debug!(
            node_id = self.raft.id,
            applied = entries.len(),
            last_applied = self.raft.last_applied,
            "applied committed entries"
        );

        if self.raft.config.should_snapshot(self.raft.log.len()) {
            self.take_snapshot()?;
        }
        Ok(())
    }

    /// Fold the applied prefix into a snapshot and keep only the unapplied suffix
    pub(crate) fn take_snapshot(&mut self) -> Result<()> {
        let through = self.raft.last_applied;
        let removed = self.raft.compact_log(through);
        if removed.is_empty() {
            return Ok(());
        }

        let entries = Snapshot::compact_entries(self.latest_snapshot.as_ref(), &removed);
        let snapshot =
            self.snapshots
                .save(entries, self.raft.snapshot_index, self.raft.snapshot_term)?;

        let suffix = self.raft.log.clone();
        self.storage.overwrite_log(&suffix)?;

        info!(
            node_id = self.raft.id,
            last_included_index = snapshot.last_included_index,
            last_included_term = snapshot.last_included_term,
            keys = snapshot.entries.len(),
            kept_entries = suffix.len(),
            "snapshot taken"
        );
        self.latest_snapshot = Some(snapshot);
        Ok(())
    }
}

//! # snapshot store
//!
//! why: keep the latest compacted state image across restarts
//! relations: written by raft-kv after compaction or InstallSnapshot, read once at startup
//! what: SnapshotStore trait, FileSnapshotStore (snapshot.json), InMemorySnapshotStore

use std::fs;
use std::io;
use std::path::PathBuf;

use raft_core::{LogEntry, Snapshot};

use crate::{invalid_data, write_atomic};

/// Durable home of the most recent snapshot; saving replaces the previous one
pub trait SnapshotStore: Send {
    fn save(
        &mut self,
        entries: Vec<LogEntry>,
        last_included_index: u64,
        last_included_term: u64,
    ) -> io::Result<Snapshot>;

    fn load(&self) -> io::Result<Option<Snapshot>>;
}

pub struct FileSnapshotStore {
    path: PathBuf,
}

impl FileSnapshotStore {
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            path: dir.join("snapshot.json"),
        })
    }
}

impl SnapshotStore for FileSnapshotStore {
    fn save(
        &mut self,
        entries: Vec<LogEntry>,
        last_included_index: u64,
        last_included_term: u64,
    ) -> io::Result<Snapshot> {
        let snapshot = Snapshot::new(entries, last_included_index, last_included_term);
        let json = serde_json::to_vec(&snapshot).map_err(invalid_data)?;
        write_atomic(&self.path, &json)?;
        Ok(snapshot)
    }

    fn load(&self) -> io::Result<Option<Snapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let contents = fs::read(&self.path)?;
        serde_json::from_slice(&contents).map(Some).map_err(invalid_data)
    }
}

#[derive(Debug, Default)]
pub struct InMemorySnapshotStore {
    latest: Option<Snapshot>,
}

impl InMemorySnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SnapshotStore for InMemorySnapshotStore {
    fn save(
        &mut self,
        entries: Vec<LogEntry>,
        last_included_index: u64,
        last_included_term: u64,
    ) -> io::Result<Snapshot> {
        let snapshot = Snapshot::new(entries, last_included_index, last_included_term);
        self.latest = Some(snapshot.clone());
        Ok(snapshot)
    }

    fn load(&self) -> io::Result<Option<Snapshot>> {
        Ok(self.latest.clone())
    }
}

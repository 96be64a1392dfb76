//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: used by raft-kv to persist what raft-core decides; snapshot.rs holds compacted images
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

pub mod snapshot;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use raft_core::{LogEntry, NodeId};
use serde::{Deserialize, Serialize};

pub use snapshot::{FileSnapshotStore, InMemorySnapshotStore, SnapshotStore};

/// trait for durable storage of raft state
///
/// every write must be durable when the call returns: the node acknowledges
/// votes and entries right after persisting them
pub trait Storage: Send {
    /// persist the current term and voted_for
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()>;

    /// load the persisted term and voted_for
    fn load_term_and_vote(&self) -> io::Result<(u64, Option<NodeId>)>;

    /// append entries to the end of the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// replace the whole log (after a conflict truncation or a compaction)
    fn overwrite_log(&mut self, entries: &[LogEntry]) -> io::Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> io::Result<Vec<LogEntry>>;

    fn clear_log(&mut self) -> io::Result<()> {
        self.overwrite_log(&[])
    }

    /// persist the highest index known committed
    fn save_commit_index(&mut self, commit_index: u64) -> io::Result<()>;

    fn load_commit_index(&self) -> io::Result<u64>;

    /// clear all persisted state
    fn clear(&mut self) -> io::Result<()>;
}

pub(crate) fn invalid_data(err: serde_json::Error) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// write `bytes` to `path` through a synced temp file and a rename
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let temp_path = path.with_extension("tmp");
    let mut file = File::create(&temp_path)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&temp_path, path)
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term, voted_for and commit index
/// - log.jsonl: one log entry per line, appended in place
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
    /// last persisted metadata; every save rewrites the whole record
    meta: MetaData,
}

/// metadata structure for term, vote and commit index
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct MetaData {
    term: u64,
    voted_for: Option<NodeId>,
    #[serde(default)]
    commit_index: u64,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist and reads any existing metadata
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let mut storage = Self {
            dir,
            meta: MetaData::default(),
        };
        storage.meta = storage.read_meta()?;
        Ok(storage)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    fn read_meta(&self) -> io::Result<MetaData> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(MetaData::default()); // default for new nodes
        }
        let contents = fs::read_to_string(&path)?;
        serde_json::from_str(&contents).map_err(invalid_data)
    }

    fn write_meta(&mut self, meta: MetaData) -> io::Result<()> {
        let json = serde_json::to_string_pretty(&meta).map_err(invalid_data)?;
        write_atomic(&self.meta_path(), json.as_bytes())?;
        self.meta = meta;
        Ok(())
    }

    fn encode_lines(entries: &[LogEntry]) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry).map_err(invalid_data)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

impl Storage for FileStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        let meta = MetaData {
            term,
            voted_for,
            ..self.meta
        };
        self.write_meta(meta)
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<NodeId>)> {
        let meta = self.read_meta()?;
        Ok((meta.term, meta.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let buf = Self::encode_lines(entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.log_path())?;
        file.write_all(&buf)?;
        file.sync_data()
    }

    fn overwrite_log(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        let buf = Self::encode_lines(entries)?;
        write_atomic(&self.log_path(), &buf)
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut log = Vec::new();
        for line in reader.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            log.push(serde_json::from_str(&line).map_err(invalid_data)?);
        }
        Ok(log)
    }

    fn save_commit_index(&mut self, commit_index: u64) -> io::Result<()> {
        if commit_index == self.meta.commit_index {
            return Ok(());
        }
        let meta = MetaData {
            commit_index,
            ..self.meta
        };
        self.write_meta(meta)
    }

    fn load_commit_index(&self) -> io::Result<u64> {
        Ok(self.read_meta()?.commit_index)
    }

    fn clear(&mut self) -> io::Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        self.meta = MetaData::default();
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    term: u64,
    voted_for: Option<NodeId>,
    commit_index: u64,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_term_and_vote(&mut self, term: u64, voted_for: Option<NodeId>) -> io::Result<()> {
        self.term = term;
        self.voted_for = voted_for;
        Ok(())
    }

    fn load_term_and_vote(&self) -> io::Result<(u64, Option<NodeId>)> {
        Ok((self.term, self.voted_for))
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log.extend_from_slice(entries);
        Ok(())
    }

    fn overwrite_log(&mut self, entries: &[LogEntry]) -> io::Result<()> {
        self.log = entries.to_vec();
        Ok(())
    }

    fn load_log(&self) -> io::Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn save_commit_index(&mut self, commit_index: u64) -> io::Result<()> {
        self.commit_index = commit_index;
        Ok(())
    }

    fn load_commit_index(&self) -> io::Result<u64> {
        Ok(self.commit_index)
    }

    fn clear(&mut self) -> io::Result<()> {
        *self = Self::default();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft_core::Command;
    use tempfile::tempdir;

    fn entry(term: u64, index: u64) -> LogEntry {
        LogEntry::new(term, index, Command::put(format!("key{index}"), "v"))
    }

    #[test]
    fn in_memory_storage_persists_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(5, Some(2)).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (5, Some(2)));
    }

    #[test]
    fn in_memory_storage_overwrites_log() {
        let mut storage = InMemoryStorage::new();
        storage
            .append_entries(&[entry(1, 1), entry(1, 2), entry(1, 3)])
            .unwrap();

        storage.overwrite_log(&[entry(1, 1), entry(2, 2)]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
    }

    #[test]
    fn file_storage_appends_line_per_entry() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.append_entries(&[entry(1, 1)]).unwrap();
        storage.append_entries(&[entry(1, 2), entry(2, 3)]).unwrap();

        let raw = fs::read_to_string(dir.path().join("log.jsonl")).unwrap();
        assert_eq!(raw.lines().count(), 3);
        assert_eq!(storage.load_log().unwrap()[2].term, 2);
    }

    #[test]
    fn commit_index_does_not_disturb_vote() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(3, Some(1)).unwrap();
        storage.save_commit_index(9).unwrap();
        storage.save_term_and_vote(4, None).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (4, None));
        assert_eq!(storage.load_commit_index().unwrap(), 9);
    }

    #[test]
    fn corrupt_log_line_is_invalid_data() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::new(dir.path()).unwrap();
        fs::write(dir.path().join("log.jsonl"), "{not json}\n").unwrap();

        let err = storage.load_log().unwrap_err();

        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }
}

//! # comprehensive storage tests
//!
//! why: verify all storage scenarios work correctly
//! relations: tests raft-storage crate
//! what: persistence, crash recovery, snapshots, atomic writes, edge cases

use std::fs;

use raft_core::{Command, LogEntry, MemoryStateMachine, Snapshot, StateMachine};
use raft_storage::{
    FileSnapshotStore, FileStorage, InMemorySnapshotStore, InMemoryStorage, SnapshotStore, Storage,
};
use tempfile::tempdir;

fn entry(term: u64, index: u64) -> LogEntry {
    LogEntry::new(term, index, Command::put(format!("k{index}"), format!("v{index}")))
}

fn entries(term: u64, range: std::ops::RangeInclusive<u64>) -> Vec<LogEntry> {
    range.map(|i| entry(term, i)).collect()
}

// =============================================================================
// SECTION 1: IN-MEMORY STORAGE TESTS
// =============================================================================

mod in_memory_basic {
    use super::*;

    #[test]
    fn new_storage_has_default_values() {
        let storage = InMemoryStorage::new();

        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert_eq!(storage.load_commit_index().unwrap(), 0);
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn overwrite_term_and_vote() {
        let mut storage = InMemoryStorage::new();

        storage.save_term_and_vote(1, Some(1)).unwrap();
        storage.save_term_and_vote(5, None).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (5, None));
    }

    #[test]
    fn append_in_batches() {
        let mut storage = InMemoryStorage::new();

        storage.append_entries(&entries(1, 1..=2)).unwrap();
        storage.append_entries(&[]).unwrap();
        storage.append_entries(&entries(2, 3..=3)).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[2].term, 2);
    }

    #[test]
    fn overwrite_log_replaces_contents() {
        let mut storage = InMemoryStorage::new();
        storage.append_entries(&entries(1, 1..=5)).unwrap();

        storage.overwrite_log(&entries(2, 4..=5)).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.iter().map(|e| e.index).collect::<Vec<_>>(), vec![4, 5]);
    }

    #[test]
    fn clear_resets_all_state() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(5, Some(3)).unwrap();
        storage.save_commit_index(4).unwrap();
        storage.append_entries(&entries(5, 1..=4)).unwrap();

        storage.clear().unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert_eq!(storage.load_commit_index().unwrap(), 0);
        assert!(storage.load_log().unwrap().is_empty());
    }
}

// =============================================================================
// SECTION 2: FILE STORAGE TESTS
// =============================================================================

mod file_storage_basic {
    use super::*;

    #[test]
    fn create_storage_creates_directory() {
        let dir = tempdir().unwrap();
        let nested = dir.path().join("a").join("b");

        FileStorage::new(&nested).unwrap();

        assert!(nested.is_dir());
    }

    #[test]
    fn term_vote_and_commit_share_the_meta_file() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.save_term_and_vote(1, Some(2)).unwrap();
        storage.save_commit_index(4).unwrap();

        let meta = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        assert!(meta.contains("\"commit_index\": 4"));
        assert_eq!(storage.load_term_and_vote().unwrap(), (1, Some(2)));
        assert!(!dir.path().join("log.jsonl").exists());
    }

    #[test]
    fn conflicting_suffix_is_replaced() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.append_entries(&entries(1, 1..=3)).unwrap();

        let mut kept = entries(1, 1..=1);
        kept.extend(entries(2, 2..=2));
        storage.overwrite_log(&kept).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].term, 2);
    }

    #[test]
    fn clear_log_keeps_term_and_vote() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(3, Some(2)).unwrap();
        storage.append_entries(&entries(3, 1..=3)).unwrap();

        storage.clear_log().unwrap();

        assert!(storage.load_log().unwrap().is_empty());
        assert_eq!(storage.load_term_and_vote().unwrap(), (3, Some(2)));
    }
}

// =============================================================================
// SECTION 3: CRASH RECOVERY / PERSISTENCE TESTS
// =============================================================================

mod crash_recovery {
    use super::*;

    #[test]
    fn term_vote_and_commit_survive_restart() {
        let dir = tempdir().unwrap();

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(10, Some(1)).unwrap();
            storage.save_commit_index(7).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (10, Some(1)));
        assert_eq!(storage.load_commit_index().unwrap(), 7);
    }

    #[test]
    fn log_survives_restart() {
        let dir = tempdir().unwrap();
        let written = entries(4, 1..=5);

        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.append_entries(&written).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_log().unwrap(), written);
    }

    #[test]
    fn multiple_restarts_preserve_state() {
        let dir = tempdir().unwrap();

        for round in 1..=3u64 {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            let (term, _) = storage.load_term_and_vote().unwrap();
            assert_eq!(term, round - 1);

            storage.save_term_and_vote(round, Some(round)).unwrap();
            storage.append_entries(&[entry(round, round)]).unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (3, Some(3)));
        assert_eq!(storage.load_log().unwrap().len(), 3);
    }

    #[test]
    fn load_after_clear_returns_defaults() {
        let dir = tempdir().unwrap();
        {
            let mut storage = FileStorage::new(dir.path()).unwrap();
            storage.save_term_and_vote(5, Some(1)).unwrap();
            storage.append_entries(&entries(5, 1..=2)).unwrap();
            storage.clear().unwrap();
        }

        let storage = FileStorage::new(dir.path()).unwrap();
        assert_eq!(storage.load_term_and_vote().unwrap(), (0, None));
        assert!(storage.load_log().unwrap().is_empty());
    }

    #[test]
    fn clear_twice_is_fine() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        storage.clear().unwrap();
        storage.clear().unwrap();
    }
}

// =============================================================================
// SECTION 4: SNAPSHOT STORE TESTS
// =============================================================================

mod snapshot_store {
    use super::*;

    #[test]
    fn snapshot_round_trip_keeps_index_and_term() {
        let dir = tempdir().unwrap();
        let image = Snapshot::compact_entries(None, &entries(2, 1..=4));

        let saved = {
            let mut store = FileSnapshotStore::new(dir.path()).unwrap();
            store.save(image.clone(), 4, 2).unwrap()
        };

        let store = FileSnapshotStore::new(dir.path()).unwrap();
        let loaded = store.load().unwrap().unwrap();
        assert_eq!(loaded.last_included_index, 4);
        assert_eq!(loaded.last_included_term, 2);
        assert_eq!(loaded.entries, image);
        assert_eq!(loaded, saved);
    }

    #[test]
    fn loaded_snapshot_restores_state_machine() {
        let mut store = InMemorySnapshotStore::new();
        let mut applied = entries(1, 1..=3);
        applied.push(LogEntry::new(1, 4, Command::delete("k2")));
        store
            .save(Snapshot::compact_entries(None, &applied), 4, 1)
            .unwrap();

        let mut machine = MemoryStateMachine::new();
        store.load().unwrap().unwrap().restore_into(&mut machine);

        assert_eq!(machine.get("k1"), Some("v1".to_string()));
        assert_eq!(machine.get("k2"), None);
        assert_eq!(machine.len(), 2);
    }

    #[test]
    fn corrupt_snapshot_is_an_error() {
        let dir = tempdir().unwrap();
        let store = FileSnapshotStore::new(dir.path()).unwrap();
        fs::write(dir.path().join("snapshot.json"), b"garbage").unwrap();

        assert!(store.load().is_err());
    }
}

// =============================================================================
// SECTION 5: ATOMIC WRITE TESTS
// =============================================================================

mod atomic_writes {
    use super::*;

    #[test]
    fn meta_file_is_valid_json() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        storage.save_term_and_vote(5, Some(3)).unwrap();

        let contents = fs::read_to_string(dir.path().join("meta.json")).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();

        assert_eq!(parsed["term"], 5);
        assert_eq!(parsed["voted_for"], 3);
    }

    #[test]
    fn no_temp_files_remain() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let mut snapshots = FileSnapshotStore::new(dir.path()).unwrap();

        storage.save_term_and_vote(1, None).unwrap();
        storage.overwrite_log(&entries(1, 1..=3)).unwrap();
        snapshots.save(vec![], 3, 1).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(Result::ok)
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }
}

// =============================================================================
// SECTION 6: EDGE CASES
// =============================================================================

mod edge_cases {
    use super::*;

    #[test]
    fn large_value() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let big = LogEntry::new(1, 1, Command::put("big", "x".repeat(1024 * 1024)));

        storage.append_entries(std::slice::from_ref(&big)).unwrap();

        assert_eq!(storage.load_log().unwrap()[0], big);
    }

    #[test]
    fn many_log_entries() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();

        for index in 1..=500 {
            storage.append_entries(&[entry(1, index)]).unwrap();
        }

        assert_eq!(storage.load_log().unwrap().len(), 500);
    }

    #[test]
    fn newlines_and_unicode_in_values() {
        let dir = tempdir().unwrap();
        let mut storage = FileStorage::new(dir.path()).unwrap();
        let tricky = LogEntry::new(1, 1, Command::put("línea", "uno\ndos 🚀"));

        storage.append_entries(&[tricky.clone(), entry(1, 2)]).unwrap();

        let log = storage.load_log().unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[0], tricky);
    }

    #[test]
    fn very_high_term_number() {
        let mut storage = InMemoryStorage::new();
        storage.save_term_and_vote(u64::MAX, Some(u64::MAX)).unwrap();
        assert_eq!(
            storage.load_term_and_vote().unwrap(),
            (u64::MAX, Some(u64::MAX))
        );
    }
}

// =============================================================================
// SECTION 7: STORAGE TRAIT POLYMORPHISM
// =============================================================================

mod trait_polymorphism {
    use super::*;

    fn exercise(storage: &mut dyn Storage) {
        storage.save_term_and_vote(5, Some(2)).unwrap();
        storage.append_entries(&entries(5, 1..=3)).unwrap();
        storage.overwrite_log(&entries(5, 1..=2)).unwrap();
        storage.save_commit_index(2).unwrap();

        assert_eq!(storage.load_term_and_vote().unwrap(), (5, Some(2)));
        assert_eq!(storage.load_log().unwrap().len(), 2);
        assert_eq!(storage.load_commit_index().unwrap(), 2);
    }

    #[test]
    fn in_memory_implements_trait() {
        exercise(&mut InMemoryStorage::new());
    }

    #[test]
    fn file_storage_implements_trait() {
        let dir = tempdir().unwrap();
        exercise(&mut FileStorage::new(dir.path()).unwrap());
    }

    #[test]
    fn storage_is_boxable_and_sendable() {
        let storage: Box<dyn Storage> = Box::new(InMemoryStorage::new());
        std::thread::spawn(move || drop(storage)).join().unwrap();
    }
}

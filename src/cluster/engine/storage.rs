//! In-memory raft log storage.
//!
//! The log starts at index 1 and is never compacted, so a joining voter
//! replays the entire statement history and snapshot transfer is never
//! required.  This bounds restart durability to what the engine
//! provides; the out-of-band peer store is the bootstrap oracle after a
//! crash.

use std::sync::{Arc, RwLock};

use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};

/// Shared handle to the log.  Clones see the same state, which lets the
/// worker keep a write handle while `RawNode` holds the read side.
#[derive(Clone, Default)]
pub struct LogStore {
    core: Arc<RwLock<LogCore>>,
}

#[derive(Default)]
struct LogCore {
    hard_state: HardState,
    conf_state: ConfState,
    /// `entries[i].index == i as u64 + 1`.
    entries: Vec<Entry>,
}

impl LogStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the configuration with an initial voter set.  Used by the
    /// bootstrap leader (itself) and by restarting members (the peer
    /// file's addresses).
    pub fn initialize(&self, voters: Vec<u64>) {
        let mut core = self.core.write().expect("log store lock poisoned");
        core.conf_state = ConfState::from((voters, vec![]));
    }

    /// Append entries, truncating any conflicting suffix first.
    pub fn append(&self, ents: &[Entry]) {
        if ents.is_empty() {
            return;
        }
        let mut core = self.core.write().expect("log store lock poisoned");
        let first_new = ents[0].index;
        let last_kept = first_new.saturating_sub(1) as usize;
        assert!(
            last_kept <= core.entries.len(),
            "log gap: appending {} after {}",
            first_new,
            core.entries.len()
        );
        core.entries.truncate(last_kept);
        core.entries.extend_from_slice(ents);
    }

    pub fn set_hard_state(&self, hs: HardState) {
        self.core.write().expect("log store lock poisoned").hard_state = hs;
    }

    pub fn set_commit(&self, commit: u64) {
        self.core
            .write()
            .expect("log store lock poisoned")
            .hard_state
            .commit = commit;
    }

    pub fn set_conf_state(&self, cs: ConfState) {
        self.core.write().expect("log store lock poisoned").conf_state = cs;
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.core.read().expect("log store lock poisoned");
        Ok(RaftState {
            hard_state: core.hard_state.clone(),
            conf_state: core.conf_state.clone(),
        })
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.core.read().expect("log store lock poisoned");
        if low < 1 {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.entries.len() as u64 + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let mut ents: Vec<Entry> =
            core.entries[(low - 1) as usize..(high - 1) as usize].to_vec();
        raft::util::limit_size(&mut ents, max_size.into());
        Ok(ents)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        if idx == 0 {
            return Ok(0);
        }
        let core = self.core.read().expect("log store lock poisoned");
        core.entries
            .get((idx - 1) as usize)
            .map(|e| e.term)
            .ok_or(raft::Error::Store(StorageError::Unavailable))
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(1)
    }

    fn last_index(&self) -> raft::Result<u64> {
        let core = self.core.read().expect("log store lock poisoned");
        Ok(core.entries.len() as u64)
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        // The full log is always available, so the engine never has a
        // reason to fall back to snapshot transfer.
        Err(raft::Error::Store(
            StorageError::SnapshotTemporarilyUnavailable,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(index: u64, term: u64) -> Entry {
        let mut e = Entry::default();
        e.index = index;
        e.term = term;
        e
    }

    #[test]
    fn test_empty_log() {
        let store = LogStore::new();
        assert_eq!(store.first_index().unwrap(), 1);
        assert_eq!(store.last_index().unwrap(), 0);
        assert_eq!(store.term(0).unwrap(), 0);
        assert!(store.term(1).is_err());
    }

    #[test]
    fn test_append_and_read() {
        let store = LogStore::new();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 2)]);

        assert_eq!(store.last_index().unwrap(), 3);
        assert_eq!(store.term(3).unwrap(), 2);

        let ents = store
            .entries(1, 4, None, GetEntriesContext::empty(false))
            .unwrap();
        assert_eq!(ents.len(), 3);
        assert_eq!(ents[2].index, 3);
    }

    #[test]
    fn test_append_truncates_conflicting_suffix() {
        let store = LogStore::new();
        store.append(&[entry(1, 1), entry(2, 1), entry(3, 1)]);
        // A new leader overwrites from index 2.
        store.append(&[entry(2, 2), entry(3, 2), entry(4, 2)]);

        assert_eq!(store.last_index().unwrap(), 4);
        assert_eq!(store.term(2).unwrap(), 2);
        assert_eq!(store.term(4).unwrap(), 2);
    }

    #[test]
    fn test_entries_out_of_range() {
        let store = LogStore::new();
        store.append(&[entry(1, 1)]);
        assert!(store
            .entries(1, 3, None, GetEntriesContext::empty(false))
            .is_err());
    }

    #[test]
    fn test_initial_state_carries_voters() {
        let store = LogStore::new();
        store.initialize(vec![7, 9]);
        let state = store.initial_state().unwrap();
        assert_eq!(state.conf_state.voters, vec![7, 9]);
    }

    #[test]
    fn test_snapshot_unavailable() {
        let store = LogStore::new();
        assert!(matches!(
            store.snapshot(1, 2),
            Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable
            ))
        ));
    }
}

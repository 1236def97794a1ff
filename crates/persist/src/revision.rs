//! Revision entries and the append-only store that holds them.

use crate::codec::{self, Format};
use crate::error::{CodecError, RevisionError};
use chrono::{DateTime, Utc};
use palimpsest_common::{Document, SubjectId, Value};
use std::collections::BTreeMap;

/// One immutable snapshot of one subject at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct RevisionEntry {
    /// Most-derived type of the subject when it was captured.
    pub subject_type: String,
    pub subject_id: SubjectId,
    /// Unique and strictly increasing per subject, starting at 1.
    pub revision: u64,
    /// Compressed, tagged snapshot document.
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// Set on the entry captured right before the subject was deleted.
    pub trash: bool,
    pub metadata: BTreeMap<String, Value>,
}

impl RevisionEntry {
    /// Decode the snapshot document.
    pub fn document(&self) -> Result<Document, CodecError> {
        codec::decode(&self.payload)
    }

    pub fn format(&self) -> Result<Format, CodecError> {
        codec::detect(&self.payload)
    }
}

/// Persistence for revision entries, keyed by `(subject_type, subject_id, revision)`.
///
/// Implementations are not part of the entity store's transactions. Callers
/// that need all-or-nothing behaviour across both compensate explicitly.
pub trait RevisionStore {
    /// Append an entry. Fails with [`RevisionError::DuplicateRevision`] when
    /// the key is taken.
    fn insert(&mut self, entry: RevisionEntry) -> Result<(), RevisionError>;

    /// Every entry of a subject, newest revision first.
    fn history(&self, subject_type: &str, id: &SubjectId) -> Result<Vec<RevisionEntry>, RevisionError>;

    fn find(&self, subject_type: &str, id: &SubjectId, revision: u64) -> Result<Option<RevisionEntry>, RevisionError>;

    fn latest(&self, subject_type: &str, id: &SubjectId) -> Result<Option<RevisionEntry>, RevisionError> {
        Ok(self.history(subject_type, id)?.into_iter().next())
    }

    /// Highest revision number stored for a subject, or 0.
    fn max_revision(&self, subject_type: &str, id: &SubjectId) -> Result<u64, RevisionError> {
        Ok(self.latest(subject_type, id)?.map_or(0, |e| e.revision))
    }

    /// Delete every entry of a subject numbered `revision` or lower.
    /// Returns the removed entries, oldest first.
    fn delete_through(
        &mut self,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
    ) -> Result<Vec<RevisionEntry>, RevisionError>;

    fn delete(&mut self, subject_type: &str, id: &SubjectId, revision: u64) -> Result<bool, RevisionError>;

    /// Delete a subject's whole history. Returns how many entries went.
    fn delete_subject(&mut self, subject_type: &str, id: &SubjectId) -> Result<usize, RevisionError>;

    fn set_trash(
        &mut self,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
        trash: bool,
    ) -> Result<bool, RevisionError>;

    /// Subjects of `subject_type` with at least one trashed entry, each with
    /// the creation time of its newest trashed entry.
    fn trashed_subjects(&self, subject_type: &str) -> Result<Vec<(SubjectId, DateTime<Utc>)>, RevisionError>;
}

type EntryKey = (String, SubjectId, u64);

/// In-memory [`RevisionStore`].
#[derive(Debug, Default, Clone)]
pub struct MemoryRevisionStore {
    entries: BTreeMap<EntryKey, RevisionEntry>,
}

impl MemoryRevisionStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn subject_range<'a>(
        &'a self,
        subject_type: &str,
        id: &SubjectId,
    ) -> impl DoubleEndedIterator<Item = &'a RevisionEntry> + 'a {
        let lo = (subject_type.to_string(), id.clone(), 0);
        let hi = (subject_type.to_string(), id.clone(), u64::MAX);
        self.entries.range(lo..=hi).map(|(_, e)| e)
    }

    fn key(subject_type: &str, id: &SubjectId, revision: u64) -> EntryKey {
        (subject_type.to_string(), id.clone(), revision)
    }
}

impl RevisionStore for MemoryRevisionStore {
    fn insert(&mut self, entry: RevisionEntry) -> Result<(), RevisionError> {
        let key = Self::key(&entry.subject_type, &entry.subject_id, entry.revision);
        if self.entries.contains_key(&key) {
            return Err(RevisionError::DuplicateRevision {
                subject_type: entry.subject_type,
                subject_id: entry.subject_id,
                revision: entry.revision,
            });
        }
        self.entries.insert(key, entry);
        Ok(())
    }

    fn history(&self, subject_type: &str, id: &SubjectId) -> Result<Vec<RevisionEntry>, RevisionError> {
        Ok(self.subject_range(subject_type, id).rev().cloned().collect())
    }

    fn find(&self, subject_type: &str, id: &SubjectId, revision: u64) -> Result<Option<RevisionEntry>, RevisionError> {
        Ok(self.entries.get(&Self::key(subject_type, id, revision)).cloned())
    }

    fn latest(&self, subject_type: &str, id: &SubjectId) -> Result<Option<RevisionEntry>, RevisionError> {
        Ok(self.subject_range(subject_type, id).next_back().cloned())
    }

    fn delete_through(
        &mut self,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
    ) -> Result<Vec<RevisionEntry>, RevisionError> {
        let doomed: Vec<u64> = self
            .subject_range(subject_type, id)
            .map(|e| e.revision)
            .take_while(|&r| r <= revision)
            .collect();
        Ok(doomed
            .into_iter()
            .filter_map(|r| self.entries.remove(&Self::key(subject_type, id, r)))
            .collect())
    }

    fn delete(&mut self, subject_type: &str, id: &SubjectId, revision: u64) -> Result<bool, RevisionError> {
        Ok(self.entries.remove(&Self::key(subject_type, id, revision)).is_some())
    }

    fn delete_subject(&mut self, subject_type: &str, id: &SubjectId) -> Result<usize, RevisionError> {
        Ok(self.delete_through(subject_type, id, u64::MAX)?.len())
    }

    fn set_trash(
        &mut self,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
        trash: bool,
    ) -> Result<bool, RevisionError> {
        match self.entries.get_mut(&Self::key(subject_type, id, revision)) {
            Some(entry) => {
                entry.trash = trash;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn trashed_subjects(&self, subject_type: &str) -> Result<Vec<(SubjectId, DateTime<Utc>)>, RevisionError> {
        let mut newest: BTreeMap<SubjectId, DateTime<Utc>> = BTreeMap::new();
        for entry in self
            .entries
            .values()
            .filter(|e| e.trash && e.subject_type == subject_type)
        {
            let slot = newest.entry(entry.subject_id.clone()).or_insert(entry.created_at);
            *slot = (*slot).max(entry.created_at);
        }
        Ok(newest.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn entry(subject: i64, revision: u64, minute: i64) -> RevisionEntry {
        RevisionEntry {
            subject_type: "Post".into(),
            subject_id: SubjectId::from(subject),
            revision,
            payload: Vec::new(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(minute),
            trash: false,
            metadata: BTreeMap::new(),
        }
    }

    fn seeded() -> MemoryRevisionStore {
        let mut store = MemoryRevisionStore::new();
        for r in 1..=4 {
            store.insert(entry(1, r, r as i64)).unwrap();
        }
        store.insert(entry(2, 1, 0)).unwrap();
        store
    }

    #[test]
    fn history_is_newest_first_and_per_subject() {
        let store = seeded();
        let revs: Vec<u64> = store
            .history("Post", &SubjectId::from(1))
            .unwrap()
            .iter()
            .map(|e| e.revision)
            .collect();
        assert_eq!(revs, vec![4, 3, 2, 1]);
        assert_eq!(store.max_revision("Post", &SubjectId::from(1)).unwrap(), 4);
        assert_eq!(store.max_revision("Post", &SubjectId::from(9)).unwrap(), 0);
        assert_eq!(store.max_revision("Comment", &SubjectId::from(1)).unwrap(), 0);
    }

    #[test]
    fn duplicate_revision_is_rejected() {
        let mut store = seeded();
        let err = store.insert(entry(1, 2, 9)).unwrap_err();
        assert!(matches!(err, RevisionError::DuplicateRevision { revision: 2, .. }));
    }

    #[test]
    fn delete_through_returns_removed_oldest_first() {
        let mut store = seeded();
        let removed = store.delete_through("Post", &SubjectId::from(1), 2).unwrap();
        assert_eq!(removed.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(store.history("Post", &SubjectId::from(1)).unwrap().len(), 2);
        assert_eq!(store.history("Post", &SubjectId::from(2)).unwrap().len(), 1);
    }

    #[test]
    fn trashed_subjects_reports_newest_trash_time() {
        let mut store = seeded();
        store.set_trash("Post", &SubjectId::from(1), 2, true).unwrap();
        store.set_trash("Post", &SubjectId::from(1), 4, true).unwrap();
        assert!(!store.set_trash("Post", &SubjectId::from(1), 99, true).unwrap());
        let trashed = store.trashed_subjects("Post").unwrap();
        assert_eq!(trashed.len(), 1);
        assert_eq!(trashed[0].1, entry(1, 4, 4).created_at);
        assert_eq!(store.delete_subject("Post", &SubjectId::from(1)).unwrap(), 4);
        assert_eq!(store.len(), 1);
    }
}

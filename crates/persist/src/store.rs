//! File-backed revision persistence.
//!
//! Layout inside the store directory:
//! ```text
//! revisions.meta.json   - schema version and payload file counter
//! index.json            - one record per entry, with the payload's sha256
//! entries/
//!   00000001.rev        - compressed snapshot payload
//! ```

use crate::error::RevisionError;
use crate::revision::{RevisionEntry, RevisionStore};
use chrono::{DateTime, Utc};
use palimpsest_common::{SubjectId, Value};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Current on-disk schema version.
const STORE_SCHEMA_VERSION: u32 = 1;

const META_FILE: &str = "revisions.meta.json";
const INDEX_FILE: &str = "index.json";
const ENTRIES_DIR: &str = "entries";

/// Metadata stored in revisions.meta.json.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreMeta {
    pub schema_version: u32,
    /// Number of the last payload file written. Never reused.
    pub file_counter: u64,
}

/// One line of the index: everything about an entry except its payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexEntry {
    pub subject_type: String,
    pub subject_id: SubjectId,
    pub revision: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub trash: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    pub filename: String,
    pub sha256: String,
}

impl IndexEntry {
    fn matches(&self, subject_type: &str, id: &SubjectId) -> bool {
        self.subject_type == subject_type && &self.subject_id == id
    }
}

/// [`RevisionStore`] kept in a directory, with schema versioning and
/// payload integrity checks.
pub struct FileRevisionStore {
    root: PathBuf,
    meta: StoreMeta,
    index: Vec<IndexEntry>,
}

impl FileRevisionStore {
    /// Open or create a revision store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RevisionError> {
        let root = path.as_ref().to_path_buf();
        std::fs::create_dir_all(root.join(ENTRIES_DIR))?;

        let meta_path = root.join(META_FILE);
        let index_path = root.join(INDEX_FILE);

        let (meta, index) = if meta_path.exists() {
            let meta: StoreMeta = serde_json::from_reader(std::fs::File::open(&meta_path)?)?;
            if meta.schema_version != STORE_SCHEMA_VERSION {
                return Err(RevisionError::SchemaMismatch {
                    file_version: meta.schema_version,
                    expected_version: STORE_SCHEMA_VERSION,
                });
            }
            let index: Vec<IndexEntry> = if index_path.exists() {
                serde_json::from_reader(std::fs::File::open(&index_path)?)?
            } else {
                Vec::new()
            };
            (meta, index)
        } else {
            let meta = StoreMeta {
                schema_version: STORE_SCHEMA_VERSION,
                file_counter: 0,
            };
            serde_json::to_writer_pretty(std::fs::File::create(&meta_path)?, &meta)?;
            serde_json::to_writer_pretty(std::fs::File::create(&index_path)?, &Vec::<IndexEntry>::new())?;
            (meta, Vec::new())
        };

        debug!(root = %root.display(), entries = index.len(), "opened revision store");
        Ok(Self { root, meta, index })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn meta(&self) -> &StoreMeta {
        &self.meta
    }

    /// Every index record, in insertion order.
    pub fn index(&self) -> &[IndexEntry] {
        &self.index
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// Distinct subject types with at least one entry.
    pub fn subject_types(&self) -> Vec<String> {
        let types: BTreeSet<&str> = self.index.iter().map(|e| e.subject_type.as_str()).collect();
        types.into_iter().map(str::to_string).collect()
    }

    /// Distinct subjects of a type, with their entry counts.
    pub fn subjects(&self, subject_type: &str) -> Vec<(SubjectId, usize)> {
        let mut counts: BTreeMap<&SubjectId, usize> = BTreeMap::new();
        for entry in self.index.iter().filter(|e| e.subject_type == subject_type) {
            *counts.entry(&entry.subject_id).or_default() += 1;
        }
        counts.into_iter().map(|(id, n)| (id.clone(), n)).collect()
    }

    /// Re-hash every payload file against the index.
    pub fn verify_integrity(&self) -> Result<(), RevisionError> {
        let mut seen = BTreeSet::new();
        for entry in &self.index {
            if !seen.insert((&entry.subject_type, &entry.subject_id, entry.revision)) {
                return Err(RevisionError::DuplicateRevision {
                    subject_type: entry.subject_type.clone(),
                    subject_id: entry.subject_id.clone(),
                    revision: entry.revision,
                });
            }
            self.read_payload(entry)?;
        }
        Ok(())
    }

    fn payload_path(&self, filename: &str) -> PathBuf {
        self.root.join(ENTRIES_DIR).join(filename)
    }

    /// Read a payload and check it against its recorded hash. Fail-closed.
    fn read_payload(&self, entry: &IndexEntry) -> Result<Vec<u8>, RevisionError> {
        let data = std::fs::read(self.payload_path(&entry.filename))?;
        let actual = sha256_hex(&data);
        if actual != entry.sha256 {
            return Err(RevisionError::IntegrityMismatch {
                expected: entry.sha256.clone(),
                actual,
            });
        }
        Ok(data)
    }

    fn load(&self, entry: &IndexEntry) -> Result<RevisionEntry, RevisionError> {
        Ok(RevisionEntry {
            subject_type: entry.subject_type.clone(),
            subject_id: entry.subject_id.clone(),
            revision: entry.revision,
            payload: self.read_payload(entry)?,
            created_at: entry.created_at,
            trash: entry.trash,
            metadata: entry.metadata.clone(),
        })
    }

    fn position(&self, subject_type: &str, id: &SubjectId, revision: u64) -> Option<usize> {
        self.index
            .iter()
            .position(|e| e.revision == revision && e.matches(subject_type, id))
    }

    /// Drop the index records selected by `doomed` and their payload files.
    fn remove_where(&mut self, doomed: impl Fn(&IndexEntry) -> bool) -> Result<Vec<RevisionEntry>, RevisionError> {
        let mut entries = self
            .index
            .iter()
            .filter(|e| doomed(e))
            .map(|e| self.load(e))
            .collect::<Result<Vec<_>, _>>()?;
        let files: Vec<String> = self
            .index
            .iter()
            .filter(|e| doomed(e))
            .map(|e| e.filename.clone())
            .collect();
        self.index.retain(|e| !doomed(e));
        self.save_index()?;
        for filename in files {
            std::fs::remove_file(self.payload_path(&filename))?;
        }
        entries.sort_by_key(|e| e.revision);
        Ok(entries)
    }

    fn save_meta(&self) -> Result<(), RevisionError> {
        let path = self.root.join(META_FILE);
        serde_json::to_writer_pretty(std::fs::File::create(path)?, &self.meta)?;
        Ok(())
    }

    /// Write the index to a sibling file, then rename it into place.
    fn save_index(&self) -> Result<(), RevisionError> {
        let tmp = self.root.join(format!("{INDEX_FILE}.tmp"));
        serde_json::to_writer_pretty(std::fs::File::create(&tmp)?, &self.index)?;
        std::fs::rename(tmp, self.root.join(INDEX_FILE))?;
        Ok(())
    }
}

impl RevisionStore for FileRevisionStore {
    fn insert(&mut self, entry: RevisionEntry) -> Result<(), RevisionError> {
        if self
            .position(&entry.subject_type, &entry.subject_id, entry.revision)
            .is_some()
        {
            return Err(RevisionError::DuplicateRevision {
                subject_type: entry.subject_type,
                subject_id: entry.subject_id,
                revision: entry.revision,
            });
        }

        self.meta.file_counter += 1;
        let filename = format!("{:08}.rev", self.meta.file_counter);
        std::fs::write(self.payload_path(&filename), &entry.payload)?;
        self.save_meta()?;

        self.index.push(IndexEntry {
            sha256: sha256_hex(&entry.payload),
            subject_type: entry.subject_type,
            subject_id: entry.subject_id,
            revision: entry.revision,
            created_at: entry.created_at,
            trash: entry.trash,
            metadata: entry.metadata,
            filename,
        });
        self.save_index()
    }

    fn history(&self, subject_type: &str, id: &SubjectId) -> Result<Vec<RevisionEntry>, RevisionError> {
        let mut records: Vec<&IndexEntry> = self.index.iter().filter(|e| e.matches(subject_type, id)).collect();
        records.sort_by(|a, b| b.revision.cmp(&a.revision));
        records.into_iter().map(|e| self.load(e)).collect()
    }

    fn find(&self, subject_type: &str, id: &SubjectId, revision: u64) -> Result<Option<RevisionEntry>, RevisionError> {
        self.position(subject_type, id, revision)
            .map(|i| self.load(&self.index[i]))
            .transpose()
    }

    fn latest(&self, subject_type: &str, id: &SubjectId) -> Result<Option<RevisionEntry>, RevisionError> {
        self.index
            .iter()
            .filter(|e| e.matches(subject_type, id))
            .max_by_key(|e| e.revision)
            .map(|e| self.load(e))
            .transpose()
    }

    fn max_revision(&self, subject_type: &str, id: &SubjectId) -> Result<u64, RevisionError> {
        Ok(self
            .index
            .iter()
            .filter(|e| e.matches(subject_type, id))
            .map(|e| e.revision)
            .max()
            .unwrap_or(0))
    }

    fn delete_through(
        &mut self,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
    ) -> Result<Vec<RevisionEntry>, RevisionError> {
        self.remove_where(|e| e.revision <= revision && e.matches(subject_type, id))
    }

    fn delete(&mut self, subject_type: &str, id: &SubjectId, revision: u64) -> Result<bool, RevisionError> {
        Ok(!self
            .remove_where(|e| e.revision == revision && e.matches(subject_type, id))?
            .is_empty())
    }

    fn delete_subject(&mut self, subject_type: &str, id: &SubjectId) -> Result<usize, RevisionError> {
        Ok(self.remove_where(|e| e.matches(subject_type, id))?.len())
    }

    fn set_trash(
        &mut self,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
        trash: bool,
    ) -> Result<bool, RevisionError> {
        let Some(i) = self.position(subject_type, id, revision) else {
            return Ok(false);
        };
        self.index[i].trash = trash;
        self.save_index()?;
        Ok(true)
    }

    fn trashed_subjects(&self, subject_type: &str) -> Result<Vec<(SubjectId, DateTime<Utc>)>, RevisionError> {
        let mut newest: BTreeMap<&SubjectId, DateTime<Utc>> = BTreeMap::new();
        for entry in self.index.iter().filter(|e| e.trash && e.subject_type == subject_type) {
            let slot = newest.entry(&entry.subject_id).or_insert(entry.created_at);
            *slot = (*slot).max(entry.created_at);
        }
        Ok(newest.into_iter().map(|(id, at)| (id.clone(), at)).collect())
    }
}

fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::codec::{self, Format};
    use crate::config::{Retention, RevisionConfig};
    use crate::fixtures;
    use crate::log::RevisionLog;
    use chrono::TimeZone;
    use palimpsest_common::Document;
    use palimpsest_store::EntityStore;

    fn entry(id: i64, revision: u64) -> RevisionEntry {
        let doc = Document::new().with("id", id).with("title", format!("rev {revision}"));
        RevisionEntry {
            subject_type: "Post".into(),
            subject_id: SubjectId::from(id),
            revision,
            payload: codec::encode(&doc, Format::Cbor).unwrap(),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, revision as u32).unwrap(),
            trash: false,
            metadata: BTreeMap::from([("label".to_string(), Value::from("nightly"))]),
        }
    }

    #[test]
    fn open_creates_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let store = FileRevisionStore::open(tmp.path().join("revs")).unwrap();
        assert_eq!(store.meta().schema_version, STORE_SCHEMA_VERSION);
        assert_eq!(store.meta().file_counter, 0);
        assert!(store.root().join(ENTRIES_DIR).is_dir());
        assert!(store.root().join(META_FILE).is_file());
        assert!(store.root().join(INDEX_FILE).is_file());
        assert!(store.is_empty());
    }

    #[test]
    fn reopen_preserves_entries() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("revs");
        {
            let mut store = FileRevisionStore::open(&path).unwrap();
            store.insert(entry(1, 1)).unwrap();
            store.insert(entry(1, 2)).unwrap();
            store.insert(entry(2, 1)).unwrap();
        }

        let store = FileRevisionStore::open(&path).unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.meta().file_counter, 3);
        let history = store.history("Post", &SubjectId::from(1)).unwrap();
        assert_eq!(history.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![2, 1]);
        assert_eq!(history[0], entry(1, 2));
        assert_eq!(
            history[0].document().unwrap().value("title"),
            Some(&Value::from("rev 2"))
        );
        assert_eq!(store.max_revision("Post", &SubjectId::from(2)).unwrap(), 1);
        assert_eq!(store.subject_types(), vec!["Post".to_string()]);
        assert_eq!(
            store.subjects("Post"),
            vec![(SubjectId::from(1), 2), (SubjectId::from(2), 1)]
        );
    }

    #[test]
    fn duplicate_revision_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileRevisionStore::open(tmp.path()).unwrap();
        store.insert(entry(1, 1)).unwrap();
        let err = store.insert(entry(1, 1)).unwrap_err();
        assert!(matches!(err, RevisionError::DuplicateRevision { revision: 1, .. }));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn deletes_remove_payload_files() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileRevisionStore::open(tmp.path()).unwrap();
        for revision in 1..=4 {
            store.insert(entry(1, revision)).unwrap();
        }
        let id = SubjectId::from(1);

        let removed = store.delete_through("Post", &id, 2).unwrap();
        assert_eq!(removed.iter().map(|e| e.revision).collect::<Vec<_>>(), vec![1, 2]);
        assert!(!tmp.path().join(ENTRIES_DIR).join("00000001.rev").exists());
        assert!(tmp.path().join(ENTRIES_DIR).join("00000003.rev").exists());

        assert!(store.delete("Post", &id, 4).unwrap());
        assert!(!store.delete("Post", &id, 4).unwrap());
        assert_eq!(store.delete_subject("Post", &id).unwrap(), 1);
        assert!(store.is_empty());

        // File numbers are not reused after deletion.
        store.insert(entry(1, 5)).unwrap();
        assert_eq!(store.index()[0].filename, "00000005.rev");
    }

    #[test]
    fn trash_flags_survive_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let mut store = FileRevisionStore::open(tmp.path()).unwrap();
            store.insert(entry(1, 1)).unwrap();
            store.insert(entry(1, 2)).unwrap();
            store.insert(entry(2, 1)).unwrap();
            assert!(store.set_trash("Post", &SubjectId::from(1), 1, true).unwrap());
            assert!(store.set_trash("Post", &SubjectId::from(1), 2, true).unwrap());
            assert!(!store.set_trash("Post", &SubjectId::from(9), 1, true).unwrap());
        }
        let store = FileRevisionStore::open(tmp.path()).unwrap();
        assert_eq!(
            store.trashed_subjects("Post").unwrap(),
            vec![(SubjectId::from(1), entry(1, 2).created_at)]
        );
        assert!(store.trashed_subjects("Comment").unwrap().is_empty());
    }

    #[test]
    fn corruption_is_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileRevisionStore::open(tmp.path()).unwrap();
        store.insert(entry(1, 1)).unwrap();
        store.insert(entry(1, 2)).unwrap();
        store.verify_integrity().unwrap();

        let path = tmp.path().join(ENTRIES_DIR).join("00000002.rev");
        let mut data = std::fs::read(&path).unwrap();
        if let Some(byte) = data.last_mut() {
            *byte ^= 0xff;
        }
        std::fs::write(&path, &data).unwrap();

        let store = FileRevisionStore::open(tmp.path()).unwrap();
        assert!(matches!(
            store.verify_integrity(),
            Err(RevisionError::IntegrityMismatch { .. })
        ));
        let id = SubjectId::from(1);
        assert!(store.find("Post", &id, 2).is_err());
        assert!(store.find("Post", &id, 1).unwrap().is_some());
        assert!(store.history("Post", &id).is_err());
        // Numbering needs only the index.
        assert_eq!(store.max_revision("Post", &id).unwrap(), 2);
    }

    #[test]
    fn missing_payload_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut store = FileRevisionStore::open(tmp.path()).unwrap();
        store.insert(entry(1, 1)).unwrap();
        std::fs::remove_file(tmp.path().join(ENTRIES_DIR).join("00000001.rev")).unwrap();
        assert!(matches!(store.verify_integrity(), Err(RevisionError::Io(_))));
    }

    #[test]
    fn schema_mismatch_fail_closed() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("revs");
        let _store = FileRevisionStore::open(&path).unwrap();

        let meta_path = path.join(META_FILE);
        let mut meta: StoreMeta = serde_json::from_reader(std::fs::File::open(&meta_path).unwrap()).unwrap();
        meta.schema_version = 999;
        serde_json::to_writer_pretty(std::fs::File::create(&meta_path).unwrap(), &meta).unwrap();

        match FileRevisionStore::open(&path) {
            Err(RevisionError::SchemaMismatch {
                file_version,
                expected_version,
            }) => {
                assert_eq!(file_version, 999);
                assert_eq!(expected_version, STORE_SCHEMA_VERSION);
            }
            Err(e) => panic!("expected SchemaMismatch, got: {e}"),
            Ok(_) => panic!("expected error, got Ok"),
        }
    }

    #[test]
    fn revision_log_runs_on_files() {
        let tmp = tempfile::tempdir().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap());
        let (mut live, post) = fixtures::blog_with_post();
        let id = SubjectId::from(1);
        {
            let mut log = RevisionLog::new(FileRevisionStore::open(tmp.path()).unwrap()).with_clock(clock.clone());
            log.configure(
                "Post",
                RevisionConfig::new()
                    .selector(fixtures::full_selector())
                    .format(Format::Xml)
                    .retention(Retention::unlimited().limit(1)),
            );
            for _ in 0..3 {
                log.capture(&live, &post).unwrap();
                log.truncate("Post", &id, &Retention::unlimited().limit(1)).unwrap();
            }
        }

        let revisions = FileRevisionStore::open(tmp.path()).unwrap();
        assert_eq!(revisions.len(), 1);
        let mut log = RevisionLog::new(revisions).with_clock(clock);
        log.configure("Post", RevisionConfig::new().selector(fixtures::full_selector()));
        let last = log.last_revision("Post", &id).unwrap().unwrap();
        assert_eq!(last.revision, 3);
        assert_eq!(last.format().unwrap(), Format::Xml);

        live.delete("Post", &id).unwrap();
        let restored = log.restore_last_and_persist(&mut live, "Post", &id).unwrap().unwrap();
        assert!(restored.errors.is_empty());
        assert_eq!(fixtures::bodies(&live), vec!["first", "second"]);
    }
}

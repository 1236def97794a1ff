//! The revision log: capture, retention, trash, restore, and scoped capture
//! around mutations.

use crate::clock::{Clock, SystemClock};
use crate::codec;
use crate::config::{Retention, RevisionConfig, Settings};
use crate::error::{FieldError, RevisionError};
use crate::reconciler;
use crate::restorer::{self, DetachedEntity};
use crate::revision::{RevisionEntry, RevisionStore};
use crate::serializer;
use chrono::{DateTime, Duration, Utc};
use palimpsest_common::SubjectId;
use palimpsest_store::{EntityStore, Record, TypeMetadata, TypeResolver};
use std::collections::BTreeMap;
use tracing::{error, info, info_span, warn};

/// Whether a scoped capture is the outermost one for its subject.
///
/// Only an `Outer` scope captures. Mutations receive `Nested` and pass it on
/// to any scoped capture they trigger, which then runs without capturing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureScope {
    Outer,
    Nested,
}

/// A persisted restore, with whatever could not be restored.
#[derive(Debug, Clone, PartialEq)]
pub struct Restoration {
    pub record: Record,
    pub errors: Vec<FieldError>,
}

/// What a scoped capture wrote to the revision store, so it can be undone.
struct Captured {
    entry: RevisionEntry,
    truncated: Vec<RevisionEntry>,
}

pub struct RevisionLog<R> {
    revisions: R,
    defaults: RevisionConfig,
    configs: BTreeMap<String, RevisionConfig>,
    clock: Box<dyn Clock>,
}

impl<R: RevisionStore> RevisionLog<R> {
    pub fn new(revisions: R) -> Self {
        Self {
            revisions,
            defaults: RevisionConfig::default(),
            configs: BTreeMap::new(),
            clock: Box::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    pub fn with_defaults(mut self, config: RevisionConfig) -> Self {
        self.defaults = config;
        self
    }

    /// Apply a settings file: its defaults and every per-type entry.
    pub fn with_settings(mut self, settings: &Settings) -> Self {
        self.defaults = settings.defaults.to_config();
        self.configs.extend(settings.configs());
        self
    }

    pub fn configure(&mut self, subject_type: impl Into<String>, config: RevisionConfig) {
        self.configs.insert(subject_type.into(), config);
    }

    /// The config registered for exactly `subject_type`, or the defaults.
    pub fn config_for(&self, subject_type: &str) -> &RevisionConfig {
        self.configs.get(subject_type).unwrap_or(&self.defaults)
    }

    /// The config that applies to `subject_type`: its own, then its
    /// family's, then the defaults.
    pub fn effective_config<M: TypeMetadata + ?Sized>(&self, meta: &M, subject_type: &str) -> &RevisionConfig {
        self.configs
            .get(subject_type)
            .or_else(|| {
                meta.schema(subject_type)
                    .and_then(|schema| self.configs.get(schema.family_name()))
            })
            .unwrap_or(&self.defaults)
    }

    pub fn revisions(&self) -> &R {
        &self.revisions
    }

    pub fn revisions_mut(&mut self) -> &mut R {
        &mut self.revisions
    }

    pub fn into_revisions(self) -> R {
        self.revisions
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Snapshot `record` as its subject's next revision.
    pub fn capture<S: EntityStore + ?Sized>(&mut self, store: &S, record: &Record) -> Result<RevisionEntry, RevisionError> {
        let subject_type = record.type_name().to_string();
        let schema = store
            .schema(&subject_type)
            .ok_or_else(|| RevisionError::UnknownType(subject_type.clone()))?;
        let subject_id = schema.id_of(record).ok_or_else(|| RevisionError::MissingId {
            type_name: subject_type.clone(),
        })?;

        let (payload, metadata) = {
            let config = self.effective_config(store, &subject_type);
            let doc = serializer::serialize(store, record, &config.selector)?;
            (codec::encode(&doc, config.format)?, config.metadata_for(record))
        };
        let revision = self.revisions.max_revision(&subject_type, &subject_id)? + 1;
        let entry = RevisionEntry {
            subject_type,
            subject_id,
            revision,
            payload,
            created_at: self.clock.now(),
            trash: false,
            metadata,
        };
        self.revisions.insert(entry.clone())?;
        info!(
            subject_type = %entry.subject_type,
            subject_id = %entry.subject_id,
            revision,
            bytes = entry.payload.len(),
            "captured revision"
        );
        Ok(entry)
    }

    /// Prune a subject's history. Returns the removed entries.
    ///
    /// The cutoff is the entry at offset `limit` among revisions at least
    /// `min_age` old, newest first. Every revision up to and including the
    /// cutoff is removed, whatever its age.
    pub fn truncate(
        &mut self,
        subject_type: &str,
        id: &SubjectId,
        retention: &Retention,
    ) -> Result<Vec<RevisionEntry>, RevisionError> {
        if retention.is_unlimited() {
            return Ok(Vec::new());
        }
        let cutoff = retention.min_age.map(|age| self.age_cutoff(age));
        let history = self.revisions.history(subject_type, id)?;
        let threshold = history
            .iter()
            .filter(|e| cutoff.is_none_or(|c| e.created_at <= c))
            .nth(retention.limit.unwrap_or(0))
            .map(|e| e.revision);
        let Some(threshold) = threshold else {
            return Ok(Vec::new());
        };
        let removed = self.revisions.delete_through(subject_type, id, threshold)?;
        info!(subject_type, subject_id = %id, through = threshold, removed = removed.len(), "truncated revisions");
        Ok(removed)
    }

    /// Mark a subject's newest revision as trash.
    pub fn mark_trash(&mut self, subject_type: &str, id: &SubjectId) -> Result<Option<RevisionEntry>, RevisionError> {
        let Some(mut entry) = self.revisions.latest(subject_type, id)? else {
            return Ok(None);
        };
        self.revisions.set_trash(subject_type, id, entry.revision, true)?;
        entry.trash = true;
        info!(subject_type, subject_id = %id, revision = entry.revision, "marked revision as trash");
        Ok(Some(entry))
    }

    /// Purge the whole history of every subject whose newest trashed entry
    /// is at least `max_age` old. Returns how many entries were removed.
    pub fn empty_trash(&mut self, subject_type: &str, max_age: Duration) -> Result<usize, RevisionError> {
        let cutoff = self.age_cutoff(max_age);
        let mut removed = 0;
        for (id, trashed_at) in self.revisions.trashed_subjects(subject_type)? {
            if trashed_at <= cutoff {
                removed += self.revisions.delete_subject(subject_type, &id)?;
            }
        }
        info!(subject_type, removed, "emptied trash");
        Ok(removed)
    }

    pub fn history(&self, subject_type: &str, id: &SubjectId) -> Result<Vec<RevisionEntry>, RevisionError> {
        self.revisions.history(subject_type, id)
    }

    pub fn find_revision(
        &self,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
    ) -> Result<Option<RevisionEntry>, RevisionError> {
        self.revisions.find(subject_type, id, revision)
    }

    pub fn last_revision(&self, subject_type: &str, id: &SubjectId) -> Result<Option<RevisionEntry>, RevisionError> {
        self.revisions.latest(subject_type, id)
    }

    /// Rebuild a revision as a detached graph without touching the store.
    /// `None` when the revision does not exist.
    pub fn restore_to_memory<M>(
        &self,
        meta: &M,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
    ) -> Result<Option<DetachedEntity>, RevisionError>
    where
        M: TypeMetadata + TypeResolver + ?Sized,
    {
        let Some(entry) = self.revisions.find(subject_type, id, revision)? else {
            return Ok(None);
        };
        let doc = entry.document()?;
        let config = self.effective_config(meta, &entry.subject_type);
        let mut entity = restorer::restore(meta, &doc, &entry.subject_type, &config.selector)?;

        // Keys that are not stored columns are not in the snapshot.
        if let Some(schema) = meta.schema(entity.type_name()) {
            for (column, key) in schema.key_columns().iter().zip(entry.subject_id.components()) {
                if entity.record().get(column).is_none() {
                    entity.record_mut().set(column.clone(), key.to_value());
                }
            }
        }
        Ok(Some(entity))
    }

    /// Restore a revision onto the live store.
    ///
    /// The current state is captured first, so the restore can itself be
    /// undone. A subject that no longer exists is re-created without a
    /// pre-restore capture.
    pub fn restore_and_persist<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        subject_type: &str,
        id: &SubjectId,
        revision: u64,
    ) -> Result<Option<Restoration>, RevisionError> {
        let span = info_span!("restore", subject_type, subject_id = %id, revision);
        let _enter = span.enter();

        let Some(entity) = self.restore_to_memory(&*store, subject_type, id, revision)? else {
            return Ok(None);
        };
        for e in entity.errors() {
            warn!(field = %e.field, message = %e.message, "restored with error");
        }
        let errors = entity.errors().to_vec();
        let record = self.with_revision(store, subject_type, id, CaptureScope::Outer, |store, _| {
            reconciler::apply(store, &entity)
        })?;
        info!(errors = errors.len(), "restored revision");
        Ok(Some(Restoration { record, errors }))
    }

    /// Restore the newest revision. `None` when the subject has no history.
    pub fn restore_last_and_persist<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        subject_type: &str,
        id: &SubjectId,
    ) -> Result<Option<Restoration>, RevisionError> {
        match self.revisions.latest(subject_type, id)? {
            Some(entry) => self.restore_and_persist(store, subject_type, id, entry.revision),
            None => Ok(None),
        }
    }

    /// Run `mutation` with the subject's pre-mutation state captured.
    ///
    /// In an `Outer` scope, the current state is captured and the history
    /// truncated inside a store transaction. If the mutation fails, the
    /// store is rolled back and the capture and truncation are undone
    /// before the original error is returned. A `Nested` scope just runs
    /// the mutation.
    pub fn with_revision<S, T, F>(
        &mut self,
        store: &mut S,
        subject_type: &str,
        id: &SubjectId,
        scope: CaptureScope,
        mutation: F,
    ) -> Result<T, RevisionError>
    where
        S: EntityStore + ?Sized,
        F: FnOnce(&mut S, CaptureScope) -> Result<T, RevisionError>,
    {
        if scope == CaptureScope::Nested {
            return mutation(store, CaptureScope::Nested);
        }
        let span = info_span!("with_revision", subject_type, subject_id = %id);
        let _enter = span.enter();

        store.begin()?;
        let captured = match self.capture_and_truncate(&*store, subject_type, id) {
            Ok(captured) => captured,
            Err(e) => {
                rollback_quietly(store);
                return Err(e);
            }
        };

        match mutation(store, CaptureScope::Nested) {
            Ok(value) => match store.commit() {
                Ok(()) => Ok(value),
                Err(e) => {
                    rollback_quietly(store);
                    self.discard(captured);
                    Err(e.into())
                }
            },
            Err(e) => {
                if e.is_validation() {
                    warn!(error = %e, "mutation rejected, discarding revision");
                } else {
                    warn!(error = %e, "mutation failed, discarding revision");
                }
                rollback_quietly(store);
                self.discard(captured);
                Err(e)
            }
        }
    }

    /// Delete a subject, honouring its `on_destroy` and `keep_revisions`
    /// settings. Returns whether it existed.
    pub fn destroy<S: EntityStore + ?Sized>(
        &mut self,
        store: &mut S,
        subject_type: &str,
        id: &SubjectId,
        scope: CaptureScope,
    ) -> Result<bool, RevisionError> {
        let Some(record) = store.find(subject_type, id)? else {
            return Ok(false);
        };
        let concrete = record.type_name().to_string();
        let (on_destroy, keep_revisions) = {
            let config = self.effective_config(&*store, &concrete);
            (config.on_destroy, config.keep_revisions)
        };

        store.begin()?;
        let mut trashed = None;
        if on_destroy && scope == CaptureScope::Outer {
            let entry = match self.capture(&*store, &record) {
                Ok(entry) => entry,
                Err(e) => {
                    rollback_quietly(store);
                    return Err(e);
                }
            };
            let marked = self
                .revisions
                .set_trash(&entry.subject_type, &entry.subject_id, entry.revision, true);
            trashed = Some(Captured {
                entry,
                truncated: Vec::new(),
            });
            if let Err(e) = marked {
                rollback_quietly(store);
                self.discard(trashed);
                return Err(e);
            }
        }

        let deleted = store.delete(&concrete, id).and_then(|existed| {
            store.commit()?;
            Ok(existed)
        });
        let existed = match deleted {
            Ok(existed) => existed,
            Err(e) => {
                rollback_quietly(store);
                self.discard(trashed);
                return Err(e.into());
            }
        };

        if !on_destroy && !keep_revisions {
            let purged = self.revisions.delete_subject(&concrete, id)?;
            info!(subject_type = %concrete, subject_id = %id, purged, "destroyed subject and its history");
        } else {
            info!(subject_type = %concrete, subject_id = %id, trashed = on_destroy, "destroyed subject");
        }
        Ok(existed)
    }

    fn age_cutoff(&self, age: Duration) -> DateTime<Utc> {
        self.clock
            .now()
            .checked_sub_signed(age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn capture_and_truncate<S: EntityStore + ?Sized>(
        &mut self,
        store: &S,
        subject_type: &str,
        id: &SubjectId,
    ) -> Result<Option<Captured>, RevisionError> {
        let Some(record) = store.find(subject_type, id)? else {
            return Ok(None);
        };
        let entry = self.capture(store, &record)?;
        let retention = self.effective_config(store, &entry.subject_type).retention;
        match self.truncate(&entry.subject_type, &entry.subject_id, &retention) {
            Ok(truncated) => Ok(Some(Captured { entry, truncated })),
            Err(e) => {
                self.discard(Some(Captured {
                    entry,
                    truncated: Vec::new(),
                }));
                Err(e)
            }
        }
    }

    /// Undo a scoped capture. Failures are logged, never returned, so the
    /// caller's original error survives.
    fn discard(&mut self, captured: Option<Captured>) {
        let Some(Captured { entry, truncated }) = captured else {
            return;
        };
        if let Err(e) = self
            .revisions
            .delete(&entry.subject_type, &entry.subject_id, entry.revision)
        {
            error!(error = %e, revision = entry.revision, "could not discard captured revision");
        }
        // With a zero limit the capture itself may have been truncated.
        for old in truncated.into_iter().filter(|e| e.revision != entry.revision) {
            let revision = old.revision;
            if let Err(e) = self.revisions.insert(old) {
                error!(error = %e, revision, "could not reinstate truncated revision");
            }
        }
    }
}

fn rollback_quietly<S: EntityStore + ?Sized>(store: &mut S) {
    if let Err(e) = store.rollback() {
        error!(error = %e, "rollback failed");
    }
}

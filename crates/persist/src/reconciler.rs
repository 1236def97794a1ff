//! Apply a restored graph onto the live store.
//!
//! The parent is saved before its children because children carry the
//! foreign key. Owned relations are replaced wholesale: live children
//! missing from the restored set are destroyed or nullified per the
//! relation's ownership. Many-to-many membership is replaced in one call.
//!
//! Stale children are only removed once the whole graph is saved. A record
//! the snapshot reached through another relation (or through a cycle back
//! to an ancestor) is listed once, so it is missing from the other
//! relations that lead to it; anything saved anywhere in the graph stays.

use crate::error::RevisionError;
use crate::restorer::{DetachedEntity, DetachedRelation};
use palimpsest_common::{SubjectId, Value};
use palimpsest_store::{EntityStore, Ownership, Record, Related, RelationDef, Schema, StoreError};
use std::collections::HashSet;
use tracing::{debug, error};

/// Persist `entity` and its restored relations in one atomic scope.
/// Returns the saved root record.
pub fn apply<S: EntityStore + ?Sized>(store: &mut S, entity: &DetachedEntity) -> Result<Record, RevisionError> {
    store.begin()?;
    let mut pass = Reconcile {
        store: &mut *store,
        saved: HashSet::new(),
        stale: Vec::new(),
    };
    let result = pass
        .save(entity, None)
        .and_then(|(record, _)| pass.remove_stale().map(|()| record));
    match result {
        Ok(record) => {
            store.commit()?;
            Ok(record)
        }
        Err(e) => {
            if let Err(rollback) = store.rollback() {
                error!(error = %rollback, "rollback after failed reconcile");
            }
            Err(e)
        }
    }
}

fn schema_of<S: EntityStore + ?Sized>(store: &S, type_name: &str) -> Result<Schema, RevisionError> {
    store
        .schema(type_name)
        .cloned()
        .ok_or_else(|| RevisionError::UnknownType(type_name.to_string()))
}

/// A live child that was not part of its relation's restored set.
struct Stale {
    record: Record,
    id: SubjectId,
    relation: String,
    foreign_key: String,
    ownership: Ownership,
}

struct Reconcile<'s, S: ?Sized> {
    store: &'s mut S,
    /// Every (type, id) saved so far, across all relations.
    saved: HashSet<(String, SubjectId)>,
    stale: Vec<Stale>,
}

impl<S: EntityStore + ?Sized> Reconcile<'_, S> {
    /// Upsert one node, then reconcile its relations.
    fn save(
        &mut self,
        entity: &DetachedEntity,
        parent_link: Option<(&str, &Value)>,
    ) -> Result<(Record, SubjectId), RevisionError> {
        let schema = schema_of(&*self.store, entity.type_name())?;
        let mut restored = entity.record().clone();
        if let Some((fk, owner)) = parent_link {
            restored.set(fk, owner.clone());
        }

        let existing = match schema.id_of(&restored) {
            Some(id) => self.store.find(schema.name(), &id)?.map(|live| (live, id)),
            None => None,
        };
        let (record, id) = match existing {
            Some((live, id)) => {
                // Keep live attributes the snapshot does not mention, as long as
                // the restored type still declares them.
                let mut merged = Record::new(schema.name());
                for (name, value) in live.attributes() {
                    if schema.find_attribute(name).is_some() {
                        merged.set(name.clone(), value.clone());
                    }
                }
                merged.merge_from(&restored);
                self.store.update(&merged)?;
                debug!(type_name = schema.name(), %id, "updated");
                (merged, id)
            }
            None => {
                if !schema.allows_client_keys() {
                    for column in schema.key_columns() {
                        restored.remove(column);
                    }
                }
                let id = self.store.insert(restored)?;
                let saved = self
                    .store
                    .find(schema.name(), &id)?
                    .ok_or_else(|| StoreError::NotFound {
                        type_name: schema.name().to_string(),
                        id: id.clone(),
                    })?;
                debug!(type_name = schema.name(), %id, "inserted");
                (saved, id)
            }
        };
        self.saved.insert((record.type_name().to_string(), id.clone()));

        for (name, relation) in entity.relations() {
            let def = schema
                .find_relation(name)
                .ok_or_else(|| StoreError::UnknownRelation {
                    type_name: schema.name().to_string(),
                    relation: name.clone(),
                })?;
            match relation {
                DetachedRelation::Ids(ids) => self.store.replace_ids(&record, name, ids)?,
                DetachedRelation::One(child) => {
                    self.replace_children(&schema, &record, def, child.iter().map(|c| &**c))?
                }
                DetachedRelation::Many(children) => self.replace_children(&schema, &record, def, children.iter())?,
            }
        }
        Ok((record, id))
    }

    /// Save the restored children of one relation and queue the live ones
    /// they do not cover.
    fn replace_children<'e>(
        &mut self,
        schema: &Schema,
        owner: &Record,
        def: &RelationDef,
        children: impl Iterator<Item = &'e DetachedEntity>,
    ) -> Result<(), RevisionError> {
        let unknown = || StoreError::UnknownRelation {
            type_name: schema.name().to_string(),
            relation: def.name.clone(),
        };
        let fk = def.foreign_key.as_deref().ok_or_else(unknown)?;
        let owner_key = schema
            .id_of(owner)
            .and_then(|id| id.as_single().map(|k| k.to_value()))
            .ok_or_else(|| StoreError::CompositeOwner {
                type_name: schema.name().to_string(),
                relation: def.name.clone(),
            })?;

        let current = match self.store.related(owner, &def.name)? {
            Related::One(child) => child.into_iter().collect(),
            Related::Many(children) => children,
            Related::Ids(_) => return Err(unknown().into()),
        };
        for child in children {
            self.save(child, Some((fk, &owner_key)))?;
        }

        for record in current {
            let child_schema = schema_of(&*self.store, record.type_name())?;
            let Some(id) = child_schema.id_of(&record) else {
                continue;
            };
            self.stale.push(Stale {
                record,
                id,
                relation: def.name.clone(),
                foreign_key: fk.to_string(),
                ownership: def.ownership,
            });
        }
        Ok(())
    }

    /// Destroy or nullify queued children that were not saved anywhere in
    /// the graph.
    fn remove_stale(&mut self) -> Result<(), RevisionError> {
        for stale in std::mem::take(&mut self.stale) {
            let type_name = stale.record.type_name();
            if self.saved.contains(&(type_name.to_string(), stale.id.clone())) {
                continue;
            }
            let id = &stale.id;
            match stale.ownership {
                Ownership::Destroy => {
                    // An earlier cascade may have taken it already.
                    if self.store.delete(type_name, id)? {
                        debug!(relation = %stale.relation, %id, "removed stale child");
                    }
                }
                Ownership::Nullify => {
                    let Some(mut live) = self.store.find(type_name, id)? else {
                        continue;
                    };
                    live.set(stale.foreign_key.as_str(), Value::Null);
                    self.store.update(&live)?;
                    debug!(relation = %stale.relation, %id, "detached stale child");
                }
            }
        }
        Ok(())
    }
}

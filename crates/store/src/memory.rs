use crate::record::Record;
use crate::schema::{KeyKind, Ownership, RelationKind, Schema};
use crate::{EntityStore, Related, StoreError, TypeMetadata, TypeResolver};
use palimpsest_common::{Key, SubjectId, Value};
use std::collections::BTreeMap;

/// An event record produced by every mutation of a [`MemoryStore`].
///
/// Events are part of the transactional state: a rollback discards the
/// events of the rolled-back scope along with its rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Inserted { type_name: String, id: SubjectId },
    Updated { type_name: String, id: SubjectId },
    Deleted { type_name: String, id: SubjectId },
    LinksReplaced {
        type_name: String,
        id: SubjectId,
        relation: String,
    },
}

/// Everything a transaction can roll back.
#[derive(Debug, Clone, Default)]
struct Tables {
    /// Rows keyed by (family, id) so members of a polymorphic family share
    /// one identifier space.
    rows: BTreeMap<(String, SubjectId), Record>,
    /// Many-to-many membership keyed by (owner type, relation, owner id).
    links: BTreeMap<(String, String, SubjectId), Vec<SubjectId>>,
    /// Highest serial handed out or seen, per family.
    serials: BTreeMap<String, i64>,
    events: Vec<StoreEvent>,
}

/// In-memory entity store.
///
/// Uses BTreeMap throughout, so related records come back in key order and
/// iteration is deterministic. Transactions are savepoints: `begin` pushes a
/// copy of the tables, `rollback` pops it back.
#[derive(Debug, Default)]
pub struct MemoryStore {
    schemas: BTreeMap<String, Schema>,
    tables: Tables,
    savepoints: Vec<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a schema, builder style.
    pub fn with_schema(mut self, schema: Schema) -> Self {
        self.register(schema);
        self
    }

    /// Register or replace a schema. Replacing a schema simulates a
    /// migration: existing rows are left untouched.
    pub fn register(&mut self, schema: Schema) {
        self.schemas.insert(schema.name().to_string(), schema);
    }

    /// Drop a type from the metadata, as if it had been removed from the code base.
    pub fn unregister(&mut self, type_name: &str) -> Option<Schema> {
        self.schemas.remove(type_name)
    }

    /// Number of stored rows of `type_name` (all members, for a family base).
    pub fn count(&self, type_name: &str) -> usize {
        self.tables
            .rows
            .values()
            .filter(|r| self.is_instance(r, type_name))
            .count()
    }

    /// All stored rows of `type_name`, in key order.
    pub fn all(&self, type_name: &str) -> Vec<Record> {
        self.tables
            .rows
            .values()
            .filter(|r| self.is_instance(r, type_name))
            .cloned()
            .collect()
    }

    /// Drain and return the event log.
    pub fn drain_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut self.tables.events)
    }

    /// Read-only access to the event log.
    pub fn events(&self) -> &[StoreEvent] {
        &self.tables.events
    }

    /// Depth of open transactions.
    pub fn transaction_depth(&self) -> usize {
        self.savepoints.len()
    }

    fn schema_or_err(&self, type_name: &str) -> Result<&Schema, StoreError> {
        self.schemas
            .get(type_name)
            .ok_or_else(|| StoreError::UnknownType(type_name.to_string()))
    }

    /// Whether `record` is a `type_name`: the type itself, or any member of
    /// the family when `type_name` is the family base.
    fn is_instance(&self, record: &Record, type_name: &str) -> bool {
        if record.type_name() == type_name {
            return true;
        }
        match (self.schemas.get(type_name), self.schemas.get(record.type_name())) {
            (Some(base), Some(own)) => {
                base.name() == base.family_name() && own.family_name() == base.name()
            }
            _ => false,
        }
    }

    fn family_of(&self, type_name: &str) -> Result<String, StoreError> {
        Ok(self.schema_or_err(type_name)?.family_name().to_string())
    }

    /// Children of the owner keyed `owner_key` through a foreign-key relation.
    fn children(&self, target: &str, foreign_key: &str, owner_key: &Key) -> Result<Vec<Record>, StoreError> {
        let family = self.family_of(target)?;
        let needle = owner_key.to_value();
        Ok(self
            .tables
            .rows
            .iter()
            .filter(|((fam, _), r)| {
                *fam == family && self.is_instance(r, target) && r.get(foreign_key) == Some(&needle)
            })
            .map(|(_, r)| r.clone())
            .collect())
    }

    fn owner_key(schema: &Schema, owner: &Record, relation: &str) -> Result<Option<Key>, StoreError> {
        match schema.id_of(owner) {
            None => Ok(None),
            Some(id) => id
                .as_single()
                .cloned()
                .map(Some)
                .ok_or_else(|| StoreError::CompositeOwner {
                    type_name: schema.name().to_string(),
                    relation: relation.to_string(),
                }),
        }
    }

    fn validate(schema: &Schema, record: &Record) -> Result<(), StoreError> {
        for (name, value) in record.attributes() {
            schema.check(name, value)?;
        }
        for def in schema.attributes().iter().filter(|d| !d.nullable) {
            if record.get(&def.name).is_none_or(Value::is_null) {
                schema.check(&def.name, &Value::Null)?;
            }
        }
        Ok(())
    }

    fn assign_key(&mut self, schema: &Schema, record: &mut Record) -> Result<SubjectId, StoreError> {
        let missing = || StoreError::MissingKey {
            type_name: schema.name().to_string(),
        };
        let [column] = schema.key_columns() else {
            return Err(missing());
        };
        let key = match schema.key_assignment() {
            KeyKind::Serial => {
                let serial = self
                    .tables
                    .serials
                    .entry(schema.family_name().to_string())
                    .or_insert(0);
                *serial += 1;
                Key::Int(*serial)
            }
            KeyKind::Uuid => Key::Text(uuid::Uuid::new_v4().to_string()),
            KeyKind::Natural => return Err(missing()),
        };
        record.set(column.clone(), key.to_value());
        Ok(SubjectId(vec![key]))
    }
}

impl TypeMetadata for MemoryStore {
    fn schema(&self, type_name: &str) -> Option<&Schema> {
        self.schemas.get(type_name)
    }
}

impl TypeResolver for MemoryStore {
    fn resolve(&self, family: &str, qualified: &str) -> Option<String> {
        self.schemas
            .get(qualified)
            .filter(|s| s.family_name() == family)
            .map(|s| s.name().to_string())
    }
}

impl EntityStore for MemoryStore {
    fn find(&self, type_name: &str, id: &SubjectId) -> Result<Option<Record>, StoreError> {
        let family = self.family_of(type_name)?;
        Ok(self
            .tables
            .rows
            .get(&(family, id.clone()))
            .filter(|r| self.is_instance(r, type_name))
            .cloned())
    }

    fn related(&self, owner: &Record, relation: &str) -> Result<Related, StoreError> {
        let schema = self.schema_or_err(owner.type_name())?;
        let def = schema
            .find_relation(relation)
            .ok_or_else(|| StoreError::UnknownRelation {
                type_name: owner.type_name().to_string(),
                relation: relation.to_string(),
            })?;

        if def.kind == RelationKind::ManyToMany {
            let ids = schema
                .id_of(owner)
                .and_then(|id| {
                    self.tables
                        .links
                        .get(&(owner.type_name().to_string(), relation.to_string(), id))
                        .cloned()
                })
                .unwrap_or_default();
            return Ok(Related::Ids(ids));
        }

        let Some(fk) = def.foreign_key.as_deref() else {
            return Err(StoreError::UnknownRelation {
                type_name: owner.type_name().to_string(),
                relation: relation.to_string(),
            });
        };
        let children = match Self::owner_key(schema, owner, relation)? {
            Some(key) => self.children(&def.target, fk, &key)?,
            None => Vec::new(),
        };
        Ok(match def.kind {
            RelationKind::OneToOne => Related::One(children.into_iter().next()),
            _ => Related::Many(children),
        })
    }

    fn insert(&mut self, mut record: Record) -> Result<SubjectId, StoreError> {
        let schema = self.schema_or_err(record.type_name())?.clone();
        if let Some(column) = schema.discriminator() {
            if record.get(column).is_none_or(Value::is_null) {
                record.set(column, schema.name());
            }
        }
        let id = match schema.id_of(&record) {
            Some(id) => id,
            None => self.assign_key(&schema, &mut record)?,
        };
        Self::validate(&schema, &record)?;

        let slot = (schema.family_name().to_string(), id.clone());
        if self.tables.rows.contains_key(&slot) {
            return Err(StoreError::Duplicate {
                type_name: schema.name().to_string(),
                id,
            });
        }
        if let Some(Key::Int(i)) = id.as_single() {
            let serial = self
                .tables
                .serials
                .entry(schema.family_name().to_string())
                .or_insert(0);
            *serial = (*serial).max(*i);
        }
        self.tables.rows.insert(slot, record);
        self.tables.events.push(StoreEvent::Inserted {
            type_name: schema.name().to_string(),
            id: id.clone(),
        });
        Ok(id)
    }

    fn update(&mut self, record: &Record) -> Result<(), StoreError> {
        let schema = self.schema_or_err(record.type_name())?;
        let id = schema.id_of(record).ok_or_else(|| StoreError::MissingKey {
            type_name: schema.name().to_string(),
        })?;
        let slot = (schema.family_name().to_string(), id.clone());
        if !self.tables.rows.contains_key(&slot) {
            return Err(StoreError::NotFound {
                type_name: schema.name().to_string(),
                id,
            });
        }
        Self::validate(schema, record)?;
        let type_name = schema.name().to_string();
        self.tables.rows.insert(slot, record.clone());
        self.tables.events.push(StoreEvent::Updated { type_name, id });
        Ok(())
    }

    fn delete(&mut self, type_name: &str, id: &SubjectId) -> Result<bool, StoreError> {
        let Some(record) = self.find(type_name, id)? else {
            return Ok(false);
        };
        // Cascade according to the concrete type's own relations.
        let schema = self.schema_or_err(record.type_name())?.clone();

        // The row goes before its children so a foreign-key cycle leads
        // back to a missing row instead of recursing forever.
        self.tables
            .rows
            .remove(&(schema.family_name().to_string(), id.clone()));

        for def in schema.relations() {
            if def.kind == RelationKind::ManyToMany {
                self.tables
                    .links
                    .remove(&(schema.name().to_string(), def.name.clone(), id.clone()));
                continue;
            }
            let (Some(fk), Some(key)) = (def.foreign_key.as_deref(), id.as_single()) else {
                continue;
            };
            let target = self.schema_or_err(&def.target)?.clone();
            for mut child in self.children(&def.target, fk, key)? {
                let Some(child_id) = target.id_of(&child) else {
                    continue;
                };
                tracing::trace!(relation = %def.name, child = %child_id, ownership = ?def.ownership, "cascading delete");
                match def.ownership {
                    Ownership::Destroy => {
                        self.delete(child.type_name(), &child_id)?;
                    }
                    Ownership::Nullify => {
                        child.set(fk, Value::Null);
                        self.update(&child)?;
                    }
                }
            }
        }

        self.tables.events.push(StoreEvent::Deleted {
            type_name: schema.name().to_string(),
            id: id.clone(),
        });
        Ok(true)
    }

    fn replace_ids(&mut self, owner: &Record, relation: &str, ids: &[SubjectId]) -> Result<(), StoreError> {
        let schema = self.schema_or_err(owner.type_name())?;
        let is_link = schema
            .find_relation(relation)
            .is_some_and(|r| r.kind == RelationKind::ManyToMany);
        if !is_link {
            return Err(StoreError::UnknownRelation {
                type_name: owner.type_name().to_string(),
                relation: relation.to_string(),
            });
        }
        let id = schema.id_of(owner).ok_or_else(|| StoreError::MissingKey {
            type_name: schema.name().to_string(),
        })?;
        self.tables.links.insert(
            (owner.type_name().to_string(), relation.to_string(), id.clone()),
            ids.to_vec(),
        );
        self.tables.events.push(StoreEvent::LinksReplaced {
            type_name: owner.type_name().to_string(),
            id,
            relation: relation.to_string(),
        });
        Ok(())
    }

    fn begin(&mut self) -> Result<(), StoreError> {
        self.savepoints.push(self.tables.clone());
        tracing::trace!(depth = self.savepoints.len(), "begin");
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.savepoints.pop().map(|_| ()).ok_or(StoreError::NoTransaction)
    }

    fn rollback(&mut self) -> Result<(), StoreError> {
        self.tables = self.savepoints.pop().ok_or(StoreError::NoTransaction)?;
        tracing::debug!(depth = self.savepoints.len(), "rolled back");
        Ok(())
    }
}

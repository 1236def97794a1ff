//! Entity store capabilities consumed by the revision engine.
//!
//! The revision engine never owns live records. It reads and writes them
//! through the traits below, which a real persistence layer implements.
//! [`MemoryStore`] is the in-memory reference implementation.
//!
//! # Invariants
//! - All record mutations go through explicit store operations.
//! - Transactions nest; a rollback restores the state at the matching begin.

pub mod memory;
pub mod record;
pub mod schema;

pub use memory::{MemoryStore, StoreEvent};
pub use record::Record;
pub use schema::{AttributeDef, AttributeError, KeyKind, Ownership, RelationDef, RelationKind, Schema};

use palimpsest_common::SubjectId;

/// Errors surfaced by an entity store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown type: {0}")]
    UnknownType(String),
    #[error("{type_name} has no relation {relation}")]
    UnknownRelation { type_name: String, relation: String },
    #[error("{type_name} {id} not found")]
    NotFound { type_name: String, id: SubjectId },
    #[error("{type_name} {id} already exists")]
    Duplicate { type_name: String, id: SubjectId },
    #[error("{type_name} requires a caller-assigned key")]
    MissingKey { type_name: String },
    #[error("{type_name} must have a single-column key to own relation {relation}")]
    CompositeOwner { type_name: String, relation: String },
    #[error("invalid attribute: {0}")]
    Attribute(#[from] AttributeError),
    #[error("no open transaction")]
    NoTransaction,
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Records related to an owner through one named relation.
#[derive(Debug, Clone, PartialEq)]
pub enum Related {
    One(Option<Record>),
    Many(Vec<Record>),
    Ids(Vec<SubjectId>),
}

/// Runtime reflection over persisted types.
pub trait TypeMetadata {
    fn schema(&self, type_name: &str) -> Option<&Schema>;
}

/// Resolves a polymorphic discriminator to a concrete type of a family.
pub trait TypeResolver {
    /// `qualified` is the discriminator value already qualified with the
    /// family's namespace. Returns the concrete type name, or `None` when no
    /// member of `family` has that name.
    fn resolve(&self, family: &str, qualified: &str) -> Option<String>;
}

/// Record persistence with nestable atomic scopes.
pub trait EntityStore: TypeMetadata + TypeResolver {
    /// Load a record by identifier. Looking up a family's base type returns
    /// any member of the family stored under that identifier.
    fn find(&self, type_name: &str, id: &SubjectId) -> Result<Option<Record>, StoreError>;

    /// Load the current members of `owner`'s relation, in store order.
    fn related(&self, owner: &Record, relation: &str) -> Result<Related, StoreError>;

    /// Insert a new record, assigning a key if it has none. Returns the key.
    fn insert(&mut self, record: Record) -> Result<SubjectId, StoreError>;

    /// Overwrite an existing record.
    fn update(&mut self, record: &Record) -> Result<(), StoreError>;

    /// Delete a record, applying relation ownership to its children.
    /// Returns whether it existed.
    fn delete(&mut self, type_name: &str, id: &SubjectId) -> Result<bool, StoreError>;

    /// Replace many-to-many membership wholesale.
    fn replace_ids(&mut self, owner: &Record, relation: &str, ids: &[SubjectId]) -> Result<(), StoreError>;

    fn begin(&mut self) -> Result<(), StoreError>;
    fn commit(&mut self) -> Result<(), StoreError>;
    fn rollback(&mut self) -> Result<(), StoreError>;
}

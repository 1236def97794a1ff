//! Shared value model: attribute values, record identifiers, snapshot
//! documents and relation selectors.
//!
//! # Invariants
//! - Documents and selectors iterate in key order (BTreeMap), so encoding a
//!   document is deterministic.
//! - Identifiers are built only from integer and text components.

pub mod document;
pub mod selector;
pub mod value;

pub use document::{Document, Node};
pub use selector::{AssociationSpec, RelationSelector};
pub use value::{Key, ParseIdError, SubjectId, Value, ValueKind};

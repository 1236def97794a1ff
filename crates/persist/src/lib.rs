//! Revisioning: capture point-in-time snapshots of a record graph, keep a
//! bounded history per subject, and restore any revision in memory or onto
//! the live store.
//!
//! # Invariants
//! - Revision numbers are unique and strictly increasing per subject.
//! - Entries are immutable once written; only the trash flag changes.
//! - A payload carries its own format tag and decodes without side channels.
//! - A failed scoped mutation leaves neither store changes nor a revision.

pub mod clock;
pub mod codec;
pub mod config;
pub mod error;
pub mod log;
pub mod reconciler;
pub mod restorer;
pub mod revision;
pub mod serializer;
pub mod store;

mod xml;

#[cfg(test)]
mod fixtures;

pub use clock::{Clock, ManualClock, SystemClock};
pub use codec::Format;
pub use config::{MetaField, Retention, RevisionConfig, Settings, TypeSettings};
pub use error::{CodecError, ConfigError, FieldError, RevisionError};
pub use log::{CaptureScope, Restoration, RevisionLog};
pub use restorer::{DetachedEntity, DetachedRelation};
pub use revision::{MemoryRevisionStore, RevisionEntry, RevisionStore};
pub use store::FileRevisionStore;

use palimpsest_common::{SubjectId, Value};
use palimpsest_store::StoreError;
use std::fmt;

/// Errors from encoding or decoding a revision payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("CBOR serialization error: {0}")]
    CborEncode(String),
    #[error("CBOR deserialization error: {0}")]
    CborDecode(String),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("XML error: {0}")]
    Xml(String),
    #[error("{0} holds a non-finite float, which JSON cannot represent")]
    NonFiniteFloat(String),
    #[error("empty payload")]
    Empty,
    #[error("unknown payload format tag {0:#04x}")]
    UnknownFormat(u8),
}

/// Errors loading revision settings.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("unsupported settings file {0:?} (expected .yaml, .yml or .json)")]
    UnsupportedFile(String),
}

/// A non-fatal problem found while restoring one node of a snapshot.
///
/// Keyed by attribute or relation name. `value` carries the stored value
/// that could not be applied, when there is one.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldError {
    pub field: String,
    pub message: String,
    pub value: Option<Value>,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            value: None,
        }
    }

    pub fn with_value(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.value {
            Some(value) => write!(f, "{}: {} ({})", self.field, self.message, value),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Errors from revision capture, storage, restore and reconciliation.
#[derive(Debug, thiserror::Error)]
pub enum RevisionError {
    #[error("entity store error: {0}")]
    Store(#[from] StoreError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unknown subject type: {0}")]
    UnknownType(String),
    #[error("cannot resolve {discriminator:?} to a concrete type of {family}")]
    UnresolvableType { family: String, discriminator: String },
    #[error("{type_name} record has no identifier")]
    MissingId { type_name: String },
    #[error("revision {revision} of {subject_type} {subject_id} already exists")]
    DuplicateRevision {
        subject_type: String,
        subject_id: SubjectId,
        revision: u64,
    },
    #[error("integrity check failed: expected {expected}, got {actual}")]
    IntegrityMismatch { expected: String, actual: String },
    #[error("schema version mismatch: file has v{file_version}, expected v{expected_version}")]
    SchemaMismatch {
        file_version: u32,
        expected_version: u32,
    },
    #[error("validation failed: {}", join(.0))]
    Invalid(Vec<FieldError>),
    #[error("mutation failed: {0}")]
    Mutation(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl RevisionError {
    /// Wrap an arbitrary failure raised by a caller's mutation.
    pub fn mutation(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Mutation(err.into())
    }

    /// Whether this is a validation rejection rather than a hard fault.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Invalid(_))
    }
}

fn join(errors: &[FieldError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_lists_every_field() {
        let err = RevisionError::Invalid(vec![
            FieldError::new("name", "is blank"),
            FieldError::new("age", "too small").with_value(Value::Int(-1)),
        ]);
        assert_eq!(
            err.to_string(),
            "validation failed: name: is blank; age: too small (-1)"
        );
        assert!(err.is_validation());
    }

    #[test]
    fn mutation_wraps_strings() {
        let err = RevisionError::mutation("disk full");
        assert_eq!(err.to_string(), "mutation failed: disk full");
        assert!(!err.is_validation());
    }
}

//! Per-type revision settings.
//!
//! [`RevisionConfig`] is what the revision log consumes. [`Settings`] is its
//! file form, loaded from YAML or JSON:
//!
//! ```yaml
//! defaults:
//!   limit: 20
//! types:
//!   Post:
//!     associations: [tags, cover, {comments: [ratings]}]
//!     limit: 5
//!     min_age_secs: 604800
//!     encoding: json
//!     on_destroy: true
//!     meta:
//!       label: {value: "nightly"}
//!       author: {field: author_name}
//! ```
//! Computed metadata callbacks have no file form; attach them in code.

use crate::codec::Format;
use crate::error::ConfigError;
use chrono::Duration;
use palimpsest_common::{AssociationSpec, RelationSelector, Value};
use palimpsest_store::Record;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

/// How many revisions to keep, and for how long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Retention {
    /// Keep at least this many of the revisions old enough to be pruned.
    pub limit: Option<usize>,
    /// Never prune revisions younger than this.
    pub min_age: Option<Duration>,
}

impl Retention {
    /// Keep everything.
    pub fn unlimited() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn min_age(mut self, min_age: Duration) -> Self {
        self.min_age = Some(min_age);
        self
    }

    pub fn is_unlimited(&self) -> bool {
        self.limit.is_none() && self.min_age.is_none()
    }
}

/// Source of one metadata value attached to each captured revision.
#[derive(Clone)]
pub enum MetaField {
    Static(Value),
    /// Copy a named attribute of the subject; missing attributes give null.
    Copy(String),
    Computed(Arc<dyn Fn(&Record) -> Value + Send + Sync>),
}

impl MetaField {
    pub fn computed(f: impl Fn(&Record) -> Value + Send + Sync + 'static) -> Self {
        Self::Computed(Arc::new(f))
    }

    pub fn evaluate(&self, record: &Record) -> Value {
        match self {
            Self::Static(value) => value.clone(),
            Self::Copy(field) => record.get(field).cloned().unwrap_or_default(),
            Self::Computed(f) => f(record),
        }
    }
}

impl fmt::Debug for MetaField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Static(value) => f.debug_tuple("Static").field(value).finish(),
            Self::Copy(field) => f.debug_tuple("Copy").field(field).finish(),
            Self::Computed(_) => f.write_str("Computed(..)"),
        }
    }
}

/// Revision behaviour for one subject type.
#[derive(Debug, Clone, Default)]
pub struct RevisionConfig {
    pub selector: RelationSelector,
    pub retention: Retention,
    pub meta: BTreeMap<String, MetaField>,
    pub format: Format,
    /// Capture a trashed revision when the subject is destroyed.
    pub on_destroy: bool,
    /// Keep the history of a destroyed subject even without a trash capture.
    pub keep_revisions: bool,
}

impl RevisionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn associations(mut self, spec: &AssociationSpec) -> Self {
        self.selector = RelationSelector::from_spec(spec);
        self
    }

    pub fn selector(mut self, selector: RelationSelector) -> Self {
        self.selector = selector;
        self
    }

    pub fn retention(mut self, retention: Retention) -> Self {
        self.retention = retention;
        self
    }

    pub fn meta(mut self, name: impl Into<String>, field: MetaField) -> Self {
        self.meta.insert(name.into(), field);
        self
    }

    pub fn format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }

    pub fn on_destroy(mut self, enabled: bool) -> Self {
        self.on_destroy = enabled;
        self
    }

    pub fn keep_revisions(mut self, enabled: bool) -> Self {
        self.keep_revisions = enabled;
        self
    }

    /// Metadata values for a capture of `record`.
    pub fn metadata_for(&self, record: &Record) -> BTreeMap<String, Value> {
        self.meta
            .iter()
            .map(|(name, field)| (name.clone(), field.evaluate(record)))
            .collect()
    }
}

/// Settings file root.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    /// Applied to types without their own entry.
    pub defaults: TypeSettings,
    pub types: BTreeMap<String, TypeSettings>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TypeSettings {
    pub associations: Vec<AssociationSpec>,
    pub limit: Option<usize>,
    pub min_age_secs: Option<i64>,
    pub meta: BTreeMap<String, MetaSpec>,
    pub encoding: Format,
    pub on_destroy: bool,
    pub keep_revisions: bool,
}

/// File form of a [`MetaField`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaSpec {
    Field { field: String },
    Value { value: ScalarSpec },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScalarSpec {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&ScalarSpec> for Value {
    fn from(spec: &ScalarSpec) -> Self {
        match spec {
            ScalarSpec::Bool(b) => Value::Bool(*b),
            ScalarSpec::Int(i) => Value::Int(*i),
            ScalarSpec::Float(x) => Value::Float(*x),
            ScalarSpec::Text(s) => Value::Text(s.clone()),
        }
    }
}

impl TypeSettings {
    pub fn retention(&self) -> Retention {
        Retention {
            limit: self.limit,
            min_age: self.min_age_secs.map(Duration::seconds),
        }
    }

    pub fn to_config(&self) -> RevisionConfig {
        let meta = self
            .meta
            .iter()
            .map(|(name, spec)| {
                let field = match spec {
                    MetaSpec::Field { field } => MetaField::Copy(field.clone()),
                    MetaSpec::Value { value } => MetaField::Static(value.into()),
                };
                (name.clone(), field)
            })
            .collect();
        RevisionConfig {
            selector: RelationSelector::from_spec(&AssociationSpec::List(self.associations.clone())),
            retention: self.retention(),
            meta,
            format: self.encoding,
            on_destroy: self.on_destroy,
            keep_revisions: self.keep_revisions,
        }
    }
}

impl Settings {
    pub fn from_yaml_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(s)?)
    }

    pub fn from_json_str(s: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(s)?)
    }

    /// Load a settings file, choosing the parser by extension.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("yaml" | "yml") => Self::from_yaml_str(&std::fs::read_to_string(path)?),
            Some("json") => Self::from_json_str(&std::fs::read_to_string(path)?),
            _ => Err(ConfigError::UnsupportedFile(path.display().to_string())),
        }
    }

    /// Settings for `type_name`, falling back to the defaults.
    pub fn for_type(&self, type_name: &str) -> &TypeSettings {
        self.types.get(type_name).unwrap_or(&self.defaults)
    }

    pub fn configs(&self) -> BTreeMap<String, RevisionConfig> {
        self.types
            .iter()
            .map(|(name, settings)| (name.clone(), settings.to_config()))
            .collect()
    }
}

use crate::record::Record;
use palimpsest_common::{Key, SubjectId, Value, ValueKind};

/// Cardinality of a declared relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RelationKind {
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneToOne => "one-to-one",
            Self::OneToMany => "one-to-many",
            Self::ManyToMany => "many-to-many",
        }
    }
}

/// What happens to an owned child that is dropped from its parent's relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Ownership {
    /// The child row is deleted.
    #[default]
    Destroy,
    /// The child's foreign key is set to null; the row survives.
    Nullify,
}

/// How a type's identifiers are assigned when a record is inserted without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum KeyKind {
    /// Store-assigned increasing integers.
    #[default]
    Serial,
    /// Store-assigned random UUIDs, stored as text.
    Uuid,
    /// Caller-assigned; inserting without a key is an error.
    Natural,
}

/// A declared persisted attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeDef {
    pub name: String,
    pub kind: ValueKind,
    pub nullable: bool,
}

/// A declared relation from the owning type to `target`.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationDef {
    pub name: String,
    pub kind: RelationKind,
    pub target: String,
    /// Column on the target that references the owner (one-to-one and
    /// one-to-many only).
    pub foreign_key: Option<String>,
    pub ownership: Ownership,
}

/// Errors from setting an attribute the schema does not accept.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AttributeError {
    #[error("{type_name} has no attribute {name}")]
    Unknown { type_name: String, name: String },
    #[error("{name} expects {expected}, got {found}")]
    Mismatch {
        name: String,
        expected: ValueKind,
        found: ValueKind,
    },
    #[error("{name} cannot be null")]
    NotNullable { name: String },
}

/// Reflection metadata for one concrete type.
///
/// Built with the chained setters below; stores register schemas and hand
/// them out through [`crate::TypeMetadata`].
#[derive(Debug, Clone, PartialEq)]
pub struct Schema {
    name: String,
    family: String,
    discriminator: Option<String>,
    key: Vec<String>,
    key_stored: bool,
    key_kind: KeyKind,
    client_keys: bool,
    attributes: Vec<AttributeDef>,
    relations: Vec<RelationDef>,
}

impl Schema {
    /// A schema with a single serial `id` key column.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            family: name.clone(),
            name,
            discriminator: None,
            key: vec!["id".into()],
            key_stored: true,
            key_kind: KeyKind::Serial,
            client_keys: true,
            attributes: vec![AttributeDef {
                name: "id".into(),
                kind: ValueKind::Any,
                nullable: true,
            }],
            relations: Vec::new(),
        }
    }

    /// Declare the key columns. Columns not yet declared as attributes are
    /// added with kind `Any`.
    pub fn key<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let columns: Vec<String> = columns.into_iter().map(Into::into).collect();
        self.attributes
            .retain(|a| a.name != "id" || columns.iter().any(|c| c == "id"));
        for column in &columns {
            if self.find_attribute(column).is_none() {
                self.attributes.push(AttributeDef {
                    name: column.clone(),
                    kind: ValueKind::Any,
                    nullable: true,
                });
            }
        }
        self.key = columns;
        self
    }

    pub fn key_kind(mut self, kind: KeyKind) -> Self {
        self.key_kind = kind;
        self
    }

    /// Whether the key is an ordinary persisted column (and therefore part
    /// of the captured attributes).
    pub fn key_stored(mut self, stored: bool) -> Self {
        self.key_stored = stored;
        self
    }

    /// Whether a restored identifier may be kept when the record is
    /// re-inserted.
    pub fn client_keys(mut self, allowed: bool) -> Self {
        self.client_keys = allowed;
        self
    }

    /// Place this type in a polymorphic family sharing one discriminator column.
    pub fn family(mut self, family: impl Into<String>, discriminator: impl Into<String>) -> Self {
        let discriminator = discriminator.into();
        self.family = family.into();
        if self.find_attribute(&discriminator).is_none() {
            self.attributes.push(AttributeDef {
                name: discriminator.clone(),
                kind: ValueKind::Text,
                nullable: true,
            });
        }
        self.discriminator = Some(discriminator);
        self
    }

    pub fn attribute(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.push_attribute(name.into(), kind, true);
        self
    }

    pub fn required(mut self, name: impl Into<String>, kind: ValueKind) -> Self {
        self.push_attribute(name.into(), kind, false);
        self
    }

    fn push_attribute(&mut self, name: String, kind: ValueKind, nullable: bool) {
        self.attributes.retain(|a| a.name != name);
        self.attributes.push(AttributeDef { name, kind, nullable });
    }

    pub fn has_one(self, name: impl Into<String>, target: impl Into<String>, fk: impl Into<String>) -> Self {
        self.relation(name, RelationKind::OneToOne, target, Some(fk.into()), Ownership::Destroy)
    }

    pub fn has_many(self, name: impl Into<String>, target: impl Into<String>, fk: impl Into<String>) -> Self {
        self.relation(name, RelationKind::OneToMany, target, Some(fk.into()), Ownership::Destroy)
    }

    pub fn many_to_many(self, name: impl Into<String>, target: impl Into<String>) -> Self {
        self.relation(name, RelationKind::ManyToMany, target, None, Ownership::Destroy)
    }

    pub fn relation(
        mut self,
        name: impl Into<String>,
        kind: RelationKind,
        target: impl Into<String>,
        foreign_key: Option<String>,
        ownership: Ownership,
    ) -> Self {
        let name = name.into();
        self.relations.retain(|r| r.name != name);
        self.relations.push(RelationDef {
            name,
            kind,
            target: target.into(),
            foreign_key,
            ownership,
        });
        self
    }

    /// Change how dropped children of an existing relation are handled.
    pub fn ownership(mut self, relation: &str, ownership: Ownership) -> Self {
        if let Some(r) = self.relations.iter_mut().find(|r| r.name == relation) {
            r.ownership = ownership;
        }
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn family_name(&self) -> &str {
        &self.family
    }

    pub fn discriminator(&self) -> Option<&str> {
        self.discriminator.as_deref()
    }

    pub fn key_columns(&self) -> &[String] {
        &self.key
    }

    pub fn is_key_stored(&self) -> bool {
        self.key_stored
    }

    pub fn key_assignment(&self) -> KeyKind {
        self.key_kind
    }

    pub fn allows_client_keys(&self) -> bool {
        self.client_keys
    }

    pub fn is_composite(&self) -> bool {
        self.key.len() > 1
    }

    pub fn is_key_column(&self, name: &str) -> bool {
        self.key.iter().any(|k| k == name)
    }

    pub fn attributes(&self) -> &[AttributeDef] {
        &self.attributes
    }

    pub fn relations(&self) -> &[RelationDef] {
        &self.relations
    }

    pub fn find_attribute(&self, name: &str) -> Option<&AttributeDef> {
        self.attributes.iter().find(|a| a.name == name)
    }

    pub fn find_relation(&self, name: &str) -> Option<&RelationDef> {
        self.relations.iter().find(|r| r.name == name)
    }

    /// Check whether `value` may be assigned to attribute `name`.
    pub fn check(&self, name: &str, value: &Value) -> Result<(), AttributeError> {
        let def = self
            .find_attribute(name)
            .ok_or_else(|| AttributeError::Unknown {
                type_name: self.name.clone(),
                name: name.to_string(),
            })?;
        match value.kind() {
            None if def.nullable => Ok(()),
            None => Err(AttributeError::NotNullable {
                name: name.to_string(),
            }),
            Some(found) if def.kind.admits(found) => Ok(()),
            Some(found) => Err(AttributeError::Mismatch {
                name: name.to_string(),
                expected: def.kind,
                found,
            }),
        }
    }

    /// Identifier of `record`, or `None` while any key component is unset.
    pub fn id_of(&self, record: &Record) -> Option<SubjectId> {
        self.key
            .iter()
            .map(|column| record.get(column).and_then(Key::from_value))
            .collect::<Option<Vec<_>>>()
            .map(SubjectId)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn post() -> Schema {
        Schema::new("Post")
            .required("title", ValueKind::Text)
            .attribute("views", ValueKind::Int)
            .has_many("comments", "Comment", "post_id")
    }

    #[test]
    fn check_accepts_and_rejects() {
        let schema = post();
        assert!(schema.check("title", &Value::from("x")).is_ok());
        assert!(schema.check("views", &Value::Null).is_ok());
        assert!(matches!(
            schema.check("title", &Value::Null),
            Err(AttributeError::NotNullable { .. })
        ));
        assert!(matches!(
            schema.check("views", &Value::from("many")),
            Err(AttributeError::Mismatch { .. })
        ));
        assert!(matches!(
            schema.check("subtitle", &Value::from("x")),
            Err(AttributeError::Unknown { .. })
        ));
    }

    #[test]
    fn id_of_requires_every_component() {
        let schema = Schema::new("Pair").key(["left", "right"]).key_kind(KeyKind::Natural);
        assert!(schema.is_composite());
        assert!(schema.find_attribute("id").is_none());

        let mut record = Record::new("Pair");
        record.set("left", 1i64);
        assert_eq!(schema.id_of(&record), None);
        record.set("right", "b");
        assert_eq!(
            schema.id_of(&record),
            Some(SubjectId(vec![Key::Int(1), Key::Text("b".into())]))
        );
    }

    #[test]
    fn key_and_family_keep_declared_attributes() {
        let schema = Schema::new("Pair")
            .required("left", ValueKind::Int)
            .attribute("kind", ValueKind::Text)
            .key(["left", "right"])
            .family("Pair", "kind");
        let names: Vec<&str> = schema.attributes().iter().map(|a| a.name.as_str()).collect();
        assert_eq!(names, vec!["left", "kind", "right"]);
        // The declared definition wins over the generated one.
        assert!(matches!(
            schema.check("left", &Value::Null),
            Err(AttributeError::NotNullable { .. })
        ));
    }

    #[test]
    fn family_adds_discriminator_attribute() {
        let schema = Schema::new("Blog::Video").family("Blog::Post", "kind");
        assert_eq!(schema.family_name(), "Blog::Post");
        assert_eq!(schema.discriminator(), Some("kind"));
        assert!(schema.check("kind", &Value::from("Video")).is_ok());
    }
}

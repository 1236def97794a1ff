//! Snapshot document -> detached entity graph.
//!
//! Restoring never touches the live store. Anything in the document the
//! current schema no longer accepts becomes a [`FieldError`] on the node it
//! belongs to; only an unknown type or an unresolvable discriminator at the
//! root is fatal.

use crate::error::{FieldError, RevisionError};
use palimpsest_common::{Document, Node, RelationSelector, SubjectId, Value};
use palimpsest_store::{Record, RelationDef, RelationKind, Schema, TypeMetadata, TypeResolver};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A restored record with its restored relations, not yet persisted.
///
/// Whether it becomes an insert or an update is decided when it is applied,
/// by looking its identifier up in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct DetachedEntity {
    record: Record,
    relations: BTreeMap<String, DetachedRelation>,
    errors: Vec<FieldError>,
}

/// Restored membership of one relation.
#[derive(Debug, Clone, PartialEq)]
pub enum DetachedRelation {
    One(Option<Box<DetachedEntity>>),
    Many(Vec<DetachedEntity>),
    Ids(Vec<SubjectId>),
}

impl DetachedEntity {
    pub fn record(&self) -> &Record {
        &self.record
    }

    pub fn record_mut(&mut self) -> &mut Record {
        &mut self.record
    }

    pub fn into_record(self) -> Record {
        self.record
    }

    pub fn type_name(&self) -> &str {
        self.record.type_name()
    }

    pub fn relations(&self) -> &BTreeMap<String, DetachedRelation> {
        &self.relations
    }

    pub fn relation(&self, name: &str) -> Option<&DetachedRelation> {
        self.relations.get(name)
    }

    /// The restored one-to-one member of `name`, if any.
    pub fn one(&self, name: &str) -> Option<&DetachedEntity> {
        match self.relations.get(name) {
            Some(DetachedRelation::One(Some(child))) => Some(child),
            _ => None,
        }
    }

    /// The restored one-to-many members of `name`; empty when not restored.
    pub fn many(&self, name: &str) -> &[DetachedEntity] {
        match self.relations.get(name) {
            Some(DetachedRelation::Many(children)) => children,
            _ => &[],
        }
    }

    pub fn ids(&self, name: &str) -> Option<&[SubjectId]> {
        match self.relations.get(name) {
            Some(DetachedRelation::Ids(ids)) => Some(ids),
            _ => None,
        }
    }

    /// Errors recorded on this node. Failures inside related records are
    /// also listed here under the relation's name.
    pub fn errors(&self) -> &[FieldError] {
        &self.errors
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

/// Rebuild the entity graph stored in `doc`.
///
/// `declared_type` is the type the revision was recorded under. A
/// discriminator in the document that names a different member of the
/// type's family selects that member instead.
pub fn restore<M>(
    meta: &M,
    doc: &Document,
    declared_type: &str,
    selector: &RelationSelector,
) -> Result<DetachedEntity, RevisionError>
where
    M: TypeMetadata + TypeResolver + ?Sized,
{
    let declared = meta
        .schema(declared_type)
        .ok_or_else(|| RevisionError::UnknownType(declared_type.to_string()))?;
    let concrete = resolve_type(meta, declared, doc)?;
    let schema = meta
        .schema(&concrete)
        .ok_or_else(|| RevisionError::UnknownType(concrete.clone()))?;

    let mut entity = DetachedEntity {
        record: Record::new(schema.name()),
        relations: BTreeMap::new(),
        errors: Vec::new(),
    };

    for (name, node) in doc.iter() {
        match (schema.find_relation(name), node) {
            (None, Node::Value(value)) => match schema.check(name, value) {
                Ok(()) => {
                    entity.record.set(name.clone(), value.clone());
                }
                Err(e) => {
                    warn!(type_name = schema.name(), field = %name, error = %e, "attribute not restored");
                    entity.errors.push(
                        FieldError::new(name.clone(), format!("could not be restored: {e}"))
                            .with_value(value.clone()),
                    );
                }
            },
            (None, _) => {
                warn!(type_name = schema.name(), relation = %name, "relation no longer exists");
                entity.errors.push(FieldError::new(
                    name.clone(),
                    format!("{} has no relation {name}", schema.name()),
                ));
            }
            (Some(def), node) => match selector.get(name) {
                Some(nested) => restore_relation(meta, &mut entity, def, node, nested),
                None => debug!(type_name = schema.name(), relation = %name, "relation not selected"),
            },
        }
    }
    Ok(entity)
}

fn restore_relation<M>(
    meta: &M,
    entity: &mut DetachedEntity,
    def: &RelationDef,
    node: &Node,
    nested: &RelationSelector,
) where
    M: TypeMetadata + TypeResolver + ?Sized,
{
    let restored = match (def.kind, node) {
        (RelationKind::OneToOne, Node::Value(Value::Null)) => DetachedRelation::One(None),
        (RelationKind::OneToOne, Node::Record(doc)) => match restore_child(meta, entity, def, doc, nested) {
            Some(child) => DetachedRelation::One(Some(Box::new(child))),
            None => return,
        },
        (RelationKind::OneToMany, Node::Records(docs)) => DetachedRelation::Many(
            docs.iter()
                .filter_map(|doc| restore_child(meta, entity, def, doc, nested))
                .collect(),
        ),
        (RelationKind::ManyToMany, Node::Ids(ids)) => DetachedRelation::Ids(ids.clone()),
        (kind, node) => {
            entity.errors.push(FieldError::new(
                def.name.clone(),
                format!("expected a {} relation, found {}", kind.as_str(), node.shape()),
            ));
            return;
        }
    };
    entity.relations.insert(def.name.clone(), restored);
}

/// Restore one related document, copying its errors onto the parent under
/// the relation name. A fatal failure skips the child.
fn restore_child<M>(
    meta: &M,
    parent: &mut DetachedEntity,
    def: &RelationDef,
    doc: &Document,
    nested: &RelationSelector,
) -> Option<DetachedEntity>
where
    M: TypeMetadata + TypeResolver + ?Sized,
{
    match restore(meta, doc, &def.target, nested) {
        Ok(child) => {
            for e in child.errors() {
                parent.errors.push(FieldError::new(
                    def.name.clone(),
                    format!("could not be restored from the revision: {e}"),
                ));
            }
            Some(child)
        }
        Err(e) => {
            warn!(relation = %def.name, error = %e, "related record not restored");
            parent.errors.push(FieldError::new(
                def.name.clone(),
                format!("could not be restored from the revision: {e}"),
            ));
            None
        }
    }
}

fn resolve_type<M>(meta: &M, declared: &Schema, doc: &Document) -> Result<String, RevisionError>
where
    M: TypeResolver + ?Sized,
{
    let stored = declared
        .discriminator()
        .and_then(|column| doc.value(column))
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty());
    let Some(stored) = stored else {
        return Ok(declared.name().to_string());
    };
    let qualified = qualify(declared.family_name(), stored);
    if qualified == declared.name() {
        return Ok(qualified);
    }
    meta.resolve(declared.family_name(), &qualified)
        .ok_or_else(|| RevisionError::UnresolvableType {
            family: declared.family_name().to_string(),
            discriminator: stored.to_string(),
        })
}

/// Qualify a discriminator value with the family's namespace. A leading
/// `::` marks an absolute name; a name that already has a path is kept.
fn qualify(family: &str, name: &str) -> String {
    if let Some(absolute) = name.strip_prefix("::") {
        return absolute.to_string();
    }
    if name.contains("::") {
        return name.to_string();
    }
    match family.rsplit_once("::") {
        Some((namespace, _)) => format!("{namespace}::{name}"),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use crate::serializer::serialize;
    use palimpsest_common::ValueKind;
    use palimpsest_store::MemoryStore;

    #[test]
    fn restores_attributes_and_relations() {
        let (store, post) = fixtures::blog_with_post();
        let selector = fixtures::full_selector();
        let doc = serialize(&store, &post, &selector).unwrap();
        let entity = restore(&store, &doc, "Post", &selector).unwrap();

        assert!(!entity.has_errors());
        assert_eq!(entity.record(), &post);
        let comments = entity.many("comments");
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[1].record().get("body"), Some(&Value::from("second")));
        assert_eq!(comments[0].many("ratings").len(), 1);
        assert_eq!(
            entity.one("cover").and_then(|c| c.record().get("url")),
            Some(&Value::from("cover.png"))
        );
        assert_eq!(
            entity.ids("tags"),
            Some(&[SubjectId::from(2), SubjectId::from(1)][..])
        );
    }

    #[test]
    fn schema_drift_is_recorded_not_fatal() {
        let (mut store, post) = fixtures::blog_with_post();
        let selector = fixtures::full_selector();
        let doc = serialize(&store, &post, &selector).unwrap();

        // `views` is gone, `title` became an integer, `tags` is no longer a
        // relation, and comment bodies were removed.
        store.register(
            Schema::new("Post")
                .attribute("title", ValueKind::Int)
                .has_many("comments", "Comment", "post_id")
                .has_one("cover", "Image", "post_id"),
        );
        store.register(
            Schema::new("Comment")
                .attribute("post_id", ValueKind::Int)
                .has_many("ratings", "Rating", "comment_id"),
        );
        let doc = doc.with("views", 3i64);
        let entity = restore(&store, &doc, "Post", &selector).unwrap();

        let fields: Vec<&str> = entity.errors().iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"title"));
        assert!(fields.contains(&"views"));
        assert!(fields.contains(&"tags"));
        assert_eq!(fields.iter().filter(|f| **f == "comments").count(), 2);
        let title = entity.errors().iter().find(|e| e.field == "title").unwrap();
        assert_eq!(title.value, Some(Value::from("Hello")));

        assert_eq!(entity.record().get("id"), Some(&Value::Int(1)));
        assert!(entity.record().get("title").is_none());
        let comments = entity.many("comments");
        assert_eq!(comments.len(), 2);
        assert_eq!(comments[0].errors()[0].field, "body");
    }

    #[test]
    fn relation_shape_mismatch_is_recorded() {
        let store = fixtures::blog();
        let doc = Document::new()
            .with("title", "x")
            .with_node("comments", Node::Ids(vec![SubjectId::from(1)]));
        let entity = restore(&store, &doc, "Post", &RelationSelector::none().leaf("comments")).unwrap();
        assert_eq!(entity.errors().len(), 1);
        assert!(entity.errors()[0].message.contains("one-to-many"));
        assert!(entity.relation("comments").is_none());
    }

    #[test]
    fn unselected_relations_are_not_restored() {
        let (store, post) = fixtures::blog_with_post();
        let doc = serialize(&store, &post, &fixtures::full_selector()).unwrap();
        let entity = restore(&store, &doc, "Post", &RelationSelector::none().leaf("tags")).unwrap();
        assert!(entity.relation("comments").is_none());
        assert!(entity.relation("tags").is_some());
        assert!(!entity.has_errors());
    }

    fn media() -> MemoryStore {
        MemoryStore::new()
            .with_schema(Schema::new("Media::Item").family("Media::Item", "kind").attribute("title", ValueKind::Text))
            .with_schema(
                Schema::new("Media::Video")
                    .family("Media::Item", "kind")
                    .attribute("title", ValueKind::Text)
                    .attribute("seconds", ValueKind::Int),
            )
    }

    #[test]
    fn discriminator_selects_concrete_type() {
        let store = media();
        for stored in ["Video", "Media::Video", "::Media::Video"] {
            let doc = Document::new().with("kind", stored).with("seconds", 30i64);
            let entity = restore(&store, &doc, "Media::Item", &RelationSelector::none()).unwrap();
            assert_eq!(entity.type_name(), "Media::Video", "stored {stored}");
            assert!(!entity.has_errors());
        }
    }

    #[test]
    fn unresolvable_discriminator_is_fatal_at_root() {
        let store = media();
        let doc = Document::new().with("kind", "Podcast");
        let err = restore(&store, &doc, "Media::Item", &RelationSelector::none()).unwrap_err();
        assert!(matches!(
            err,
            RevisionError::UnresolvableType { ref discriminator, .. } if discriminator == "Podcast"
        ));
    }

    #[test]
    fn unresolvable_nested_discriminator_is_a_parent_error() {
        let mut store = media().with_schema(
            Schema::new("Playlist").has_many("items", "Media::Item", "playlist_id"),
        );
        store.register(
            Schema::new("Media::Item")
                .family("Media::Item", "kind")
                .attribute("title", ValueKind::Text)
                .attribute("playlist_id", ValueKind::Int),
        );
        let doc = Document::new().with_node(
            "items",
            Node::Records(vec![
                Document::new().with("title", "ok"),
                Document::new().with("kind", "Podcast"),
            ]),
        );
        let entity = restore(&store, &doc, "Playlist", &RelationSelector::none().leaf("items")).unwrap();
        assert_eq!(entity.many("items").len(), 1);
        assert_eq!(entity.errors().len(), 1);
        assert_eq!(entity.errors()[0].field, "items");
    }

    #[test]
    fn qualify_follows_family_namespace() {
        assert_eq!(qualify("Blog::Post", "Video"), "Blog::Video");
        assert_eq!(qualify("Post", "Video"), "Video");
        assert_eq!(qualify("Blog::Post", "Other::Video"), "Other::Video");
        assert_eq!(qualify("Blog::Post", "::Video"), "Video");
    }
}

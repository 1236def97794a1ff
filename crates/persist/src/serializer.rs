//! Live record graph -> snapshot document.

use crate::error::RevisionError;
use palimpsest_common::{Document, Node, RelationSelector, SubjectId, Value};
use palimpsest_store::{EntityStore, Record, Related};
use std::collections::HashSet;
use tracing::debug;

/// Snapshot `record` and the relations named by `selector`.
///
/// Store errors abort the whole snapshot. A record reached a second time
/// through a relation cycle is left out of the document.
pub fn serialize<S: EntityStore + ?Sized>(
    store: &S,
    record: &Record,
    selector: &RelationSelector,
) -> Result<Document, RevisionError> {
    let mut walker = Walker {
        store,
        visited: HashSet::new(),
    };
    Ok(walker.visit(record, selector)?.unwrap_or_default())
}

struct Walker<'s, S: ?Sized> {
    store: &'s S,
    visited: HashSet<(String, SubjectId)>,
}

impl<S: EntityStore + ?Sized> Walker<'_, S> {
    fn visit(&mut self, record: &Record, selector: &RelationSelector) -> Result<Option<Document>, RevisionError> {
        let schema = self
            .store
            .schema(record.type_name())
            .ok_or_else(|| RevisionError::UnknownType(record.type_name().to_string()))?;

        if let Some(id) = schema.id_of(record) {
            if !self.visited.insert((record.type_name().to_string(), id.clone())) {
                debug!(type_name = record.type_name(), %id, "already serialized, skipping");
                return Ok(None);
            }
        }

        let hide_key = !schema.is_key_stored() && !schema.is_composite();
        let mut doc: Document = record
            .attributes()
            .iter()
            .filter(|(name, _)| !(hide_key && schema.is_key_column(name)))
            .map(|(name, value)| (name.clone(), Node::Value(value.clone())))
            .collect();

        for (name, nested) in selector.iter() {
            if schema.find_relation(name).is_none() {
                debug!(type_name = record.type_name(), relation = %name, "not a relation, skipping");
                continue;
            }
            match self.store.related(record, name)? {
                Related::One(None) => {
                    doc.insert(name.clone(), Node::Value(Value::Null));
                }
                Related::One(Some(child)) => {
                    if let Some(child_doc) = self.visit(&child, nested)? {
                        doc.insert(name.clone(), Node::Record(child_doc));
                    }
                }
                Related::Many(children) => {
                    let mut docs = Vec::with_capacity(children.len());
                    for child in &children {
                        if let Some(child_doc) = self.visit(child, nested)? {
                            docs.push(child_doc);
                        }
                    }
                    doc.insert(name.clone(), Node::Records(docs));
                }
                Related::Ids(ids) => {
                    doc.insert(name.clone(), Node::Ids(ids));
                }
            }
        }
        Ok(Some(doc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use palimpsest_common::ValueKind;
    use palimpsest_store::{MemoryStore, Schema};

    #[test]
    fn copies_attributes_and_selected_relations() {
        let (store, post) = fixtures::blog_with_post();
        let selector = fixtures::full_selector();
        let doc = serialize(&store, &post, &selector).unwrap();

        assert_eq!(doc.value("title"), Some(&Value::from("Hello")));
        assert_eq!(doc.value("id"), Some(&Value::Int(1)));
        let Some(Node::Records(comments)) = doc.get("comments") else {
            panic!("expected comments");
        };
        let bodies: Vec<_> = comments.iter().map(|c| c.value("body").cloned()).collect();
        assert_eq!(bodies, vec![Some(Value::from("first")), Some(Value::from("second"))]);
        let Some(Node::Records(ratings)) = comments[0].get("ratings") else {
            panic!("expected nested ratings");
        };
        assert_eq!(ratings.len(), 1);
        assert!(matches!(doc.get("cover"), Some(Node::Record(_))));
        assert_eq!(
            doc.get("tags"),
            Some(&Node::Ids(vec![SubjectId::from(2), SubjectId::from(1)]))
        );
    }

    #[test]
    fn unselected_relations_are_left_out() {
        let (store, post) = fixtures::blog_with_post();
        let doc = serialize(&store, &post, &RelationSelector::none().leaf("comments")).unwrap();
        assert!(doc.contains_key("comments"));
        assert!(!doc.contains_key("tags"));
        assert!(!doc.contains_key("cover"));
        let Some(Node::Records(comments)) = doc.get("comments") else {
            panic!("expected comments");
        };
        assert!(!comments[0].contains_key("ratings"));
    }

    #[test]
    fn missing_one_to_one_is_null() {
        let (mut store, post) = fixtures::blog_with_post();
        store.delete("Image", &SubjectId::from(1)).unwrap();
        let doc = serialize(&store, &post, &RelationSelector::none().leaf("cover")).unwrap();
        assert_eq!(doc.get("cover"), Some(&Node::Value(Value::Null)));
    }

    #[test]
    fn unstored_key_is_excluded() {
        let mut store = MemoryStore::new().with_schema(
            Schema::new("Setting")
                .attribute("value", ValueKind::Text)
                .key_stored(false),
        );
        let id = store.insert(Record::new("Setting").with("value", "on")).unwrap();
        let record = store.find("Setting", &id).unwrap().unwrap();
        let doc = serialize(&store, &record, &RelationSelector::none()).unwrap();
        assert!(!doc.contains_key("id"));
        assert_eq!(doc.value("value"), Some(&Value::from("on")));
    }

    #[test]
    fn composite_keys_are_always_included() {
        let mut store = MemoryStore::new().with_schema(
            Schema::new("Membership")
                .key(["group", "user"])
                .key_kind(palimpsest_store::KeyKind::Natural)
                .key_stored(false)
                .attribute("role", ValueKind::Text),
        );
        let id = store
            .insert(Record::new("Membership").with("group", 1i64).with("user", "ann").with("role", "admin"))
            .unwrap();
        let record = store.find("Membership", &id).unwrap().unwrap();
        let doc = serialize(&store, &record, &RelationSelector::none()).unwrap();
        assert_eq!(doc.value("group"), Some(&Value::Int(1)));
        assert_eq!(doc.value("user"), Some(&Value::from("ann")));
    }

    #[test]
    fn cycles_terminate_with_repeat_omitted() {
        let mut store = MemoryStore::new().with_schema(
            Schema::new("Node")
                .attribute("label", ValueKind::Text)
                .attribute("parent_id", ValueKind::Int)
                .has_one("child", "Node", "parent_id"),
        );
        store
            .insert(Record::new("Node").with("id", 1i64).with("label", "a").with("parent_id", 2i64))
            .unwrap();
        store
            .insert(Record::new("Node").with("id", 2i64).with("label", "b").with("parent_id", 1i64))
            .unwrap();
        let a = store.find("Node", &SubjectId::from(1)).unwrap().unwrap();

        let mut selector = RelationSelector::none();
        for _ in 0..4 {
            selector = RelationSelector::none().nested("child", selector);
        }
        let doc = serialize(&store, &a, &selector).unwrap();
        let Some(Node::Record(b)) = doc.get("child") else {
            panic!("expected b under a");
        };
        assert_eq!(b.value("label"), Some(&Value::from("b")));
        assert!(!b.contains_key("child"));
    }

    #[test]
    fn unknown_type_is_fatal() {
        let store = MemoryStore::new();
        let err = serialize(&store, &Record::new("Ghost"), &RelationSelector::none()).unwrap_err();
        assert!(matches!(err, RevisionError::UnknownType(_)));
    }
}

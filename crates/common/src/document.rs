use crate::value::{SubjectId, Value};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The decoded form of a revision payload: attribute name to [`Node`].
///
/// Uses BTreeMap so every encoding of the same document is byte-identical.
/// Documents are built once by the serializer and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Document {
    fields: BTreeMap<String, Node>,
}

/// One entry of a [`Document`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Node {
    /// A plain attribute, or `Null` for an empty one-to-one relation.
    Value(Value),
    /// A one-to-one related record.
    Record(Document),
    /// One-to-many related records, in the order they were captured.
    Records(Vec<Document>),
    /// Many-to-many membership as raw identifiers.
    Ids(Vec<SubjectId>),
}

impl Node {
    /// Whether this node has the shape of a relation rather than an attribute.
    pub fn is_relation(&self) -> bool {
        !matches!(self, Self::Value(_))
    }

    pub fn shape(&self) -> &'static str {
        match self {
            Self::Value(Value::Null) => "null",
            Self::Value(_) => "value",
            Self::Record(_) => "record",
            Self::Records(_) => "records",
            Self::Ids(_) => "ids",
        }
    }
}

impl Document {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, node: Node) -> Option<Node> {
        self.fields.insert(name.into(), node)
    }

    /// Builder-style insert of a plain attribute.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), Node::Value(value.into()));
        self
    }

    /// Builder-style insert of any node.
    pub fn with_node(mut self, name: impl Into<String>, node: Node) -> Self {
        self.fields.insert(name.into(), node);
        self
    }

    pub fn get(&self, name: &str) -> Option<&Node> {
        self.fields.get(name)
    }

    /// The attribute value stored under `name`, if it is a plain value.
    pub fn value(&self, name: &str) -> Option<&Value> {
        match self.fields.get(name) {
            Some(Node::Value(v)) => Some(v),
            _ => None,
        }
    }

    pub fn contains_key(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Node)> {
        self.fields.iter()
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl FromIterator<(String, Node)> for Document {
    fn from_iter<I: IntoIterator<Item = (String, Node)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_and_lookup() {
        let doc = Document::new()
            .with("title", "hello")
            .with("views", 3i64)
            .with_node("tags", Node::Ids(vec![SubjectId::from(1)]));

        assert_eq!(doc.len(), 3);
        assert_eq!(doc.value("title"), Some(&Value::Text("hello".into())));
        assert_eq!(doc.value("tags"), None);
        assert!(doc.get("tags").unwrap().is_relation());
        assert!(!doc.get("views").unwrap().is_relation());
    }

    #[test]
    fn iteration_is_key_ordered() {
        let doc = Document::new().with("b", 1i64).with("a", 2i64).with("c", 3i64);
        let keys: Vec<&String> = doc.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, ["a", "b", "c"]);
    }

    #[test]
    fn json_round_trip_preserves_nesting() {
        let child = Document::new().with("body", "first");
        let doc = Document::new()
            .with("title", "post")
            .with_node("comments", Node::Records(vec![child.clone(), child]))
            .with_node("author", Node::Value(Value::Null));
        let json = serde_json::to_string(&doc).unwrap();
        let back: Document = serde_json::from_str(&json).unwrap();
        assert_eq!(back, doc);
    }
}

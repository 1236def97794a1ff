use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Which relations of a subject are included in its snapshots.
///
/// A tree keyed by relation name. An empty nested selector is a leaf: the
/// related records contribute their own attributes and no further relations.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationSelector {
    relations: BTreeMap<String, RelationSelector>,
}

/// Declarative association list, as written in configuration:
///
/// ```yaml
/// associations: [tags, one_thing, {comments: [ratings]}]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum AssociationSpec {
    Name(String),
    List(Vec<AssociationSpec>),
    Nested(BTreeMap<String, AssociationSpec>),
}

impl RelationSelector {
    /// A selector that includes no relations.
    pub fn none() -> Self {
        Self::default()
    }

    /// Include `name` as a leaf.
    pub fn leaf(mut self, name: impl Into<String>) -> Self {
        self.relations.insert(name.into(), Self::default());
        self
    }

    /// Include `name` and recurse into `nested` for its records.
    pub fn nested(mut self, name: impl Into<String>, nested: RelationSelector) -> Self {
        self.relations.insert(name.into(), nested);
        self
    }

    /// Build the selector tree from its declarative form.
    pub fn from_spec(spec: &AssociationSpec) -> Self {
        let mut selector = Self::default();
        selector.merge_spec(spec);
        selector
    }

    fn merge_spec(&mut self, spec: &AssociationSpec) {
        match spec {
            AssociationSpec::Name(name) => {
                self.relations.entry(name.clone()).or_default();
            }
            AssociationSpec::List(items) => {
                for item in items {
                    self.merge_spec(item);
                }
            }
            AssociationSpec::Nested(map) => {
                for (name, nested) in map {
                    self.relations
                        .entry(name.clone())
                        .or_default()
                        .merge_spec(nested);
                }
            }
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.relations.contains_key(name)
    }

    /// The nested selector for `name`, if the relation is selected.
    pub fn get(&self, name: &str) -> Option<&RelationSelector> {
        self.relations.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &RelationSelector)> {
        self.relations.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.relations.is_empty()
    }
}

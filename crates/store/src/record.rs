use palimpsest_common::Value;
use std::collections::BTreeMap;

/// A dynamically typed record: a type name plus attribute values by name.
///
/// Records carry no persisted-identity marker. Whether a record is new or
/// existing is decided by looking its identifier up in the store.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    type_name: String,
    attributes: BTreeMap<String, Value>,
}

impl Record {
    pub fn new(type_name: impl Into<String>) -> Self {
        Self {
            type_name: type_name.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Builder-style attribute assignment.
    pub fn with(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name)
    }

    /// Set an attribute without schema validation. Callers that need the
    /// schema's verdict use [`crate::Schema::check`] first.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<Value>) -> Option<Value> {
        self.attributes.insert(name.into(), value.into())
    }

    pub fn remove(&mut self, name: &str) -> Option<Value> {
        self.attributes.remove(name)
    }

    pub fn attributes(&self) -> &BTreeMap<String, Value> {
        &self.attributes
    }

    /// Overlay every attribute of `other` onto this record, keeping
    /// attributes `other` does not mention.
    pub fn merge_from(&mut self, other: &Record) {
        for (name, value) in &other.attributes {
            self.attributes.insert(name.clone(), value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_set_remove() {
        let mut record = Record::new("Post").with("title", "a");
        assert_eq!(record.get("title"), Some(&Value::from("a")));
        assert_eq!(record.set("title", "b"), Some(Value::from("a")));
        assert_eq!(record.remove("title"), Some(Value::from("b")));
        assert!(record.get("title").is_none());
    }

    #[test]
    fn merge_keeps_unmentioned_attributes() {
        let mut existing = Record::new("Post").with("title", "live").with("secret", 9i64);
        let restored = Record::new("Post").with("title", "old");
        existing.merge_from(&restored);
        assert_eq!(existing.get("title"), Some(&Value::from("old")));
        assert_eq!(existing.get("secret"), Some(&Value::Int(9)));
    }
}

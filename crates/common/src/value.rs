use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A scalar attribute value as stored in a record or a snapshot.
///
/// Serialized adjacently tagged (`{"t": "Int", "v": 5}`) so every codec sees
/// a plain map and the variant survives formats that have no native notion
/// of a tagged union.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
}

/// The shape of a [`Value`], used by schemas to accept or reject attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    Any,
    Bool,
    Int,
    Float,
    Text,
    Timestamp,
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Kind of this value, or `None` for null.
    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Self::Null => None,
            Self::Bool(_) => Some(ValueKind::Bool),
            Self::Int(_) => Some(ValueKind::Int),
            Self::Float(_) => Some(ValueKind::Float),
            Self::Text(_) => Some(ValueKind::Text),
            Self::Timestamp(_) => Some(ValueKind::Timestamp),
        }
    }
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Any => "any",
            Self::Bool => "bool",
            Self::Int => "int",
            Self::Float => "float",
            Self::Text => "text",
            Self::Timestamp => "timestamp",
        }
    }

    /// Whether a non-null value of `kind` fits this declared kind.
    pub fn admits(&self, kind: ValueKind) -> bool {
        *self == Self::Any || *self == kind
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => f.write_str("null"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<i32> for Value {
    fn from(i: i32) -> Self {
        Self::Int(i64::from(i))
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Self::Float(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(t: DateTime<Utc>) -> Self {
        Self::Timestamp(t)
    }
}

impl From<Key> for Value {
    fn from(key: Key) -> Self {
        match key {
            Key::Int(i) => Self::Int(i),
            Key::Text(s) => Self::Text(s),
        }
    }
}

/// One component of a record identifier.
///
/// Only integers and text can identify a record; floats and timestamps are
/// not totally ordered and never act as keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "t", content = "v")]
pub enum Key {
    Int(i64),
    Text(String),
}

impl Key {
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Int(i) => Some(Self::Int(*i)),
            Value::Text(s) => Some(Self::Text(s.clone())),
            _ => None,
        }
    }

    pub fn to_value(&self) -> Value {
        self.clone().into()
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

/// Primary identifier of a record: an ordered tuple of key components.
///
/// Single-column keys are a one-element tuple. Composite keys keep the
/// component order declared by the record's schema.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SubjectId(pub Vec<Key>);

impl SubjectId {
    pub fn single(key: impl Into<Key>) -> Self {
        Self(vec![key.into()])
    }

    pub fn components(&self) -> &[Key] {
        &self.0
    }

    pub fn is_composite(&self) -> bool {
        self.0.len() > 1
    }

    /// The only component of a single-column identifier.
    pub fn as_single(&self) -> Option<&Key> {
        match self.0.as_slice() {
            [key] => Some(key),
            _ => None,
        }
    }
}

impl From<i64> for Key {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<&str> for Key {
    fn from(s: &str) -> Self {
        Self::Text(s.to_string())
    }
}

impl From<String> for Key {
    fn from(s: String) -> Self {
        Self::Text(s)
    }
}

impl From<i64> for SubjectId {
    fn from(i: i64) -> Self {
        Self::single(i)
    }
}

impl From<&str> for SubjectId {
    fn from(s: &str) -> Self {
        Self::single(s)
    }
}

/// Text form of an identifier: components joined by `,`.
///
/// A text component is written in double quotes when it would not read back
/// as the same text on its own: when it is empty, parses as an integer, has
/// surrounding whitespace, or contains `,` or `"`. Inside quotes, `"` and `\`
/// are escaped with a backslash.
impl fmt::Display for SubjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, key) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            match key {
                Key::Text(s) if needs_quotes(s) => {
                    let escaped = s.replace('\\', "\\\\").replace('"', "\\\"");
                    write!(f, "\"{escaped}\"")?;
                }
                key => write!(f, "{key}")?,
            }
        }
        Ok(())
    }
}

fn needs_quotes(s: &str) -> bool {
    s.is_empty() || s.trim() != s || s.contains([',', '"']) || s.parse::<i64>().is_ok()
}

/// Error parsing a [`SubjectId`] from its comma-separated text form.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid subject id: {0:?}")]
pub struct ParseIdError(pub String);

impl FromStr for SubjectId {
    type Err = ParseIdError;

    /// Parses `"7"`, `"3,abc"` or `"3,\"4,5\""`. Bare components that parse
    /// as integers become [`Key::Int`], everything else [`Key::Text`].
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ParseIdError(s.to_string());
        let mut keys = Vec::new();
        let mut rest = s;
        loop {
            let part = rest.trim_start();
            let (key, after) = match part.strip_prefix('"') {
                Some(quoted) => {
                    let (text, after) = unquote(quoted).ok_or_else(invalid)?;
                    (Key::Text(text), after.trim_start())
                }
                None => {
                    let end = part.find(',').unwrap_or(part.len());
                    let bare = part[..end].trim();
                    if bare.is_empty() {
                        return Err(invalid());
                    }
                    let key = match bare.parse::<i64>() {
                        Ok(i) => Key::Int(i),
                        Err(_) => Key::Text(bare.to_string()),
                    };
                    (key, &part[end..])
                }
            };
            keys.push(key);
            match after.strip_prefix(',') {
                Some(next) => rest = next,
                None if after.is_empty() => break,
                None => return Err(invalid()),
            }
        }
        Ok(Self(keys))
    }
}

/// Read a quoted component up to its closing quote. Returns the text and
/// whatever follows the quote.
fn unquote(s: &str) -> Option<(String, &str)> {
    let mut text = String::new();
    let mut chars = s.char_indices();
    while let Some((i, c)) = chars.next() {
        match c {
            '"' => return Some((text, &s[i + 1..])),
            '\\' => text.push(chars.next()?.1),
            c => text.push(c),
        }
    }
    None
}

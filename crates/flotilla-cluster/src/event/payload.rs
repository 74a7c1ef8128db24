//! Row payloads carried by replication events.
//!
//! A [`Payload`] is an ordered column → value map. Ordering makes hashing and
//! wire encoding independent of the column order a query happened to use.
//!
//! A column *absent* from a payload means "leave the stored value alone"; an
//! explicit [`FieldValue::Null`] means "set it to NULL". Events written by
//! older nodes simply lack columns added later, and applying them never
//! erases data.

use rusqlite::types::Value as SqlValue;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;

/// A single column value in a payload.
///
/// Serialized as a plain JSON scalar.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "JsonValue", into = "JsonValue")]
pub enum FieldValue {
    Null,
    Bool(bool),
    Integer(i64),
    Real(f64),
    Text(String),
}

/// Error returned when a JSON value cannot represent a column value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("payload fields must be JSON scalars, got {kind}")]
pub struct NonScalarField {
    pub kind: &'static str,
}

impl TryFrom<JsonValue> for FieldValue {
    type Error = NonScalarField;

    fn try_from(value: JsonValue) -> Result<Self, Self::Error> {
        match value {
            JsonValue::Null => Ok(Self::Null),
            JsonValue::Bool(b) => Ok(Self::Bool(b)),
            JsonValue::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Real))
                .ok_or(NonScalarField { kind: "number" }),
            JsonValue::String(s) => Ok(Self::Text(s)),
            JsonValue::Array(_) => Err(NonScalarField { kind: "array" }),
            JsonValue::Object(_) => Err(NonScalarField { kind: "object" }),
        }
    }
}

impl From<FieldValue> for JsonValue {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => Self::Null,
            FieldValue::Bool(b) => Self::Bool(b),
            FieldValue::Integer(i) => Self::from(i),
            FieldValue::Real(f) => Self::from(f),
            FieldValue::Text(s) => Self::String(s),
        }
    }
}

impl From<FieldValue> for SqlValue {
    fn from(value: FieldValue) -> Self {
        match value {
            FieldValue::Null => Self::Null,
            FieldValue::Bool(b) => Self::Integer(i64::from(b)),
            FieldValue::Integer(i) => Self::Integer(i),
            FieldValue::Real(f) => Self::Real(f),
            FieldValue::Text(s) => Self::Text(s),
        }
    }
}

impl From<&str> for FieldValue {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for FieldValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<bool> for FieldValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl<T: Into<Self>> From<Option<T>> for FieldValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(Self::Null, Into::into)
    }
}

impl FieldValue {
    /// Borrow the text content, if this is a text value.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    fn feed(&self, hasher: &mut blake3::Hasher) {
        match self {
            Self::Null => {
                hasher.update(b"n");
            }
            Self::Bool(b) => {
                hasher.update(if *b { b"t" } else { b"f" });
            }
            Self::Integer(i) => {
                hasher.update(b"i");
                hasher.update(&i.to_le_bytes());
            }
            Self::Real(f) => {
                hasher.update(b"r");
                hasher.update(&f.to_bits().to_le_bytes());
            }
            Self::Text(s) => {
                hasher.update(b"s");
                hasher.update(&(s.len() as u64).to_le_bytes());
                hasher.update(s.as_bytes());
            }
        }
    }
}

/// Ordered column → value map for one row.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Payload(BTreeMap<String, FieldValue>);

impl Payload {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, column: &str, value: impl Into<FieldValue>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<FieldValue>) {
        self.0.insert(column.to_string(), value.into());
    }

    /// Value for `column`; `None` when the column is absent (not when it is
    /// NULL).
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&FieldValue> {
        self.0.get(column)
    }

    #[must_use]
    pub fn contains(&self, column: &str) -> bool {
        self.0.contains_key(column)
    }

    pub fn remove(&mut self, column: &str) -> Option<FieldValue> {
        self.0.remove(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FieldValue)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Content hash of the payload: `blake3:<hex>`.
    ///
    /// Covers every column name and value in key order, with type tags and
    /// length prefixes so distinct payloads cannot collide by concatenation.
    #[must_use]
    pub fn content_hash(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        for (column, value) in &self.0 {
            hasher.update(&(column.len() as u64).to_le_bytes());
            hasher.update(column.as_bytes());
            value.feed(&mut hasher);
        }
        format!("blake3:{}", hasher.finalize().to_hex())
    }

    /// Encode as compact JSON for storage in the event log.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    /// Decode from the JSON produced by [`Payload::to_json`].
    ///
    /// # Errors
    ///
    /// Returns an error if the input is not a JSON object of scalars.
    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

impl FromIterator<(String, FieldValue)> for Payload {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_ignores_insertion_order() {
        let a = Payload::new().with("title", "Add auth").with("points", 3_i64);
        let b = Payload::new().with("points", 3_i64).with("title", "Add auth");
        assert_eq!(a.content_hash(), b.content_hash());
        assert!(a.content_hash().starts_with("blake3:"));
    }

    #[test]
    fn hash_distinguishes_null_from_absent_and_types() {
        let absent = Payload::new().with("title", "x");
        let null = Payload::new()
            .with("title", "x")
            .with("branch_name", FieldValue::Null);
        assert_ne!(absent.content_hash(), null.content_hash());

        let int = Payload::new().with("v", 1_i64);
        let flag = Payload::new().with("v", true);
        let text = Payload::new().with("v", "1");
        assert_ne!(int.content_hash(), flag.content_hash());
        assert_ne!(int.content_hash(), text.content_hash());
    }

    #[test]
    fn hash_is_not_fooled_by_concatenation() {
        let a = Payload::new().with("ab", "c");
        let b = Payload::new().with("a", "bc");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn json_encoding_is_plain_scalars_in_key_order() {
        let payload = Payload::new()
            .with("title", "Add auth")
            .with("auto_plan", true)
            .with("points", 5_i64)
            .with("pr_url", None::<String>)
            .with("score", FieldValue::Real(0.5));
        let json = payload.to_json().expect("encode");
        assert_eq!(
            json,
            r#"{"auto_plan":true,"points":5,"pr_url":null,"score":0.5,"title":"Add auth"}"#
        );
        assert_eq!(Payload::from_json(&json).expect("decode"), payload);
    }

    #[test]
    fn nested_json_is_rejected() {
        assert!(Payload::from_json(r#"{"labels":["a","b"]}"#).is_err());
        assert!(Payload::from_json(r#"{"meta":{"a":1}}"#).is_err());
    }

    #[test]
    fn missing_and_null_are_distinguishable() {
        let payload = Payload::new().with("pr_url", FieldValue::Null);
        assert!(payload.contains("pr_url"));
        assert!(payload.get("pr_url").is_some_and(FieldValue::is_null));
        assert!(payload.get("branch_name").is_none());
    }

    #[test]
    fn field_values_bind_as_sqlite_values() {
        assert_eq!(SqlValue::from(FieldValue::Bool(true)), SqlValue::Integer(1));
        assert_eq!(SqlValue::from(FieldValue::Null), SqlValue::Null);
        assert_eq!(
            SqlValue::from(FieldValue::Text("x".to_string())),
            SqlValue::Text("x".to_string())
        );
    }
}

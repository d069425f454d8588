//! Collection schema descriptors
//!
//! A [`Schema`] names a collection and declares which fields are indexed and
//! which must be unique. It is consumed once, when a collection is opened,
//! to lay out tables and indexes.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

const MAX_IDENTIFIER_LEN: usize = 64;

/// The JSON shape a field is expected to hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldKind {
    Text,
    Integer,
    Float,
    Boolean,
    /// Unix milliseconds or an RFC 3339 string
    Timestamp,
    /// Arrays and objects
    Json,
}

impl FieldKind {
    /// `SQLite` column affinity used for indexed columns of this kind
    pub const fn sql_type(self) -> &'static str {
        match self {
            Self::Text | Self::Json => "TEXT",
            Self::Integer | Self::Boolean => "INTEGER",
            Self::Float => "REAL",
            Self::Timestamp => "",
        }
    }

    /// Whether a JSON value has the shape this kind describes. `null` always fits.
    ///
    /// Integers must fit in `i64`.
    pub fn accepts(self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) => true,
            (Self::Text, Value::String(_)) | (Self::Boolean, Value::Bool(_)) => true,
            (Self::Integer | Self::Timestamp, Value::Number(number)) => number.is_i64(),
            (Self::Float, Value::Number(_)) => true,
            (Self::Timestamp, Value::String(_)) => true,
            (Self::Json, Value::Array(_) | Value::Object(_)) => true,
            _ => false,
        }
    }
}

impl fmt::Display for FieldKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Integer => "integer",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Timestamp => "timestamp",
            Self::Json => "json",
        };
        f.write_str(name)
    }
}

/// Declaration of a single field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub kind: FieldKind,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
}

impl FieldSpec {
    /// Unique fields are always backed by an index
    pub const fn is_indexed(&self) -> bool {
        self.indexed || self.unique
    }
}

/// Validated description of a collection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    collection: String,
    fields: BTreeMap<String, FieldSpec>,
}

impl Schema {
    /// Start describing a collection
    pub fn builder(collection: impl Into<String>) -> SchemaBuilder {
        SchemaBuilder {
            collection: collection.into(),
            fields: Vec::new(),
        }
    }

    pub fn collection(&self) -> &str {
        &self.collection
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.get(name)
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    /// Fields that get a dedicated column and index
    pub fn indexed_fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields().filter(|(_, spec)| spec.is_indexed())
    }

    pub fn unique_fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields().filter(|(_, spec)| spec.unique)
    }

    /// Check a document body against the indexed fields' declared kinds
    pub fn check_body(&self, body: &serde_json::Map<String, Value>) -> Result<()> {
        for (name, spec) in self.indexed_fields() {
            let value = body.get(name).unwrap_or(&Value::Null);
            if !spec.kind.accepts(value) {
                return Err(Error::InvalidInput(format!(
                    "{}.{name} expects {} but got {value}",
                    self.collection, spec.kind
                )));
            }
        }
        Ok(())
    }
}

/// Builder for [`Schema`]
#[derive(Debug, Clone)]
#[must_use]
pub struct SchemaBuilder {
    collection: String,
    fields: Vec<(String, FieldSpec)>,
}

impl SchemaBuilder {
    /// Plain field, filtered by scanning
    pub fn field(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name, kind, false, false)
    }

    /// Field backed by a secondary index
    pub fn indexed(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name, kind, true, false)
    }

    /// Field backed by a unique index
    pub fn unique(self, name: impl Into<String>, kind: FieldKind) -> Self {
        self.push(name, kind, true, true)
    }

    fn push(mut self, name: impl Into<String>, kind: FieldKind, indexed: bool, unique: bool) -> Self {
        self.fields.push((
            name.into(),
            FieldSpec {
                kind,
                indexed,
                unique,
            },
        ));
        self
    }

    pub fn build(self) -> Result<Schema> {
        validate_identifier(&self.collection, "collection")?;
        if self.fields.is_empty() {
            return Err(Error::InvalidInput(format!(
                "collection {} declares no fields",
                self.collection
            )));
        }

        let mut fields = BTreeMap::new();
        for (name, spec) in self.fields {
            validate_identifier(&name, "field")?;
            if fields.insert(name.clone(), spec).is_some() {
                return Err(Error::InvalidInput(format!(
                    "field {name} declared twice in {}",
                    self.collection
                )));
            }
        }

        Ok(Schema {
            collection: self.collection,
            fields,
        })
    }
}

/// A Rust type stored as documents of one collection.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn schema() -> Result<Schema>;
}

/// Collection and field names are spliced into SQL, so only plain identifiers pass.
pub fn validate_identifier(name: &str, what: &str) -> Result<()> {
    static IDENTIFIER: OnceLock<Regex> = OnceLock::new();
    let re = IDENTIFIER
        .get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("Invalid regex"));

    if name.len() > MAX_IDENTIFIER_LEN || !re.is_match(name) {
        return Err(Error::InvalidInput(format!(
            "invalid {what} name {name:?}: use letters, digits and underscores"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn users() -> Schema {
        Schema::builder("users")
            .field("name", FieldKind::Text)
            .indexed("age", FieldKind::Integer)
            .unique("email", FieldKind::Text)
            .build()
            .unwrap()
    }

    #[test]
    fn builder_collects_index_flags() {
        let schema = users();
        assert_eq!(schema.collection(), "users");

        let indexed: Vec<_> = schema.indexed_fields().map(|(name, _)| name).collect();
        assert_eq!(indexed, vec!["age", "email"]);

        let unique: Vec<_> = schema.unique_fields().map(|(name, _)| name).collect();
        assert_eq!(unique, vec!["email"]);
    }

    #[test]
    fn builder_rejects_bad_identifiers() {
        assert!(Schema::builder("users; DROP TABLE x")
            .field("name", FieldKind::Text)
            .build()
            .is_err());
        assert!(Schema::builder("users")
            .field("na-me", FieldKind::Text)
            .build()
            .is_err());
        assert!(Schema::builder("users").build().is_err());
    }

    #[test]
    fn builder_rejects_duplicate_fields() {
        let result = Schema::builder("users")
            .field("name", FieldKind::Text)
            .unique("name", FieldKind::Text)
            .build();
        assert!(result.is_err());
    }

    #[test]
    fn field_kinds_accept_matching_shapes() {
        assert!(FieldKind::Integer.accepts(&json!(3)));
        assert!(!FieldKind::Integer.accepts(&json!(3.5)));
        assert!(FieldKind::Integer.accepts(&json!(i64::MIN)));
        assert!(!FieldKind::Integer.accepts(&json!(u64::MAX)));
        assert!(FieldKind::Float.accepts(&json!(3)));
        assert!(FieldKind::Timestamp.accepts(&json!("2024-01-01T00:00:00Z")));
        assert!(FieldKind::Json.accepts(&json!(["a"])));
        assert!(FieldKind::Text.accepts(&Value::Null));
        assert!(!FieldKind::Boolean.accepts(&json!("true")));
    }

    #[test]
    fn check_body_validates_indexed_fields_only() {
        let schema = users();
        let ok = json!({"name": 5, "age": 30, "email": "a@b.c"});
        assert!(schema.check_body(ok.as_object().unwrap()).is_ok());

        let bad = json!({"name": "x", "age": "thirty", "email": "a@b.c"});
        assert!(schema.check_body(bad.as_object().unwrap()).is_err());
    }
}

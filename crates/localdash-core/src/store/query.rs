//! Equality queries, patches and result ordering

use std::cmp::Ordering;

use serde_json::{Map, Value};

use super::backend::StoredDocument;

/// Conjunction of exact-equality clauses over data fields.
///
/// An empty query matches every document.
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use]
pub struct Query {
    clauses: Vec<(String, Value)>,
}

impl Query {
    pub fn new() -> Self {
        Self::default()
    }

    /// Require `field` to equal `value`. A later clause on the same field replaces the earlier one.
    pub fn eq(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        let field = field.into();
        let value = value.into();
        if let Some(clause) = self.clauses.iter_mut().find(|(name, _)| *name == field) {
            clause.1 = value;
        } else {
            self.clauses.push((field, value));
        }
        self
    }

    pub fn clauses(&self) -> &[(String, Value)] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    /// Absent fields compare as `null`.
    pub fn matches(&self, body: &Map<String, Value>) -> bool {
        self.clauses.iter().all(|(field, expected)| {
            values_equal(body.get(field).unwrap_or(&Value::Null), expected)
        })
    }
}

impl From<Map<String, Value>> for Query {
    fn from(map: Map<String, Value>) -> Self {
        Self {
            clauses: map.into_iter().collect(),
        }
    }
}

/// Field assignments applied by the update operations
#[derive(Debug, Clone, Default, PartialEq)]
#[must_use]
pub struct Patch {
    changes: Map<String, Value>,
}

impl Patch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(mut self, field: impl Into<String>, value: impl Into<Value>) -> Self {
        self.changes.insert(field.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.changes.keys().map(String::as_str)
    }

    /// Overwrite the patched fields, leaving the rest untouched
    pub fn apply_to(&self, body: &mut Map<String, Value>) {
        for (field, value) in &self.changes {
            body.insert(field.clone(), value.clone());
        }
    }
}

impl From<Map<String, Value>> for Patch {
    fn from(changes: Map<String, Value>) -> Self {
        Self { changes }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SortKey {
    Id,
    CreatedAt,
    UpdatedAt,
    Field(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sort {
    pub key: SortKey,
    pub order: SortOrder,
}

impl Sort {
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            key: SortKey::Field(field.into()),
            order: SortOrder::Ascending,
        }
    }

    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            key: SortKey::Field(field.into()),
            order: SortOrder::Descending,
        }
    }

    pub const fn by(key: SortKey, order: SortOrder) -> Self {
        Self { key, order }
    }

    fn compare(&self, a: &StoredDocument, b: &StoredDocument) -> Ordering {
        let ordering = match &self.key {
            SortKey::Id => a.id.cmp(&b.id),
            SortKey::CreatedAt => a.created_at.cmp(&b.created_at),
            SortKey::UpdatedAt => a.updated_at.cmp(&b.updated_at),
            SortKey::Field(field) => compare_values(
                a.body.get(field).unwrap_or(&Value::Null),
                b.body.get(field).unwrap_or(&Value::Null),
            ),
        };
        match self.order {
            SortOrder::Ascending => ordering,
            SortOrder::Descending => ordering.reverse(),
        }
    }
}

/// Pagination and ordering for `find`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[must_use]
pub struct FindOptions {
    pub skip: usize,
    pub limit: Option<usize>,
    pub sort: Option<Sort>,
}

impl FindOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub const fn skip(mut self, skip: usize) -> Self {
        self.skip = skip;
        self
    }

    pub const fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn sort(mut self, sort: Sort) -> Self {
        self.sort = Some(sort);
        self
    }

    /// Sort (stable, so insertion order breaks ties), then skip, then limit.
    pub(crate) fn apply(&self, mut docs: Vec<StoredDocument>) -> Vec<StoredDocument> {
        docs.sort_by_key(|doc| doc.id);
        if let Some(sort) = &self.sort {
            docs.sort_by(|a, b| sort.compare(a, b));
        }
        docs.into_iter()
            .skip(self.skip)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// JSON equality where numbers compare by value (`25 == 25.0`).
pub fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x == y,
            _ => x.as_f64() == y.as_f64(),
        },
        (Value::Array(xs), Value::Array(ys)) => {
            xs.len() == ys.len() && xs.iter().zip(ys).all(|(x, y)| values_equal(x, y))
        }
        (Value::Object(xs), Value::Object(ys)) => {
            xs.len() == ys.len()
                && xs
                    .iter()
                    .all(|(key, x)| ys.get(key).is_some_and(|y| values_equal(x, y)))
        }
        _ => a == b,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    fn rank(value: &Value) -> u8 {
        match value {
            Value::Null => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::String(_) => 3,
            Value::Array(_) => 4,
            Value::Object(_) => 5,
        }
    }

    match (a, b) {
        (Value::Bool(x), Value::Bool(y)) => x.cmp(y),
        (Value::Number(x), Value::Number(y)) => match (x.as_i64(), y.as_i64()) {
            (Some(x), Some(y)) => x.cmp(&y),
            _ => x
                .as_f64()
                .unwrap_or(f64::NAN)
                .total_cmp(&y.as_f64().unwrap_or(f64::NAN)),
        },
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Array(_), Value::Array(_)) | (Value::Object(_), Value::Object(_)) => {
            a.to_string().cmp(&b.to_string())
        }
        _ => rank(a).cmp(&rank(b)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: i64, body: Value) -> StoredDocument {
        StoredDocument {
            id,
            created_at: id,
            updated_at: id,
            body: body.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn query_matches_all_clauses() {
        let body = json!({"name": "ada", "age": 30}).as_object().cloned().unwrap();
        assert!(Query::new().matches(&body));
        assert!(Query::new().eq("age", 30).matches(&body));
        assert!(Query::new().eq("age", 30.0).matches(&body));
        assert!(!Query::new().eq("age", 30).eq("name", "bob").matches(&body));
        assert!(Query::new().eq("missing", Value::Null).matches(&body));
    }

    #[test]
    fn repeated_clause_replaces_previous_value() {
        let query = Query::new().eq("age", 1).eq("age", 2);
        assert_eq!(query.clauses().len(), 1);
        assert_eq!(query.clauses()[0].1, json!(2));
    }

    #[test]
    fn patch_overwrites_only_named_fields() {
        let mut body = json!({"name": "ada", "age": 30}).as_object().cloned().unwrap();
        Patch::new().set("age", 31).apply_to(&mut body);
        assert_eq!(body["age"], json!(31));
        assert_eq!(body["name"], json!("ada"));
    }

    #[test]
    fn options_sort_then_skip_then_limit() {
        let docs = vec![
            doc(1, json!({"age": 30})),
            doc(2, json!({"age": 25})),
            doc(3, json!({"age": 40})),
            doc(4, json!({"age": 25})),
        ];

        let ids: Vec<_> = FindOptions::new()
            .sort(Sort::asc("age"))
            .skip(1)
            .limit(2)
            .apply(docs.clone())
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        assert_eq!(ids, vec![4, 1]);

        let ids: Vec<_> = FindOptions::new()
            .sort(Sort::desc("age"))
            .apply(docs)
            .into_iter()
            .map(|doc| doc.id)
            .collect();
        assert_eq!(ids, vec![3, 1, 2, 4]);
    }

    #[test]
    fn compare_values_orders_across_types() {
        assert_eq!(compare_values(&Value::Null, &json!(0)), Ordering::Less);
        assert_eq!(compare_values(&json!(2), &json!(10)), Ordering::Less);
        assert_eq!(compare_values(&json!(2.5), &json!(2)), Ordering::Greater);
        assert_eq!(compare_values(&json!("b"), &json!("a")), Ordering::Greater);
    }
}

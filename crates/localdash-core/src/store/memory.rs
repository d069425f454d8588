//! In-memory document backend, used when no durable substrate is available

use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use super::backend::{BackendKind, DocumentBackend, PendingDocument, StoredDocument};
use super::query::{values_equal, Query};
use super::schema::Schema;
use crate::error::{Error, Result};

#[derive(Debug, Default)]
struct Table {
    last_id: i64,
    rows: BTreeMap<i64, StoredDocument>,
}

/// Process-local document storage with the same guarantees as the `SQLite`
/// backend, minus durability.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    tables: HashMap<String, Table>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn table(&mut self, schema: &Schema) -> &mut Table {
        self.tables.entry(schema.collection().to_string()).or_default()
    }
}

impl Table {
    fn push(&mut self, schema: &Schema, doc: &PendingDocument) -> Result<i64> {
        schema.check_body(&doc.body)?;
        self.check_unique(schema, &doc.body, None)?;

        self.last_id += 1;
        let id = self.last_id;
        self.rows.insert(
            id,
            StoredDocument {
                id,
                created_at: doc.created_at,
                updated_at: doc.updated_at,
                body: doc.body.clone(),
            },
        );
        Ok(id)
    }

    /// Reject `body` if a unique field collides with a row other than `own_id`
    fn check_unique(
        &self,
        schema: &Schema,
        body: &serde_json::Map<String, Value>,
        own_id: Option<i64>,
    ) -> Result<()> {
        for (field, _) in schema.unique_fields() {
            let Some(value) = body.get(field).filter(|value| !value.is_null()) else {
                continue;
            };
            let collides = self.rows.values().any(|row| {
                Some(row.id) != own_id
                    && row
                        .body
                        .get(field)
                        .is_some_and(|other| values_equal(other, value))
            });
            if collides {
                return Err(Error::ConstraintViolation {
                    collection: schema.collection().to_string(),
                    field: field.to_string(),
                });
            }
        }
        Ok(())
    }
}

impl DocumentBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    fn ensure_collection(&mut self, schema: &Schema) -> Result<()> {
        self.table(schema);
        Ok(())
    }

    fn insert(&mut self, schema: &Schema, doc: &PendingDocument) -> Result<i64> {
        self.table(schema).push(schema, doc)
    }

    fn get(&mut self, schema: &Schema, id: i64) -> Result<Option<StoredDocument>> {
        Ok(self.table(schema).rows.get(&id).cloned())
    }

    fn scan(&mut self, schema: &Schema, query: &Query) -> Result<Vec<StoredDocument>> {
        Ok(self
            .table(schema)
            .rows
            .values()
            .filter(|row| query.matches(&row.body))
            .cloned()
            .collect())
    }

    fn replace(&mut self, schema: &Schema, docs: &[StoredDocument]) -> Result<()> {
        for doc in docs {
            schema.check_body(&doc.body)?;
        }

        let table = self.table(schema);
        // Validate against the post-update state before touching any row
        let mut staged = Table {
            last_id: table.last_id,
            rows: table.rows.clone(),
        };
        for doc in docs {
            if !staged.rows.contains_key(&doc.id) {
                return Err(Error::Storage(format!(
                    "document {} vanished from {}",
                    doc.id,
                    schema.collection()
                )));
            }
            staged.rows.insert(doc.id, doc.clone());
        }
        for doc in docs {
            staged.check_unique(schema, &doc.body, Some(doc.id))?;
        }

        *table = staged;
        Ok(())
    }

    fn delete(&mut self, schema: &Schema, ids: &[i64]) -> Result<usize> {
        let table = self.table(schema);
        Ok(ids
            .iter()
            .filter(|id| table.rows.remove(*id).is_some())
            .count())
    }

    fn clear(&mut self, schema: &Schema) -> Result<()> {
        self.table(schema).rows.clear();
        Ok(())
    }

    fn reset(&mut self, schema: &Schema, docs: &[PendingDocument]) -> Result<Vec<i64>> {
        let table = self.table(schema);
        let mut staged = Table {
            last_id: table.last_id,
            rows: BTreeMap::new(),
        };
        let ids = docs
            .iter()
            .map(|doc| staged.push(schema, doc))
            .collect::<Result<Vec<_>>>()?;

        *table = staged;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::schema::FieldKind;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::builder("users")
            .field("name", FieldKind::Text)
            .unique("email", FieldKind::Text)
            .build()
            .unwrap()
    }

    fn pending(body: Value) -> PendingDocument {
        PendingDocument {
            created_at: 1,
            updated_at: 1,
            body: body.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn ids_are_not_reused_after_clear() {
        let schema = schema();
        let mut backend = MemoryBackend::new();

        let first = backend.insert(&schema, &pending(json!({"email": "a"}))).unwrap();
        backend.clear(&schema).unwrap();
        let second = backend.insert(&schema, &pending(json!({"email": "a"}))).unwrap();

        assert!(second > first);
    }

    #[test]
    fn unique_violation_leaves_rows_untouched() {
        let schema = schema();
        let mut backend = MemoryBackend::new();
        let a = backend.insert(&schema, &pending(json!({"email": "a"}))).unwrap();
        backend.insert(&schema, &pending(json!({"email": "b"}))).unwrap();

        let mut doc = backend.get(&schema, a).unwrap().unwrap();
        doc.body.insert("email".into(), json!("b"));
        let error = backend.replace(&schema, &[doc]).unwrap_err();
        assert!(matches!(error, Error::ConstraintViolation { .. }));

        let unchanged = backend.get(&schema, a).unwrap().unwrap();
        assert_eq!(unchanged.body["email"], json!("a"));
    }

    #[test]
    fn null_unique_values_do_not_collide() {
        let schema = schema();
        let mut backend = MemoryBackend::new();
        backend.insert(&schema, &pending(json!({"name": "x"}))).unwrap();
        backend.insert(&schema, &pending(json!({"name": "y"}))).unwrap();
        assert_eq!(backend.scan(&schema, &Query::new()).unwrap().len(), 2);
    }

    #[test]
    fn reset_keeps_old_rows_when_a_new_one_collides() {
        let schema = schema();
        let mut backend = MemoryBackend::new();
        backend.insert(&schema, &pending(json!({"email": "old"}))).unwrap();

        let batch = [pending(json!({"email": "x"})), pending(json!({"email": "x"}))];
        assert!(matches!(
            backend.reset(&schema, &batch),
            Err(Error::ConstraintViolation { .. })
        ));
        let rows = backend.scan(&schema, &Query::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].body["email"], json!("old"));

        let ids = backend
            .reset(&schema, &[pending(json!({"email": "x"})), pending(json!({"email": "y"}))])
            .unwrap();
        assert_eq!(ids, vec![2, 3]);
        assert_eq!(backend.scan(&schema, &Query::new()).unwrap().len(), 2);
    }

    #[test]
    fn integers_beyond_i64_are_rejected() {
        let schema = Schema::builder("counters")
            .indexed("value", FieldKind::Integer)
            .build()
            .unwrap();
        let mut backend = MemoryBackend::new();
        let result = backend.insert(&schema, &pending(json!({"value": u64::MAX})));
        assert!(matches!(result, Err(Error::InvalidInput(_))));
    }
}

//! `SQLite` document backend
//!
//! Each collection lives in its own table `doc_<collection>` with the body
//! stored as JSON. Every indexed field is mirrored into a typed column
//! `f_<field>` carrying a (unique) index, so uniqueness is enforced by
//! `SQLite` itself and equality clauses on indexed fields become `WHERE`
//! predicates.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde_json::{Map, Value};

use super::backend::{BackendKind, DocumentBackend, PendingDocument, StoredDocument};
use super::query::Query;
use super::schema::{FieldKind, Schema};
use crate::db::Database;
use crate::error::{Error, Result};

/// Durable document storage in a single `SQLite` database file
pub struct SqliteBackend {
    db: Database,
    ready: HashSet<String>,
}

impl SqliteBackend {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(Database::open(path)?))
    }

    pub fn open_in_memory() -> Result<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn new(db: Database) -> Self {
        Self {
            db,
            ready: HashSet::new(),
        }
    }

    fn require_ready(&self, schema: &Schema) -> Result<()> {
        if self.ready.contains(schema.collection()) {
            Ok(())
        } else {
            Err(Error::Storage(format!(
                "collection {} was not opened on this store",
                schema.collection()
            )))
        }
    }
}

fn table_name(schema: &Schema) -> String {
    format!("doc_{}", schema.collection())
}

fn column_name(field: &str) -> String {
    format!("f_{field}")
}

/// `:` cannot appear in identifiers, so names never collide across collections
fn index_name(schema: &Schema, field: &str) -> String {
    format!("idx:{}:{field}", schema.collection())
}

/// Convert a JSON value into the column representation of `kind`
fn column_value(kind: FieldKind, value: &Value) -> Option<SqlValue> {
    match (kind, value) {
        (_, Value::Null) => Some(SqlValue::Null),
        (FieldKind::Integer | FieldKind::Timestamp, Value::Number(number)) => {
            number.as_i64().map(SqlValue::Integer)
        }
        (FieldKind::Float, Value::Number(number)) => number.as_f64().map(SqlValue::Real),
        (FieldKind::Boolean, Value::Bool(flag)) => Some(SqlValue::Integer(i64::from(*flag))),
        (FieldKind::Text | FieldKind::Timestamp, Value::String(text)) => {
            Some(SqlValue::Text(text.clone()))
        }
        (FieldKind::Json, Value::Array(_) | Value::Object(_)) => {
            Some(SqlValue::Text(value.to_string()))
        }
        _ => None,
    }
}

/// Column values for every indexed field of `body`, in schema order
fn index_values(schema: &Schema, body: &Map<String, Value>) -> Result<Vec<SqlValue>> {
    schema
        .indexed_fields()
        .map(|(field, spec)| {
            let value = body.get(field).unwrap_or(&Value::Null);
            column_value(spec.kind, value).ok_or_else(|| {
                Error::InvalidInput(format!(
                    "{}.{field} expects {} but got {value}",
                    schema.collection(),
                    spec.kind
                ))
            })
        })
        .collect()
}

/// Write one new row; runs on a plain connection or inside a transaction
fn insert_row(conn: &Connection, schema: &Schema, doc: &PendingDocument) -> Result<i64> {
    schema.check_body(&doc.body)?;

    let mut columns = vec![
        "created_at".to_string(),
        "updated_at".to_string(),
        "body".to_string(),
    ];
    columns.extend(
        schema
            .indexed_fields()
            .map(|(field, _)| format!("\"{}\"", column_name(field))),
    );
    let placeholders = (1..=columns.len())
        .map(|n| format!("?{n}"))
        .collect::<Vec<_>>()
        .join(", ");

    let mut values = vec![
        SqlValue::Integer(doc.created_at),
        SqlValue::Integer(doc.updated_at),
        SqlValue::Text(serde_json::to_string(&doc.body)?),
    ];
    values.extend(index_values(schema, &doc.body)?);

    conn.execute(
        &format!(
            "INSERT INTO \"{}\" ({}) VALUES ({placeholders})",
            table_name(schema),
            columns.join(", ")
        ),
        params_from_iter(values),
    )?;
    Ok(conn.last_insert_rowid())
}

type RawRow = (i64, i64, i64, String);

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn parse_row((id, created_at, updated_at, body): RawRow) -> Result<StoredDocument> {
    Ok(StoredDocument {
        id,
        created_at,
        updated_at,
        body: serde_json::from_str(&body)?,
    })
}

impl DocumentBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    fn ensure_collection(&mut self, schema: &Schema) -> Result<()> {
        let table = table_name(schema);
        let schema_json = serde_json::to_string(schema)?;
        let tx = self.db.connection_mut().transaction()?;

        tx.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{table}\" (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                body TEXT NOT NULL
            )"
        ))?;

        let existing: HashSet<String> = {
            let mut stmt = tx.prepare(&format!("PRAGMA table_info(\"{table}\")"))?;
            let columns = stmt
                .query_map([], |row| row.get::<_, String>(1))?
                .collect::<rusqlite::Result<_>>()?;
            columns
        };

        let indexes: HashMap<String, bool> = {
            let mut stmt = tx.prepare(&format!("PRAGMA index_list(\"{table}\")"))?;
            let indexes = stmt
                .query_map([], |row| Ok((row.get::<_, String>(1)?, row.get::<_, bool>(2)?)))?
                .collect::<rusqlite::Result<_>>()?;
            indexes
        };

        for (field, spec) in schema.indexed_fields() {
            let column = column_name(field);
            if !existing.contains(&column) {
                tx.execute_batch(&format!(
                    "ALTER TABLE \"{table}\" ADD COLUMN \"{column}\" {}",
                    spec.kind.sql_type()
                ))?;

                // Backfill documents written before the field was indexed
                let rows = {
                    let mut stmt = tx.prepare(&format!("SELECT id, body FROM \"{table}\""))?;
                    let rows = stmt
                        .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                        .collect::<rusqlite::Result<Vec<_>>>()?;
                    rows
                };
                for (id, body) in rows {
                    let body: Map<String, Value> = serde_json::from_str(&body)?;
                    let value = column_value(spec.kind, body.get(field).unwrap_or(&Value::Null))
                        .unwrap_or(SqlValue::Null);
                    tx.execute(
                        &format!("UPDATE \"{table}\" SET \"{column}\" = ?1 WHERE id = ?2"),
                        params![value, id],
                    )?;
                }
                tracing::info!("Added index column {column} to {table}");
            }

            let index = index_name(schema, field);
            match indexes.get(&index) {
                Some(&unique) if unique == spec.unique => continue,
                Some(_) => {
                    tx.execute_batch(&format!("DROP INDEX \"{index}\""))?;
                    tracing::info!("Rebuilding {index} with unique={}", spec.unique);
                }
                None => {}
            }
            let unique = if spec.unique { "UNIQUE " } else { "" };
            tx.execute_batch(&format!(
                "CREATE {unique}INDEX \"{index}\" ON \"{table}\"(\"{column}\")"
            ))?;
        }

        tx.execute(
            "INSERT INTO collections (name, schema, created_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(name) DO UPDATE SET schema = excluded.schema",
            params![schema.collection(), schema_json, crate::util::now_millis()],
        )?;
        tx.commit()?;

        self.ready.insert(schema.collection().to_string());
        Ok(())
    }

    fn insert(&mut self, schema: &Schema, doc: &PendingDocument) -> Result<i64> {
        self.require_ready(schema)?;
        insert_row(self.db.connection(), schema, doc)
    }

    fn get(&mut self, schema: &Schema, id: i64) -> Result<Option<StoredDocument>> {
        self.require_ready(schema)?;
        let raw = self
            .db
            .connection()
            .query_row(
                &format!(
                    "SELECT id, created_at, updated_at, body FROM \"{}\" WHERE id = ?1",
                    table_name(schema)
                ),
                params![id],
                read_raw,
            )
            .optional()?;
        raw.map(parse_row).transpose()
    }

    fn scan(&mut self, schema: &Schema, query: &Query) -> Result<Vec<StoredDocument>> {
        self.require_ready(schema)?;

        let mut predicates = Vec::new();
        let mut values = Vec::new();
        for (field, expected) in query.clauses() {
            let Some(spec) = schema.field(field).filter(|spec| spec.is_indexed()) else {
                continue;
            };
            if spec.kind == FieldKind::Json {
                continue;
            }
            match column_value(spec.kind, expected) {
                Some(SqlValue::Null) => predicates.push(format!("\"{}\" IS NULL", column_name(field))),
                Some(value) => {
                    values.push(value);
                    predicates.push(format!("\"{}\" = ?{}", column_name(field), values.len()));
                }
                None => {}
            }
        }

        let where_clause = if predicates.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", predicates.join(" AND "))
        };

        let mut stmt = self.db.connection().prepare(&format!(
            "SELECT id, created_at, updated_at, body FROM \"{}\"{where_clause} ORDER BY id",
            table_name(schema)
        ))?;
        let raw_rows = stmt
            .query_map(params_from_iter(values), read_raw)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut docs = Vec::with_capacity(raw_rows.len());
        for raw in raw_rows {
            let doc = parse_row(raw)?;
            if query.matches(&doc.body) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    fn replace(&mut self, schema: &Schema, docs: &[StoredDocument]) -> Result<()> {
        self.require_ready(schema)?;

        let mut assignments = vec![
            "created_at = ?1".to_string(),
            "updated_at = ?2".to_string(),
            "body = ?3".to_string(),
        ];
        for (position, (field, _)) in schema.indexed_fields().enumerate() {
            assignments.push(format!("\"{}\" = ?{}", column_name(field), position + 4));
        }
        let id_param = assignments.len() + 1;
        let sql = format!(
            "UPDATE \"{}\" SET {} WHERE id = ?{id_param}",
            table_name(schema),
            assignments.join(", ")
        );

        let tx = self.db.connection_mut().transaction()?;
        for doc in docs {
            schema.check_body(&doc.body)?;
            let mut values = vec![
                SqlValue::Integer(doc.created_at),
                SqlValue::Integer(doc.updated_at),
                SqlValue::Text(serde_json::to_string(&doc.body)?),
            ];
            values.extend(index_values(schema, &doc.body)?);
            values.push(SqlValue::Integer(doc.id));

            if tx.execute(&sql, params_from_iter(values))? == 0 {
                return Err(Error::Storage(format!(
                    "document {} vanished from {}",
                    doc.id,
                    schema.collection()
                )));
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn delete(&mut self, schema: &Schema, ids: &[i64]) -> Result<usize> {
        self.require_ready(schema)?;
        let sql = format!("DELETE FROM \"{}\" WHERE id = ?1", table_name(schema));

        let tx = self.db.connection_mut().transaction()?;
        let mut removed = 0;
        for id in ids {
            removed += tx.execute(&sql, params![id])?;
        }
        tx.commit()?;
        Ok(removed)
    }

    fn clear(&mut self, schema: &Schema) -> Result<()> {
        self.require_ready(schema)?;
        // AUTOINCREMENT keeps its high-water mark in sqlite_sequence
        self.db
            .connection()
            .execute(&format!("DELETE FROM \"{}\"", table_name(schema)), [])?;
        Ok(())
    }

    fn reset(&mut self, schema: &Schema, docs: &[PendingDocument]) -> Result<Vec<i64>> {
        self.require_ready(schema)?;
        let tx = self.db.connection_mut().transaction()?;
        tx.execute(&format!("DELETE FROM \"{}\"", table_name(schema)), [])?;
        let ids = docs
            .iter()
            .map(|doc| insert_row(&tx, schema, doc))
            .collect::<Result<Vec<_>>>()?;
        tx.commit()?;
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn schema() -> Schema {
        Schema::builder("users")
            .field("name", FieldKind::Text)
            .indexed("age", FieldKind::Integer)
            .unique("email", FieldKind::Text)
            .build()
            .unwrap()
    }

    fn pending(body: Value) -> PendingDocument {
        PendingDocument {
            created_at: 10,
            updated_at: 10,
            body: body.as_object().cloned().unwrap(),
        }
    }

    #[test]
    fn unique_index_rejects_duplicates() {
        let schema = schema();
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend.ensure_collection(&schema).unwrap();

        backend
            .insert(&schema, &pending(json!({"name": "a", "age": 1, "email": "x@y"})))
            .unwrap();
        let error = backend
            .insert(&schema, &pending(json!({"name": "b", "age": 2, "email": "x@y"})))
            .unwrap_err();

        match error {
            Error::ConstraintViolation { collection, field } => {
                assert_eq!(collection, "users");
                assert_eq!(field, "email");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn scan_pushes_down_indexed_and_filters_plain_fields() {
        let schema = schema();
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend.ensure_collection(&schema).unwrap();

        for (name, age) in [("a", 25), ("b", 30), ("c", 25)] {
            backend
                .insert(&schema, &pending(json!({"name": name, "age": age})))
                .unwrap();
        }

        let by_age = backend.scan(&schema, &Query::new().eq("age", 25)).unwrap();
        assert_eq!(by_age.len(), 2);

        let by_name = backend
            .scan(&schema, &Query::new().eq("age", 25).eq("name", "c"))
            .unwrap();
        assert_eq!(by_name.len(), 1);
        assert_eq!(by_name[0].body["name"], json!("c"));
    }

    #[test]
    fn ids_survive_clear_and_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("store.db");
        let schema = schema();

        let first = {
            let mut backend = SqliteBackend::open(&path).unwrap();
            backend.ensure_collection(&schema).unwrap();
            let id = backend.insert(&schema, &pending(json!({"name": "a"}))).unwrap();
            backend.clear(&schema).unwrap();
            id
        };

        let mut backend = SqliteBackend::open(&path).unwrap();
        backend.ensure_collection(&schema).unwrap();
        let second = backend.insert(&schema, &pending(json!({"name": "b"}))).unwrap();
        assert!(second > first);
    }

    #[test]
    fn adding_an_index_backfills_existing_rows() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("store.db");

        let plain = Schema::builder("users")
            .field("name", FieldKind::Text)
            .build()
            .unwrap();
        {
            let mut backend = SqliteBackend::open(&path).unwrap();
            backend.ensure_collection(&plain).unwrap();
            backend.insert(&plain, &pending(json!({"name": "ada"}))).unwrap();
        }

        let indexed = Schema::builder("users")
            .indexed("name", FieldKind::Text)
            .build()
            .unwrap();
        let mut backend = SqliteBackend::open(&path).unwrap();
        backend.ensure_collection(&indexed).unwrap();

        let found = backend.scan(&indexed, &Query::new().eq("name", "ada")).unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn replace_is_all_or_nothing() {
        let schema = schema();
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend.ensure_collection(&schema).unwrap();

        let a = backend.insert(&schema, &pending(json!({"email": "a"}))).unwrap();
        let b = backend.insert(&schema, &pending(json!({"email": "b"}))).unwrap();

        let mut doc_a = backend.get(&schema, a).unwrap().unwrap();
        let mut doc_b = backend.get(&schema, b).unwrap().unwrap();
        doc_a.body.insert("email".into(), json!("same"));
        doc_b.body.insert("email".into(), json!("same"));

        assert!(backend.replace(&schema, &[doc_a, doc_b]).is_err());
        let unchanged = backend.get(&schema, a).unwrap().unwrap();
        assert_eq!(unchanged.body["email"], json!("a"));
    }

    #[test]
    fn index_names_do_not_collide_across_collections() {
        let first = Schema::builder("a_b")
            .indexed("c", FieldKind::Text)
            .build()
            .unwrap();
        let second = Schema::builder("a")
            .unique("b_c", FieldKind::Text)
            .build()
            .unwrap();
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend.ensure_collection(&first).unwrap();
        backend.ensure_collection(&second).unwrap();

        backend.insert(&second, &pending(json!({"b_c": "same"}))).unwrap();
        let duplicate = backend.insert(&second, &pending(json!({"b_c": "same"})));
        assert!(matches!(duplicate, Err(Error::ConstraintViolation { .. })));
        assert_eq!(backend.scan(&second, &Query::new()).unwrap().len(), 1);

        // The sibling collection keeps its plain index
        backend.insert(&first, &pending(json!({"c": "same"}))).unwrap();
        backend.insert(&first, &pending(json!({"c": "same"}))).unwrap();
    }

    #[test]
    fn promoting_a_field_to_unique_rebuilds_its_index() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("store.db");

        let indexed = Schema::builder("users")
            .indexed("email", FieldKind::Text)
            .build()
            .unwrap();
        {
            let mut backend = SqliteBackend::open(&path).unwrap();
            backend.ensure_collection(&indexed).unwrap();
            backend.insert(&indexed, &pending(json!({"email": "x@y"}))).unwrap();
        }

        let unique = Schema::builder("users")
            .unique("email", FieldKind::Text)
            .build()
            .unwrap();
        let mut backend = SqliteBackend::open(&path).unwrap();
        backend.ensure_collection(&unique).unwrap();

        let duplicate = backend.insert(&unique, &pending(json!({"email": "x@y"})));
        assert!(matches!(duplicate, Err(Error::ConstraintViolation { .. })));
    }

    #[test]
    fn failed_reset_rolls_back_to_previous_rows() {
        let schema = schema();
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        backend.ensure_collection(&schema).unwrap();
        let old = backend.insert(&schema, &pending(json!({"email": "old"}))).unwrap();

        let batch = [pending(json!({"email": "x"})), pending(json!({"email": "x"}))];
        assert!(matches!(
            backend.reset(&schema, &batch),
            Err(Error::ConstraintViolation { .. })
        ));
        let rows = backend.scan(&schema, &Query::new()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].id, old);

        let ids = backend
            .reset(&schema, &[pending(json!({"email": "x"}))])
            .unwrap();
        assert!(ids[0] > old);
        assert_eq!(backend.scan(&schema, &Query::new()).unwrap().len(), 1);
    }

    #[test]
    fn writes_require_an_opened_collection() {
        let mut backend = SqliteBackend::open_in_memory().unwrap();
        let result = backend.insert(&schema(), &pending(json!({"name": "a"})));
        assert!(matches!(result, Err(Error::Storage(_))));
    }
}

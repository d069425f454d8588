//! Embedded document store
//!
//! A [`DocumentStore`] owns one persistence substrate (a "store family") and
//! hands out typed [`Collection`]s, one per [`Record`] type. Documents carry
//! three implicit fields next to the record: a store-assigned `id` that is
//! strictly increasing and never reused, `created_at`, and `updated_at`.

mod backend;
mod memory;
mod query;
mod schema;
mod sqlite;

use std::fmt;
use std::marker::PhantomData;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::Mutex;

pub use backend::{BackendKind, DocumentBackend, PendingDocument, StoredDocument};
pub use memory::MemoryBackend;
pub use query::{compare_values, values_equal, FindOptions, Patch, Query, Sort, SortKey, SortOrder};
pub use schema::{validate_identifier, FieldKind, FieldSpec, Record, Schema, SchemaBuilder};
pub use sqlite::SqliteBackend;

use crate::error::{Error, Result};
use crate::util::now_millis;

/// Store-assigned document identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(i64);

impl DocumentId {
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn get(self) -> i64 {
        self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored record with its implicit fields
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document<T> {
    pub id: DocumentId,
    /// Creation timestamp (Unix ms), never changes
    pub created_at: i64,
    /// Last successful mutation (Unix ms)
    pub updated_at: i64,
    pub data: T,
}

/// Input for [`Collection::create_with`]; absent timestamps default to now
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument<T> {
    pub data: T,
    pub created_at: Option<i64>,
    pub updated_at: Option<i64>,
}

impl<T> NewDocument<T> {
    pub const fn new(data: T) -> Self {
        Self {
            data,
            created_at: None,
            updated_at: None,
        }
    }

    #[must_use]
    pub const fn created_at(mut self, millis: i64) -> Self {
        self.created_at = Some(millis);
        self
    }

    #[must_use]
    pub const fn updated_at(mut self, millis: i64) -> Self {
        self.updated_at = Some(millis);
        self
    }
}

type SharedBackend = Arc<Mutex<Box<dyn DocumentBackend>>>;

/// Handle to one store family. Cheap to clone; clones share the substrate.
#[derive(Clone)]
pub struct DocumentStore {
    backend: SharedBackend,
    kind: BackendKind,
}

impl DocumentStore {
    /// Open (or create) a durable store at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::with_backend(SqliteBackend::open(path)?))
    }

    /// Open a durable store, degrading to memory if the database cannot be opened
    pub fn open_or_fallback(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match SqliteBackend::open(path) {
            Ok(backend) => Self::with_backend(backend),
            Err(error) => {
                tracing::warn!(
                    "Document store at {} unavailable ({error}); continuing in memory",
                    path.display()
                );
                Self::open_in_memory()
            }
        }
    }

    /// Open a non-durable store (tests and degraded mode)
    pub fn open_in_memory() -> Self {
        Self::with_backend(MemoryBackend::new())
    }

    pub fn with_backend(backend: impl DocumentBackend + 'static) -> Self {
        let kind = backend.kind();
        Self {
            backend: Arc::new(Mutex::new(Box::new(backend))),
            kind,
        }
    }

    pub const fn backend_kind(&self) -> BackendKind {
        self.kind
    }

    /// Open the collection for `T`, creating its table and indexes on first use
    pub async fn collection<T: Record>(&self) -> Result<Collection<T>> {
        let schema = T::schema()?;
        self.backend.lock().await.ensure_collection(&schema)?;
        tracing::debug!("Opened collection {}", schema.collection());
        Ok(Collection {
            backend: Arc::clone(&self.backend),
            schema: Arc::new(schema),
            _record: PhantomData,
        })
    }
}

impl fmt::Debug for DocumentStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentStore")
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// Typed view over one collection
pub struct Collection<T> {
    backend: SharedBackend,
    schema: Arc<Schema>,
    _record: PhantomData<fn() -> T>,
}

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            backend: Arc::clone(&self.backend),
            schema: Arc::clone(&self.schema),
            _record: PhantomData,
        }
    }
}

impl<T: Record> Collection<T> {
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    /// Persist a new record stamped with the current time
    pub async fn create(&self, data: T) -> Result<Document<T>> {
        self.create_with(NewDocument::new(data)).await
    }

    pub async fn create_with(&self, new: NewDocument<T>) -> Result<Document<T>> {
        let now = now_millis();
        let pending = PendingDocument {
            created_at: new.created_at.unwrap_or(now),
            updated_at: new.updated_at.unwrap_or(now),
            body: to_body(&new.data)?,
        };

        let id = self.backend.lock().await.insert(&self.schema, &pending)?;
        tracing::debug!("Created {}#{id}", self.schema.collection());

        Ok(Document {
            id: DocumentId(id),
            created_at: pending.created_at,
            updated_at: pending.updated_at,
            data: new.data,
        })
    }

    pub async fn find(&self, query: &Query, options: &FindOptions) -> Result<Vec<Document<T>>> {
        let rows = self.backend.lock().await.scan(&self.schema, query)?;
        options.apply(rows).into_iter().map(from_stored).collect()
    }

    /// First match in insertion order; `None` is "not found", never an error
    pub async fn find_one(&self, query: &Query) -> Result<Option<Document<T>>> {
        let mut found = self.find(query, &FindOptions::new().limit(1)).await?;
        Ok(found.pop())
    }

    pub async fn find_by_id(&self, id: DocumentId) -> Result<Option<Document<T>>> {
        let row = self.backend.lock().await.get(&self.schema, id.0)?;
        row.map(from_stored).transpose()
    }

    /// Patch every match; returns how many documents changed
    pub async fn update_many(&self, query: &Query, patch: &Patch) -> Result<usize> {
        self.check_patch(patch)?;
        let mut backend = self.backend.lock().await;
        let rows = backend.scan(&self.schema, query)?;
        let updated = rows
            .into_iter()
            .map(|row| apply_patch::<T>(row, patch))
            .collect::<Result<Vec<_>>>()?;

        backend.replace(&self.schema, &updated)?;
        Ok(updated.len())
    }

    /// Patch the first match; `false` when nothing matched
    pub async fn update_one(&self, query: &Query, patch: &Patch) -> Result<bool> {
        self.check_patch(patch)?;
        let mut backend = self.backend.lock().await;
        let Some(row) = backend.scan(&self.schema, query)?.into_iter().next() else {
            return Ok(false);
        };

        let updated = apply_patch::<T>(row, patch)?;
        backend.replace(&self.schema, std::slice::from_ref(&updated))?;
        Ok(true)
    }

    /// Patch one document and return its new state
    pub async fn find_by_id_and_update(
        &self,
        id: DocumentId,
        patch: &Patch,
    ) -> Result<Option<Document<T>>> {
        self.check_patch(patch)?;
        let mut backend = self.backend.lock().await;
        let Some(row) = backend.get(&self.schema, id.0)? else {
            return Ok(None);
        };

        let updated = apply_patch::<T>(row, patch)?;
        backend.replace(&self.schema, std::slice::from_ref(&updated))?;
        from_stored(updated).map(Some)
    }

    pub async fn delete_many(&self, query: &Query) -> Result<usize> {
        let mut backend = self.backend.lock().await;
        let ids: Vec<i64> = backend
            .scan(&self.schema, query)?
            .iter()
            .map(|row| row.id)
            .collect();
        backend.delete(&self.schema, &ids)
    }

    pub async fn delete_one(&self, query: &Query) -> Result<bool> {
        let mut backend = self.backend.lock().await;
        let Some(row) = backend.scan(&self.schema, query)?.into_iter().next() else {
            return Ok(false);
        };
        Ok(backend.delete(&self.schema, &[row.id])? > 0)
    }

    /// Remove one document and return what it held
    pub async fn find_by_id_and_delete(&self, id: DocumentId) -> Result<Option<Document<T>>> {
        let mut backend = self.backend.lock().await;
        let Some(row) = backend.get(&self.schema, id.0)? else {
            return Ok(None);
        };
        backend.delete(&self.schema, &[row.id])?;
        from_stored(row).map(Some)
    }

    pub async fn count(&self, query: &Query) -> Result<usize> {
        Ok(self.backend.lock().await.scan(&self.schema, query)?.len())
    }

    pub async fn clear(&self) -> Result<()> {
        self.backend.lock().await.clear(&self.schema)?;
        tracing::debug!("Cleared collection {}", self.schema.collection());
        Ok(())
    }

    /// Swap the whole collection for `records` in one write; on error nothing changes
    pub async fn replace_all(&self, records: Vec<T>) -> Result<Vec<Document<T>>> {
        let now = now_millis();
        let pending = records
            .iter()
            .map(|data| {
                Ok(PendingDocument {
                    created_at: now,
                    updated_at: now,
                    body: to_body(data)?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        let ids = self.backend.lock().await.reset(&self.schema, &pending)?;
        tracing::debug!(
            "Replaced {} with {} documents",
            self.schema.collection(),
            ids.len()
        );

        Ok(ids
            .into_iter()
            .zip(records)
            .map(|(id, data)| Document {
                id: DocumentId(id),
                created_at: now,
                updated_at: now,
                data,
            })
            .collect())
    }

    fn check_patch(&self, patch: &Patch) -> Result<()> {
        if let Some(field) = patch.fields().find(|field| self.schema.field(field).is_none()) {
            return Err(Error::InvalidInput(format!(
                "{} has no field {field}",
                self.schema.collection()
            )));
        }
        Ok(())
    }
}

fn to_body<T: Serialize>(data: &T) -> Result<Map<String, Value>> {
    match serde_json::to_value(data)? {
        Value::Object(body) => Ok(body),
        other => Err(Error::InvalidInput(format!(
            "records must serialize to a JSON object, got {other}"
        ))),
    }
}

fn from_stored<T: Record>(row: StoredDocument) -> Result<Document<T>> {
    Ok(Document {
        id: DocumentId(row.id),
        created_at: row.created_at,
        updated_at: row.updated_at,
        data: serde_json::from_value(Value::Object(row.body))?,
    })
}

/// Merge `patch` into a stored body, re-typing through `T` so the stored
/// form stays canonical.
fn apply_patch<T: Record>(mut row: StoredDocument, patch: &Patch) -> Result<StoredDocument> {
    patch.apply_to(&mut row.body);
    let data: T = serde_json::from_value(Value::Object(row.body))?;
    row.body = to_body(&data)?;
    row.updated_at = now_millis().max(row.updated_at);
    Ok(row)
}

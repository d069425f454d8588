//! Persistence substrate seam for the document store

use serde_json::{Map, Value};

use super::query::Query;
use super::schema::Schema;
use crate::error::Result;

/// A document as the substrate sees it: implicit fields plus a JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredDocument {
    pub id: i64,
    pub created_at: i64,
    pub updated_at: i64,
    pub body: Map<String, Value>,
}

/// A document awaiting its id
#[derive(Debug, Clone, PartialEq)]
pub struct PendingDocument {
    pub created_at: i64,
    pub updated_at: i64,
    pub body: Map<String, Value>,
}

/// Which kind of substrate backs a store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    /// Durable `SQLite` database
    Sqlite,
    /// Process-local memory, lost on exit
    Memory,
}

/// Storage operations a document store needs from its substrate.
///
/// Implementations enforce the schema's unique fields on every write and
/// must never hand out an id twice for the same collection. Calls are
/// serialized by the owning store, so `&mut self` is available for
/// transactions.
pub trait DocumentBackend: Send {
    fn kind(&self) -> BackendKind;

    /// Create or upgrade the table and indexes for a collection. Idempotent.
    fn ensure_collection(&mut self, schema: &Schema) -> Result<()>;

    /// Persist a new document and return its assigned id
    fn insert(&mut self, schema: &Schema, doc: &PendingDocument) -> Result<i64>;

    fn get(&mut self, schema: &Schema, id: i64) -> Result<Option<StoredDocument>>;

    /// Documents matching `query`, in insertion order
    fn scan(&mut self, schema: &Schema, query: &Query) -> Result<Vec<StoredDocument>>;

    /// Overwrite existing documents all-or-nothing
    fn replace(&mut self, schema: &Schema, docs: &[StoredDocument]) -> Result<()>;

    /// Remove documents by id, returning how many existed
    fn delete(&mut self, schema: &Schema, ids: &[i64]) -> Result<usize>;

    /// Remove every document; ids keep counting from where they were
    fn clear(&mut self, schema: &Schema) -> Result<()>;

    /// Swap the whole collection for `docs` all-or-nothing and return the new ids.
    /// On error the previous contents stay untouched.
    fn reset(&mut self, schema: &Schema, docs: &[PendingDocument]) -> Result<Vec<i64>>;
}

//! Storage backends behind the router
//!
//! A backend owns one connection and serves any number of logical databases on it.
//! Backends filter, sort and window queries themselves; projection and the
//! pipeline stages that cannot run as a query happen above them, in the router.

pub mod memory;
pub mod postgres;

pub use memory::MemoryBackend;
pub use postgres::PostgresBackend;

use async_trait::async_trait;
use serde_json::Value;

use super::connection::StorageError;
use super::options::{FindOptions, InsertOutcome, UpdateOutcome};

#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Logical database used when an operation names none
    fn default_database(&self) -> &str;

    /// Insert one document
    async fn insert_one(&self, db: &str, collection: &str, doc: Value) -> Result<InsertOutcome, StorageError>;

    /// Insert a batch; `ordered` stops at the first failure, otherwise every
    /// well-formed document is written and failures come back as `BulkWrite`
    async fn insert_many(
        &self,
        db: &str,
        collection: &str,
        docs: Vec<Value>,
        ordered: bool,
    ) -> Result<InsertOutcome, StorageError>;

    /// Matching documents, sorted, skipped and limited by `options`.
    ///
    /// Without sort keys the order is insertion order. The projection is not applied.
    async fn find(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
        options: &FindOptions,
    ) -> Result<Vec<Value>, StorageError>;

    async fn count(&self, db: &str, collection: &str, filter: &Value) -> Result<u64, StorageError>;

    async fn update(
        &self,
        db: &str,
        collection: &str,
        filter: &Value,
        update: &Value,
        multi: bool,
        upsert: bool,
    ) -> Result<UpdateOutcome, StorageError>;

    /// Returns the number of deleted documents
    async fn delete(&self, db: &str, collection: &str, filter: &Value, multi: bool) -> Result<u64, StorageError>;

    /// Release the underlying connection
    async fn close(&self) {}
}

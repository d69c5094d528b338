//! The `DocumentStore` trait — the storage boundary every service is built on.

use async_trait::async_trait;
use serde_json::Value;

use crate::{Document, DbError, WriteCondition};

/// Key-value store of JSON documents grouped into named collections.
///
/// Implementations must apply each `put`/`delete` atomically per
/// `(collection, key)`; writes to different keys never interfere.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Fetch a document. Absence is `Ok(None)`, not an error.
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, DbError>;

    /// Write `body` under `key` if `condition` holds and return the stored
    /// document with its new version.
    async fn put(
        &self,
        collection: &str,
        key: &str,
        body: Value,
        condition: WriteCondition,
    ) -> Result<Document, DbError>;

    /// Remove a document. Returns `false` when nothing was stored.
    async fn delete(&self, collection: &str, key: &str) -> Result<bool, DbError>;

    /// Every document of a collection, ordered by key.
    async fn list(&self, collection: &str) -> Result<Vec<Document>, DbError>;

    async fn exists(&self, collection: &str, key: &str) -> Result<bool, DbError> {
        Ok(self.get(collection, key).await?.is_some())
    }
}

//! In-process `DocumentStore` backed by ordered maps.
//!
//! A single `RwLock` guards all collections, so every write is trivially
//! atomic per key.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{DbError, Document, DocumentStore, WriteCondition};

#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Document>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, DbError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .and_then(|docs| docs.get(key))
            .cloned())
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        body: Value,
        condition: WriteCondition,
    ) -> Result<Document, DbError> {
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_owned()).or_default();

        let current = docs.get(key).map(|doc| doc.version);
        let version = condition.next_version(collection, key, current)?;

        let document = Document {
            collection: collection.to_owned(),
            key: key.to_owned(),
            version,
            body,
            updated_at: Utc::now(),
        };
        docs.insert(key.to_owned(), document.clone());

        debug!(collection, key, version, "document written");
        Ok(document)
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, DbError> {
        let mut collections = self.collections.write().await;
        Ok(collections
            .get_mut(collection)
            .map(|docs| docs.remove(key).is_some())
            .unwrap_or(false))
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, DbError> {
        let collections = self.collections.read().await;
        Ok(collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default())
    }
}

//! `DocumentStore` implementation on top of the Postgres repository functions.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use crate::repository::documents;
use crate::{DbError, DbPool, Document, DocumentStore, WriteCondition};

/// Postgres-backed document store. Cheap to clone (the pool is shared).
#[derive(Debug, Clone)]
pub struct PgDocumentStore {
    pool: DbPool,
}

impl PgDocumentStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Option<Document>, DbError> {
        let row = documents::get_document(&self.pool, collection, key).await?;
        Ok(row.map(Document::from))
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        body: Value,
        condition: WriteCondition,
    ) -> Result<Document, DbError> {
        let row = match condition {
            WriteCondition::Any => documents::upsert_document(&self.pool, collection, key, body).await?,
            WriteCondition::Absent => documents::insert_document(&self.pool, collection, key, body)
                .await?
                .ok_or_else(|| DbError::already_exists(collection, key))?,
            WriteCondition::Version(expected) => {
                let expected_db = i64::try_from(expected).unwrap_or(i64::MAX);
                match documents::update_document(&self.pool, collection, key, body, expected_db).await? {
                    Some(row) => row,
                    None => {
                        // Either the key vanished or someone else wrote first.
                        let current = documents::get_document(&self.pool, collection, key)
                            .await?
                            .map(Document::from);
                        return Err(match current {
                            None => DbError::not_found(collection, key),
                            Some(doc) => DbError::VersionConflict {
                                collection: collection.to_owned(),
                                key: key.to_owned(),
                                expected,
                                actual: doc.version,
                            },
                        });
                    }
                }
            }
        };

        debug!(collection, key, version = row.version, "document written");
        Ok(row.into())
    }

    async fn delete(&self, collection: &str, key: &str) -> Result<bool, DbError> {
        documents::delete_document(&self.pool, collection, key).await
    }

    async fn list(&self, collection: &str) -> Result<Vec<Document>, DbError> {
        let rows = documents::list_documents(&self.pool, collection).await?;
        Ok(rows.into_iter().map(Document::from).collect())
    }
}

//! Typed error type for the db crate.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("document '{collection}/{key}' not found")]
    NotFound { collection: String, key: String },

    #[error("document '{collection}/{key}' already exists")]
    AlreadyExists { collection: String, key: String },

    #[error("version conflict on '{collection}/{key}': expected {expected}, found {actual}")]
    VersionConflict {
        collection: String,
        key: String,
        expected: u64,
        actual: u64,
    },

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl DbError {
    pub(crate) fn not_found(collection: &str, key: &str) -> Self {
        Self::NotFound {
            collection: collection.to_owned(),
            key: key.to_owned(),
        }
    }

    pub(crate) fn already_exists(collection: &str, key: &str) -> Self {
        Self::AlreadyExists {
            collection: collection.to_owned(),
            key: key.to_owned(),
        }
    }
}

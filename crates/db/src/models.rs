//! Document structs shared by every storage backend.
//!
//! These are *persistence* models — they carry no domain behaviour.
//! Domain types live in the `engine` crate and are serialised into `body`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use crate::DbError;

// ---------------------------------------------------------------------------
// documents
// ---------------------------------------------------------------------------

/// A stored JSON document together with its store-assigned version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub collection: String,
    pub key: String,
    /// Starts at 1 and is incremented by every successful write.
    pub version: u64,
    pub body: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

/// Row shape of the `documents` table.
#[derive(Debug, Clone, FromRow)]
pub struct DocumentRow {
    pub collection: String,
    pub key: String,
    pub version: i64,
    pub body: serde_json::Value,
    pub updated_at: DateTime<Utc>,
}

impl From<DocumentRow> for Document {
    fn from(row: DocumentRow) -> Self {
        Self {
            collection: row.collection,
            key: row.key,
            version: u64::try_from(row.version).unwrap_or_default(),
            body: row.body,
            updated_at: row.updated_at,
        }
    }
}

// ---------------------------------------------------------------------------
// write preconditions
// ---------------------------------------------------------------------------

/// Precondition attached to every write.
///
/// Each write is checked and applied atomically per `(collection, key)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteCondition {
    /// The key must not exist yet (create).
    Absent,
    /// The key must exist at exactly this version (optimistic update).
    Version(u64),
    /// Unconditional upsert.
    Any,
}

impl WriteCondition {
    /// Resolve the version the document will have after the write, given the
    /// version currently stored (if any).
    pub fn next_version(
        self,
        collection: &str,
        key: &str,
        current: Option<u64>,
    ) -> Result<u64, DbError> {
        match (self, current) {
            (Self::Absent, Some(_)) => Err(DbError::already_exists(collection, key)),
            (Self::Absent, None) => Ok(1),
            (Self::Version(_), None) => Err(DbError::not_found(collection, key)),
            (Self::Version(expected), Some(actual)) if expected != actual => {
                Err(DbError::VersionConflict {
                    collection: collection.to_owned(),
                    key: key.to_owned(),
                    expected,
                    actual,
                })
            }
            (Self::Version(_), Some(actual)) => Ok(actual + 1),
            (Self::Any, current) => Ok(current.unwrap_or(0) + 1),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absent_only_allows_new_keys() {
        assert_eq!(WriteCondition::Absent.next_version("c", "k", None).unwrap(), 1);
        assert!(matches!(
            WriteCondition::Absent.next_version("c", "k", Some(3)),
            Err(DbError::AlreadyExists { .. })
        ));
    }

    #[test]
    fn version_must_match_current() {
        assert_eq!(WriteCondition::Version(2).next_version("c", "k", Some(2)).unwrap(), 3);
        assert!(matches!(
            WriteCondition::Version(1).next_version("c", "k", Some(2)),
            Err(DbError::VersionConflict { expected: 1, actual: 2, .. })
        ));
        assert!(matches!(
            WriteCondition::Version(1).next_version("c", "k", None),
            Err(DbError::NotFound { .. })
        ));
    }

    #[test]
    fn any_upserts() {
        assert_eq!(WriteCondition::Any.next_version("c", "k", None).unwrap(), 1);
        assert_eq!(WriteCondition::Any.next_version("c", "k", Some(7)).unwrap(), 8);
    }
}

//! Document CRUD operations against the `documents` table.
//!
//! Each write is a single statement so the version check and the write are
//! applied atomically per `(collection, key)`.

use chrono::Utc;
use sqlx::PgPool;

use crate::{models::DocumentRow, DbError};

/// Fetch a single document by collection and key.
pub async fn get_document(
    pool: &PgPool,
    collection: &str,
    key: &str,
) -> Result<Option<DocumentRow>, DbError> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT collection, key, version, body, updated_at
        FROM documents
        WHERE collection = $1 AND key = $2
        "#,
    )
    .bind(collection)
    .bind(key)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Return every document of a collection ordered by key.
pub async fn list_documents(pool: &PgPool, collection: &str) -> Result<Vec<DocumentRow>, DbError> {
    let rows = sqlx::query_as::<_, DocumentRow>(
        r#"
        SELECT collection, key, version, body, updated_at
        FROM documents
        WHERE collection = $1
        ORDER BY key ASC
        "#,
    )
    .bind(collection)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Insert a document at version 1.
///
/// Returns `None` if the key is already taken.
pub async fn insert_document(
    pool: &PgPool,
    collection: &str,
    key: &str,
    body: serde_json::Value,
) -> Result<Option<DocumentRow>, DbError> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        INSERT INTO documents (collection, key, version, body, updated_at)
        VALUES ($1, $2, 1, $3, $4)
        ON CONFLICT (collection, key) DO NOTHING
        RETURNING collection, key, version, body, updated_at
        "#,
    )
    .bind(collection)
    .bind(key)
    .bind(body)
    .bind(Utc::now())
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Replace a document only if it is still at `expected_version`.
///
/// Returns `None` if the document is missing or has moved on.
pub async fn update_document(
    pool: &PgPool,
    collection: &str,
    key: &str,
    body: serde_json::Value,
    expected_version: i64,
) -> Result<Option<DocumentRow>, DbError> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        UPDATE documents
        SET body = $3, version = version + 1, updated_at = $4
        WHERE collection = $1 AND key = $2 AND version = $5
        RETURNING collection, key, version, body, updated_at
        "#,
    )
    .bind(collection)
    .bind(key)
    .bind(body)
    .bind(Utc::now())
    .bind(expected_version)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

/// Insert or overwrite a document, bumping its version.
pub async fn upsert_document(
    pool: &PgPool,
    collection: &str,
    key: &str,
    body: serde_json::Value,
) -> Result<DocumentRow, DbError> {
    let row = sqlx::query_as::<_, DocumentRow>(
        r#"
        INSERT INTO documents (collection, key, version, body, updated_at)
        VALUES ($1, $2, 1, $3, $4)
        ON CONFLICT (collection, key) DO UPDATE
        SET body = EXCLUDED.body,
            version = documents.version + 1,
            updated_at = EXCLUDED.updated_at
        RETURNING collection, key, version, body, updated_at
        "#,
    )
    .bind(collection)
    .bind(key)
    .bind(body)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(row)
}

/// Delete a document. Returns `true` if a row was removed.
pub async fn delete_document(pool: &PgPool, collection: &str, key: &str) -> Result<bool, DbError> {
    let result = sqlx::query("DELETE FROM documents WHERE collection = $1 AND key = $2")
        .bind(collection)
        .bind(key)
        .execute(pool)
        .await?;

    Ok(result.rows_affected() > 0)
}

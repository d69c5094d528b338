//! `db` crate — pure persistence layer.
//!
//! Treats storage as an opaque key-value store of JSON documents grouped into
//! collections.  Callers depend on the [`DocumentStore`] trait; two backends
//! ship here: [`MemoryStore`] (tests, one-shot CLI runs) and
//! [`PgDocumentStore`] (Postgres via sqlx).  No business logic lives here.

pub mod error;
pub mod memory;
pub mod models;
pub mod pool;
pub mod postgres;
pub mod repository;
pub mod store;

pub use error::DbError;
pub use memory::MemoryStore;
pub use models::{Document, WriteCondition};
pub use pool::DbPool;
pub use postgres::PgDocumentStore;
pub use store::DocumentStore;

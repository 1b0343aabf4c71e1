//! Durable job store backed by SurrealDB.
//!
//! This crate owns every persisted mutation of a job record. All
//! cross-worker coordination happens through the conditional operations in
//! [`JobStore`]: each is a single `UPDATE ... WHERE <expected state and
//! lease> RETURN AFTER` statement, so two concurrent callers with mutually
//! exclusive predicates can never both commit against the same record.
//!
//! # Features
//!
//! - `memory` (default): in-memory engine, used by tests
//! - `rocksdb`: persistent file-based engine

mod connection;
mod error;
mod jobs;
mod record;
mod schema;

pub use connection::{Database, StoreConfig, get_db, init_store, try_get_db};
pub use error::StoreError;
pub use jobs::{JobFilter, JobStore};
pub use schema::init_schema;

/// Initialize the store with the given configuration.
///
/// This should be called once at application startup.
pub async fn init(config: StoreConfig) -> Result<(), StoreError> {
    init_store(config).await?;
    init_schema().await?;
    Ok(())
}

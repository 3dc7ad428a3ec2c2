//! Durable persistence for hosts, samples, domains, alerts and tasks
//!
//! ## Design
//!
//! - **Trait-based**: the `Store` trait allows swapping implementations
//! - **Async**: every operation is async and borrows a connection only for its own duration
//! - **Guarded writes**: hysteresis flips, log appends and terminal task transitions are atomic
//!
//! ## Backends
//!
//! - **SQLite** (default): embedded database, see [`sqlite::SqliteStore`]
//! - **In-Memory**: no persistence, for tests or throwaway runs

pub mod backend;
pub mod error;
pub mod memory;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

use std::sync::Arc;

pub use backend::{HealthStatus, Store};
pub use error::{StoreError, StoreResult};
pub use memory::MemoryStore;

use crate::config::StorageConfig;

/// Open the store selected by the configuration
pub async fn open_store(config: &StorageConfig) -> StoreResult<Arc<dyn Store>> {
    match config {
        StorageConfig::None => Ok(Arc::new(MemoryStore::new())),

        #[cfg(feature = "storage-sqlite")]
        StorageConfig::Sqlite {
            path,
            max_connections,
        } => Ok(Arc::new(
            sqlite::SqliteStore::new(path, *max_connections).await?,
        )),

        #[cfg(not(feature = "storage-sqlite"))]
        StorageConfig::Sqlite { .. } => Err(StoreError::ConnectionFailed(
            "built without the storage-sqlite feature".to_string(),
        )),
    }
}

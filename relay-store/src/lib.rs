//! Relay Store - durable row storage for the Gemini chat relay.
//!
//! The conversation layer treats persistence as simple keyed row operations.
//! This crate provides that contract and two engines for it:
//! - SQLite, one file shared by every process that points at it
//! - In-memory, for tests and throwaway deployments
//!
//! ## Row Model
//!
//! ```text
//! table ─┬─ partition (conversation) ─┬─ sort 0 ── record (JSON)
//!        │                            ├─ sort 1 ── record
//!        │                            └─ ...
//!        └─ partition ...
//! ```
//!
//! Every write is atomic on its own; nothing spans more than one row except
//! the range deletes.

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod memory;
pub mod sqlite;
pub mod traits;

pub use memory::InMemoryRowStore;
pub use sqlite::SqliteRowStore;
pub use traits::{RangeQuery, Row, RowKey, RowSelector, RowStore};

use relay_common::config::{StorageBackend, StorageConfig};
use std::sync::Arc;

/// Build the row store selected in configuration.
pub fn create_row_store(config: &StorageConfig) -> relay_common::Result<Arc<dyn RowStore>> {
    match config.backend {
        StorageBackend::Sqlite => {
            let path = config.resolved_path();
            tracing::info!(path = %path.display(), "Opening SQLite row store");
            Ok(Arc::new(SqliteRowStore::new(&path)?))
        }
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory row store; conversations will not survive a restart");
            Ok(Arc::new(InMemoryRowStore::new()))
        }
    }
}

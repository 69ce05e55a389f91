//! Persistent storage for sync state.
//!
//! Architecture:
//! ```text
//! ┌──────────────┐   cursor per doc   ┌──────────────────┐
//! │ SyncClient   │ ─────────────────► │ dyn CursorStore  │
//! └──────────────┘                    └────────┬─────────┘
//!                                              │ Memory / RocksDB
//! ┌──────────────┐   updates, snaps   ┌────────┴─────────┐
//! │ SyncServer   │ ─────────────────► │ DocumentStore    │
//! │ (authority)  │ ◄── recover() ──── │ (RocksDB)        │
//! └──────────────┘                    └──────────────────┘
//!                                     CF "snapshots": full document state
//!                                     CF "updates"  : admitted updates by Rid
//!                                     CF "metadata" : per-document heads
//!                                     CF "cursors"  : client resume cursors
//! ```
//!
//! Reference: Kleppmann, Designing Data-Intensive Applications, Chapter 3

pub mod rocks;

pub use rocks::{DocumentMetadata, DocumentStore, StoreConfig};

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

use crate::rid::Rid;

/// Storage errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("document not found: {0}")]
    NotFound(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("compression error: {0}")]
    Compression(String),
    #[error("object id is {0} bytes, longer than a storage key allows")]
    KeyTooLong(usize),
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

/// Durable home for the per-document resume cursor.
///
/// Written after every applied update; read once when a document opens.
pub trait CursorStore: Send + Sync {
    fn load(&self, object_id: &str) -> Result<Option<Rid>, StoreError>;
    fn save(&self, object_id: &str, rid: Rid) -> Result<(), StoreError>;
    fn remove(&self, object_id: &str) -> Result<(), StoreError>;
}

/// Process-local cursor store. Cursors are lost on exit.
#[derive(Debug, Default)]
pub struct MemoryCursorStore {
    cursors: Mutex<HashMap<String, Rid>>,
}

impl MemoryCursorStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CursorStore for MemoryCursorStore {
    fn load(&self, object_id: &str) -> Result<Option<Rid>, StoreError> {
        let cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(cursors.get(object_id).copied())
    }

    fn save(&self, object_id: &str, rid: Rid) -> Result<(), StoreError> {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        cursors.insert(object_id.to_owned(), rid);
        Ok(())
    }

    fn remove(&self, object_id: &str) -> Result<(), StoreError> {
        let mut cursors = self.cursors.lock().unwrap_or_else(PoisonError::into_inner);
        cursors.remove(object_id);
        Ok(())
    }
}

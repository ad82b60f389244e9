//! Storage backend abstraction for durable checkpoints
//!
//! [`CheckpointStore`] is the only seam where checkpoint I/O happens. The
//! [`LazyCheckpointer`](crate::LazyCheckpointer) calls it from its background
//! flush task and on cache misses, never from `save_checkpoint`.
//!
//! ## Contract
//!
//! - `persist` writes a batch. Re-persisting an existing `checkpoint_id`
//!   overwrites it in place.
//! - `load` returns the stored record or `None`. Stores do not filter
//!   expired records; the checkpointer applies lazy expiry.
//! - `list_ids` returns ids for one session, oldest first, without loading
//!   payloads.
//! - `recover` gives a store the chance to replay a partially applied batch
//!   after a crash. Stores without a write-ahead log return nothing.
//!
//! ## Implementing a backend
//!
//! ```rust,no_run
//! use voiceflow_checkpoint::{CheckpointRecord, CheckpointStore, Result};
//! use async_trait::async_trait;
//!
//! #[derive(Debug)]
//! struct TableStore;
//!
//! #[async_trait]
//! impl CheckpointStore for TableStore {
//!     async fn persist(&self, records: &[CheckpointRecord]) -> Result<()> {
//!         // batch put keyed by (session_id, checkpoint_id)
//!         Ok(())
//!     }
//!
//!     async fn load(&self, session_id: &str, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
//!         Ok(None)
//!     }
//!
//!     async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<bool> {
//!         Ok(false)
//!     }
//!
//!     async fn list_ids(&self, session_id: &str) -> Result<Vec<String>> {
//!         Ok(Vec::new())
//!     }
//! }
//! ```

use crate::{error::Result, record::CheckpointRecord};
use async_trait::async_trait;

/// Durable storage for checkpoint records
#[async_trait]
pub trait CheckpointStore: Send + Sync + std::fmt::Debug {
    /// Write a batch of records
    async fn persist(&self, records: &[CheckpointRecord]) -> Result<()>;

    /// Load one record
    async fn load(&self, session_id: &str, checkpoint_id: &str)
        -> Result<Option<CheckpointRecord>>;

    /// Delete one record, returning whether it existed
    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<bool>;

    /// Checkpoint ids for a session, oldest first
    async fn list_ids(&self, session_id: &str) -> Result<Vec<String>>;

    /// Replay any batch left half-written by a previous process
    ///
    /// Returns the recovered records after they have been persisted.
    async fn recover(&self, _session_id: &str) -> Result<Vec<CheckpointRecord>> {
        Ok(Vec::new())
    }
}

//! # voiceflow-checkpoint - Session Snapshot Persistence
//!
//! Write-behind checkpointing for live voice calls. Saving a snapshot must
//! never stall a conversational turn, so this crate separates the
//! in-memory side (an LRU cache plus a write-ahead buffer) from durable
//! storage behind the [`CheckpointStore`] trait.
//!
//! ## Core Concepts
//!
//! ### 1. LazyCheckpointer
//!
//! [`LazyCheckpointer`] is owned by one session:
//!
//! - **`save_checkpoint()`** - memory only, returns immediately
//! - **`get_checkpoint()`** - cache, then unflushed buffer, then store
//! - **`flush()` / `close()`** - drain the buffer and persist the cache
//! - **`start()`** - recover ids from storage and spawn the flush task
//!
//! ### 2. CheckpointStore
//!
//! Durable backends implement [`CheckpointStore`]:
//!
//! - [`InMemoryCheckpointStore`] - tests and single-process development
//! - [`FileCheckpointStore`] - JSON files with a per-session write-ahead log
//!
//! ### 3. CheckpointRecord
//!
//! [`CheckpointRecord`] is the persisted shape: session id as partition key,
//! checkpoint id as sort key, the state and metadata maps, an ISO-8601
//! timestamp and a TTL in epoch seconds. Expired records read as absent.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use voiceflow_checkpoint::{CheckpointerConfig, InMemoryCheckpointStore, LazyCheckpointer};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let store = Arc::new(InMemoryCheckpointStore::new());
//!     let checkpointer = LazyCheckpointer::new("call-123", store, CheckpointerConfig::default());
//!     checkpointer.start().await?;
//!
//!     checkpointer.save_checkpoint("cp_1", json!({"node": "greeting"}), json!({}));
//!     let latest = checkpointer.get_latest_checkpoint().await?;
//!     assert!(latest.is_some());
//!
//!     checkpointer.close().await?;
//!     Ok(())
//! }
//! ```

pub mod cache;
pub mod error;
pub mod file;
pub mod lazy;
pub mod memory;
pub mod record;
pub mod serializer;
pub mod traits;

pub use cache::{CacheMetrics, LruCache};
pub use error::{CheckpointError, Result};
pub use file::FileCheckpointStore;
pub use lazy::{CheckpointerConfig, CheckpointerStats, LazyCheckpointer};
pub use memory::InMemoryCheckpointStore;
pub use record::{clamp_ttl_days, CheckpointRecord, DEFAULT_TTL_DAYS, MAX_TTL_DAYS};
pub use serializer::{JsonSerializer, SerializerProtocol};
pub use traits::CheckpointStore;

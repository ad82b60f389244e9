//! In-memory checkpoint store for development and testing
//!
//! [`InMemoryCheckpointStore`] keeps records in an `Arc<RwLock<HashMap>>`
//! keyed by session id. Clones share storage, so a test can hand one clone
//! to a checkpointer, drop it, and build a second checkpointer over another
//! clone to simulate a process restart.
//!
//! Two knobs exist purely for tests:
//!
//! - [`with_latency`](InMemoryCheckpointStore::with_latency) delays every
//!   operation, standing in for a slow durable backend.
//! - [`set_fail_writes`](InMemoryCheckpointStore::set_fail_writes) makes
//!   `persist` return a storage error.

use crate::{
    error::{CheckpointError, Result},
    record::CheckpointRecord,
    traits::CheckpointStore,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Records per session, in first-persisted order
type RecordStorage = Arc<RwLock<HashMap<String, Vec<CheckpointRecord>>>>;

/// In-memory checkpoint store
#[derive(Debug, Clone, Default)]
pub struct InMemoryCheckpointStore {
    storage: RecordStorage,
    latency: Option<Duration>,
    fail_writes: Arc<AtomicBool>,
    persist_calls: Arc<AtomicUsize>,
}

impl InMemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delay every operation by `latency`
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Make subsequent `persist` calls fail
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of `persist` batches received
    pub fn persist_calls(&self) -> usize {
        self.persist_calls.load(Ordering::SeqCst)
    }

    /// Total records across all sessions
    pub async fn record_count(&self) -> usize {
        self.storage.read().await.values().map(Vec::len).sum()
    }

    pub async fn clear(&self) {
        self.storage.write().await.clear();
    }

    async fn simulate_latency(&self) {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl CheckpointStore for InMemoryCheckpointStore {
    async fn persist(&self, records: &[CheckpointRecord]) -> Result<()> {
        self.simulate_latency().await;
        self.persist_calls.fetch_add(1, Ordering::SeqCst);

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Storage(
                "in-memory store configured to fail".to_string(),
            ));
        }

        let mut storage = self.storage.write().await;
        for record in records {
            let entries = storage.entry(record.session_id.clone()).or_default();
            match entries
                .iter_mut()
                .find(|existing| existing.checkpoint_id == record.checkpoint_id)
            {
                Some(existing) => *existing = record.clone(),
                None => entries.push(record.clone()),
            }
        }
        Ok(())
    }

    async fn load(
        &self,
        session_id: &str,
        checkpoint_id: &str,
    ) -> Result<Option<CheckpointRecord>> {
        self.simulate_latency().await;
        let storage = self.storage.read().await;
        Ok(storage.get(session_id).and_then(|entries| {
            entries
                .iter()
                .find(|record| record.checkpoint_id == checkpoint_id)
                .cloned()
        }))
    }

    async fn delete(&self, session_id: &str, checkpoint_id: &str) -> Result<bool> {
        self.simulate_latency().await;
        let mut storage = self.storage.write().await;
        let Some(entries) = storage.get_mut(session_id) else {
            return Ok(false);
        };
        let before = entries.len();
        entries.retain(|record| record.checkpoint_id != checkpoint_id);
        Ok(entries.len() != before)
    }

    async fn list_ids(&self, session_id: &str) -> Result<Vec<String>> {
        self.simulate_latency().await;
        let storage = self.storage.read().await;
        Ok(storage
            .get(session_id)
            .map(|entries| entries.iter().map(|r| r.checkpoint_id.clone()).collect())
            .unwrap_or_default())
    }
}

//! Lazy, write-behind checkpointer
//!
//! [`LazyCheckpointer`] makes `save_checkpoint` cheap enough to call on every
//! conversational turn. A save touches only memory:
//!
//! ```text
//! save_checkpoint ──► LRU cache (bounded, cache_max_size)
//!                 └─► WAL buffer ──(interval tick | batch_size reached)──► CheckpointStore::persist
//! ```
//!
//! The background task started by [`start`](LazyCheckpointer::start) is the
//! only place store writes happen during normal operation. [`flush`] and
//! [`close`] drain the buffer and persist the whole cache synchronously.
//!
//! On `start` the checkpointer asks the store to replay any half-written
//! batch and then loads the list of checkpoint ids, not their payloads, so
//! [`get_latest_checkpoint`](LazyCheckpointer::get_latest_checkpoint) works
//! straight after a restart while bodies load lazily on first access.
//!
//! [`flush`]: LazyCheckpointer::flush
//! [`close`]: LazyCheckpointer::close

use crate::{
    cache::{CacheMetrics, LruCache},
    error::Result,
    record::{clamp_ttl_days, CheckpointRecord, DEFAULT_TTL_DAYS},
    traits::CheckpointStore,
};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

fn default_cache_max_size() -> usize {
    1000
}

fn default_batch_size() -> usize {
    10
}

fn default_flush_interval_ms() -> u64 {
    100
}

fn default_ttl_days() -> u32 {
    DEFAULT_TTL_DAYS
}

fn default_index_max_size() -> usize {
    10_000
}

/// Checkpointer tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointerConfig {
    /// Maximum checkpoints held in memory
    #[serde(default = "default_cache_max_size")]
    pub cache_max_size: usize,

    /// WAL depth that triggers an early flush
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Background flush period
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,

    /// Retention for durable records, clamped to `1..=MAX_TTL_DAYS`
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,

    /// Checkpoint ids tracked in memory; older ids are looked up in the store
    #[serde(default = "default_index_max_size")]
    pub index_max_size: usize,
}

impl Default for CheckpointerConfig {
    fn default() -> Self {
        Self {
            cache_max_size: default_cache_max_size(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            ttl_days: default_ttl_days(),
            index_max_size: default_index_max_size(),
        }
    }
}

impl CheckpointerConfig {
    pub fn with_cache_max_size(mut self, size: usize) -> Self {
        self.cache_max_size = size;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn with_ttl_days(mut self, days: u32) -> Self {
        self.ttl_days = days;
        self
    }

    pub fn with_index_max_size(mut self, size: usize) -> Self {
        self.index_max_size = size;
        self
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn effective_ttl_days(&self) -> u32 {
        clamp_ttl_days(self.ttl_days)
    }
}

/// Point-in-time counters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CheckpointerStats {
    pub cache_size: usize,
    pub wal_depth: usize,
    pub known_checkpoints: usize,
    pub cache: CacheMetrics,
}

/// Save order of known checkpoint ids
///
/// Same tick scheme as [`LruCache`]. Bounded: once `max_size` is exceeded the
/// oldest ids are dropped and `truncated` is set, after which lookups fall
/// back to [`CheckpointStore::list_ids`].
#[derive(Debug)]
struct RecencyIndex {
    by_tick: BTreeMap<u64, String>,
    ticks: HashMap<String, u64>,
    next_tick: u64,
    max_size: usize,
    truncated: bool,
}

impl RecencyIndex {
    fn new(max_size: usize) -> Self {
        Self {
            by_tick: BTreeMap::new(),
            ticks: HashMap::new(),
            next_tick: 0,
            max_size: max_size.max(1),
            truncated: false,
        }
    }

    /// Mark `checkpoint_id` as the newest
    fn touch(&mut self, checkpoint_id: &str) {
        let tick = self.next_tick;
        self.next_tick += 1;
        if let Some(old) = self.ticks.insert(checkpoint_id.to_string(), tick) {
            self.by_tick.remove(&old);
        }
        self.by_tick.insert(tick, checkpoint_id.to_string());

        while self.ticks.len() > self.max_size {
            match self.by_tick.pop_first() {
                Some((_, evicted)) => {
                    self.ticks.remove(&evicted);
                    self.truncated = true;
                }
                None => break,
            }
        }
    }

    /// Record an id without moving one that is already known
    fn remember(&mut self, checkpoint_id: &str) {
        if !self.ticks.contains_key(checkpoint_id) {
            self.touch(checkpoint_id);
        }
    }

    fn remove(&mut self, checkpoint_id: &str) -> bool {
        match self.ticks.remove(checkpoint_id) {
            Some(tick) => {
                self.by_tick.remove(&tick);
                true
            }
            None => false,
        }
    }

    fn contains(&self, checkpoint_id: &str) -> bool {
        self.ticks.contains_key(checkpoint_id)
    }

    fn newest_first(&self) -> Vec<String> {
        self.by_tick.values().rev().cloned().collect()
    }

    fn len(&self) -> usize {
        self.ticks.len()
    }
}

#[derive(Debug)]
struct Buffers {
    cache: LruCache<CheckpointRecord>,
    wal: Vec<CheckpointRecord>,
    index: RecencyIndex,
}

impl Buffers {
    /// Newest unflushed copy of a checkpoint
    fn pending(&self, checkpoint_id: &str) -> Option<CheckpointRecord> {
        self.wal
            .iter()
            .rev()
            .find(|record| record.checkpoint_id == checkpoint_id)
            .cloned()
    }
}

#[derive(Debug)]
struct Shared {
    session_id: String,
    config: CheckpointerConfig,
    store: Arc<dyn CheckpointStore>,
    buffers: Mutex<Buffers>,
    batch_ready: Notify,
    // serializes drains so a close-time flush never interleaves with a tick
    flush_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn flush_wal(&self) -> Result<usize> {
        let _guard = self.flush_lock.lock().await;

        let batch = std::mem::take(&mut self.buffers.lock().wal);
        if batch.is_empty() {
            return Ok(0);
        }

        let count = batch.len();
        if let Err(e) = self.store.persist(&batch).await {
            // keep the batch ahead of anything saved meanwhile
            let mut buffers = self.buffers.lock();
            let newer = std::mem::replace(&mut buffers.wal, batch);
            buffers.wal.extend(newer);
            return Err(e);
        }
        debug!(session_id = %self.session_id, count, "Flushed checkpoint WAL");
        Ok(count)
    }
}

async fn run_flush_loop(shared: Arc<Shared>) {
    let mut ticker = tokio::time::interval(shared.config.flush_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = shared.batch_ready.notified() => {}
        }
        if let Err(e) = shared.flush_wal().await {
            warn!(session_id = %shared.session_id, error = %e, "Background checkpoint flush failed");
        }
    }
}

/// Write-behind checkpointer for one session
#[derive(Debug)]
pub struct LazyCheckpointer {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LazyCheckpointer {
    pub fn new(
        session_id: impl Into<String>,
        store: Arc<dyn CheckpointStore>,
        config: CheckpointerConfig,
    ) -> Self {
        let buffers = Buffers {
            cache: LruCache::new(config.cache_max_size),
            wal: Vec::new(),
            index: RecencyIndex::new(config.index_max_size),
        };
        Self {
            shared: Arc::new(Shared {
                session_id: session_id.into(),
                config,
                store,
                buffers: Mutex::new(buffers),
                batch_ready: Notify::new(),
                flush_lock: tokio::sync::Mutex::new(()),
            }),
            task: Mutex::new(None),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn config(&self) -> &CheckpointerConfig {
        &self.shared.config
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Recover from the store and launch the background flush task
    ///
    /// Calling `start` twice is a no-op.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Ok(());
        }

        let shared = &self.shared;
        let recovered = shared.store.recover(&shared.session_id).await?;
        let ids = shared.store.list_ids(&shared.session_id).await?;
        {
            let mut buffers = shared.buffers.lock();
            for id in &ids {
                buffers.index.remember(id);
            }
            for record in recovered {
                buffers.index.remember(&record.checkpoint_id);
                buffers.cache.insert(record.checkpoint_id.clone(), record);
            }
        }

        let handle = tokio::spawn(run_flush_loop(Arc::clone(shared)));
        *self.task.lock() = Some(handle);
        info!(
            session_id = %shared.session_id,
            known = self.stats().known_checkpoints,
            "Checkpointer started"
        );
        Ok(())
    }

    /// Record a checkpoint in memory and queue it for persistence
    ///
    /// Never waits on the store.
    pub fn save_checkpoint(
        &self,
        checkpoint_id: impl Into<String>,
        state: Value,
        metadata: Value,
    ) -> String {
        let checkpoint_id = checkpoint_id.into();
        let record = CheckpointRecord::new(
            self.shared.session_id.clone(),
            checkpoint_id.clone(),
            state,
            metadata,
            self.shared.config.effective_ttl_days(),
        );

        let batch_full = {
            let mut buffers = self.shared.buffers.lock();
            buffers.cache.insert(checkpoint_id.clone(), record.clone());
            buffers.index.touch(&checkpoint_id);
            buffers.wal.push(record);
            buffers.wal.len() >= self.shared.config.batch_size
        };

        if batch_full {
            self.shared.batch_ready.notify_one();
        }
        checkpoint_id
    }

    /// Fetch a checkpoint: cache, then unflushed WAL, then the store
    ///
    /// Expired records are reported as absent.
    pub async fn get_checkpoint(&self, checkpoint_id: &str) -> Result<Option<CheckpointRecord>> {
        let in_memory = {
            let mut buffers = self.shared.buffers.lock();
            match buffers.cache.get(checkpoint_id) {
                Some(record) => Some(record),
                None => {
                    let pending = buffers.pending(checkpoint_id);
                    if let Some(record) = &pending {
                        buffers.cache.insert(checkpoint_id.to_string(), record.clone());
                    }
                    pending
                }
            }
        };
        if let Some(record) = in_memory {
            if record.is_expired() {
                return Ok(None);
            }
            return Ok(Some(record));
        }

        let loaded = self
            .shared
            .store
            .load(&self.shared.session_id, checkpoint_id)
            .await?;

        match loaded {
            Some(record) if !record.is_expired() => {
                self.shared
                    .buffers
                    .lock()
                    .cache
                    .insert(checkpoint_id.to_string(), record.clone());
                Ok(Some(record))
            }
            Some(_) => {
                debug!(checkpoint_id, "Ignoring expired checkpoint");
                Ok(None)
            }
            None => Ok(None),
        }
    }

    /// Most recent checkpoint that still resolves
    pub async fn get_latest_checkpoint(&self) -> Result<Option<CheckpointRecord>> {
        Ok(self.list_checkpoints(1).await?.pop())
    }

    /// Up to `limit` checkpoints, newest first
    ///
    /// Ids dropped from the in-memory index are read from the store's list,
    /// after everything the index still tracks.
    pub async fn list_checkpoints(&self, limit: usize) -> Result<Vec<CheckpointRecord>> {
        let (ids, truncated) = {
            let buffers = self.shared.buffers.lock();
            (buffers.index.newest_first(), buffers.index.truncated)
        };

        let mut records = Vec::new();
        for checkpoint_id in &ids {
            if records.len() >= limit {
                return Ok(records);
            }
            if let Some(record) = self.get_checkpoint(checkpoint_id).await? {
                records.push(record);
            }
        }

        if truncated || ids.is_empty() {
            let stored = self.shared.store.list_ids(&self.shared.session_id).await?;
            for checkpoint_id in stored.iter().rev() {
                if records.len() >= limit {
                    break;
                }
                if self.shared.buffers.lock().index.contains(checkpoint_id) {
                    continue;
                }
                if let Some(record) = self.get_checkpoint(checkpoint_id).await? {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Remove a checkpoint from memory and durable storage
    pub async fn delete_checkpoint(&self, checkpoint_id: &str) -> Result<bool> {
        let in_memory = {
            let mut buffers = self.shared.buffers.lock();
            let cached = buffers.cache.remove(checkpoint_id).is_some();
            let queued = buffers.wal.len();
            buffers.wal.retain(|r| r.checkpoint_id != checkpoint_id);
            let indexed = buffers.index.remove(checkpoint_id);
            cached || queued != buffers.wal.len() || indexed
        };

        let stored = self
            .shared
            .store
            .delete(&self.shared.session_id, checkpoint_id)
            .await?;
        Ok(in_memory || stored)
    }

    /// Drain the WAL and persist every cached checkpoint
    pub async fn flush(&self) -> Result<()> {
        self.shared.flush_wal().await?;

        let _guard = self.shared.flush_lock.lock().await;
        let cached = self.shared.buffers.lock().cache.values();
        if !cached.is_empty() {
            self.shared.store.persist(&cached).await?;
        }
        Ok(())
    }

    /// Stop the background task and flush
    ///
    /// Safe to call without `start` and safe to call twice.
    pub async fn close(&self) -> Result<()> {
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            handle.abort();
            // an aborted task resolves with a cancellation error
            let _ = handle.await;
        }
        self.flush().await?;
        debug!(session_id = %self.shared.session_id, "Checkpointer closed");
        Ok(())
    }

    pub fn stats(&self) -> CheckpointerStats {
        let buffers = self.shared.buffers.lock();
        CheckpointerStats {
            cache_size: buffers.cache.len(),
            wal_depth: buffers.wal.len(),
            known_checkpoints: buffers.index.len(),
            cache: buffers.cache.metrics(),
        }
    }
}

impl Drop for LazyCheckpointer {
    fn drop(&mut self) {
        if let Some(handle) = self.task.lock().take() {
            handle.abort();
        }
    }
}

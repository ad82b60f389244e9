//! Priority task queue
//!
//! Every task of a session lives here. Ordering is by priority, then by
//! insertion (FIFO within a priority), using a `BinaryHeap` keyed on
//! `(priority, Reverse(seq))` with lazy deletion: heap entries that no
//! longer refer to a queued, pending task are skipped when popped.
//!
//! The interrupt path must be cheap, so the queue keeps two atomic
//! counters beside the heap. [`TaskQueue::has_pending_sync`] and
//! [`TaskQueue::has_interrupt_sync`] read them without taking the lock.
//!
//! Lookups never fail for unknown ids; they return `None` or `false`.
//! Persistence through a [`TaskStore`] is best-effort and only logged.

use crate::config::QueueConfig;
use crate::error::Result;
use crate::task::{Task, TaskPriority, TaskState};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::fs;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};
use voiceflow_checkpoint::file::validate_path_component;
use voiceflow_checkpoint::{JsonSerializer, SerializerProtocol};

/// Persisted form of a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub task_id: String,
    pub priority: u8,
    pub state: TaskState,
    /// The full task as JSON
    pub payload: Value,
}

impl TaskRecord {
    pub fn from_task(task: &Task) -> Result<Self> {
        Ok(Self {
            task_id: task.task_id.clone(),
            priority: task.priority.value(),
            state: task.state,
            payload: serde_json::to_value(task)?,
        })
    }

    pub fn into_task(self) -> Result<Task> {
        Ok(serde_json::from_value(self.payload)?)
    }
}

/// Durable storage for a session's tasks
#[async_trait]
pub trait TaskStore: Send + Sync + Debug {
    async fn save(&self, record: &TaskRecord) -> Result<()>;

    async fn delete(&self, task_id: &str) -> Result<bool>;

    async fn load_all(&self) -> Result<Vec<TaskRecord>>;
}

/// Task store for tests and single-process runs
#[derive(Debug, Clone, Default)]
pub struct InMemoryTaskStore {
    records: Arc<RwLock<HashMap<String, TaskRecord>>>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        self.records
            .write()
            .await
            .insert(record.task_id.clone(), record.clone());
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        Ok(self.records.write().await.remove(task_id).is_some())
    }

    async fn load_all(&self) -> Result<Vec<TaskRecord>> {
        Ok(self.records.read().await.values().cloned().collect())
    }
}

/// One JSON file per task: `{dir}/{task_id}.json`
#[derive(Debug, Clone)]
pub struct FileTaskStore {
    dir: PathBuf,
    serializer: JsonSerializer,
}

impl FileTaskStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            serializer: JsonSerializer::pretty(),
        }
    }

    /// `{root}/{session_id}/tasks`, beside the session's checkpoints
    pub fn for_session(root: &Path, session_id: &str) -> Result<Self> {
        validate_path_component("session_id", session_id)?;
        Ok(Self::new(root.join(session_id).join("tasks")))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn task_path(&self, task_id: &str) -> Result<PathBuf> {
        validate_path_component("task_id", task_id)?;
        Ok(self.dir.join(format!("{}.{}", task_id, self.serializer.extension())))
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save(&self, record: &TaskRecord) -> Result<()> {
        let path = self.task_path(&record.task_id)?;
        fs::create_dir_all(&self.dir).await?;
        fs::write(&path, self.serializer.dumps(record)?).await?;
        Ok(())
    }

    async fn delete(&self, task_id: &str) -> Result<bool> {
        let path = self.task_path(task_id)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn load_all(&self) -> Result<Vec<TaskRecord>> {
        let mut entries = match fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let suffix = format!(".{}", self.serializer.extension());
        let mut records = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !path.to_string_lossy().ends_with(&suffix) {
                continue;
            }
            let bytes = fs::read(&path).await?;
            match self.serializer.loads::<TaskRecord>(&bytes) {
                Ok(record) => records.push(record),
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable task file"),
            }
        }
        Ok(records)
    }
}

#[derive(Debug, PartialEq, Eq)]
struct HeapEntry {
    priority: TaskPriority,
    seq: Reverse<u64>,
    generation: u64,
    task_id: String,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.priority, self.seq).cmp(&(other.priority, other.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct Slot {
    seq: u64,
    task: Task,
    /// Has a live heap entry and is counted in `pending_count`
    queued: bool,
    generation: u64,
}

#[derive(Debug, Default)]
struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    slots: HashMap<String, Slot>,
    next_seq: u64,
}

impl QueueInner {
    fn push_heap(&mut self, task_id: &str) {
        if let Some(slot) = self.slots.get_mut(task_id) {
            slot.generation += 1;
            slot.queued = true;
            self.heap.push(HeapEntry {
                priority: slot.task.priority,
                seq: Reverse(slot.seq),
                generation: slot.generation,
                task_id: task_id.to_string(),
            });
        }
    }

    fn is_live(&self, entry: &HeapEntry) -> bool {
        self.slots.get(&entry.task_id).is_some_and(|slot| {
            slot.queued && slot.generation == entry.generation && slot.task.is_pending()
        })
    }

    /// Drop stale entries from the top of the heap
    fn prune_top(&mut self) {
        while let Some(top) = self.heap.peek() {
            if self.is_live(top) {
                break;
            }
            self.heap.pop();
        }
    }

    fn sorted(&self, filter: impl Fn(&Task) -> bool) -> Vec<Task> {
        let mut matching: Vec<&Slot> = self.slots.values().filter(|s| filter(&s.task)).collect();
        matching.sort_by_key(|s| (Reverse(s.task.priority), s.seq));
        matching.into_iter().map(|s| s.task.clone()).collect()
    }
}

/// Per-session priority queue of tasks
#[derive(Debug)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
    pending_count: AtomicUsize,
    interrupt_count: AtomicUsize,
    config: QueueConfig,
    store: Option<Arc<dyn TaskStore>>,
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new(QueueConfig::default())
    }
}

impl TaskQueue {
    pub fn new(config: QueueConfig) -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
            pending_count: AtomicUsize::new(0),
            interrupt_count: AtomicUsize::new(0),
            config,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    fn count_in(&self, priority: TaskPriority) {
        self.pending_count.fetch_add(1, Ordering::SeqCst);
        if priority == TaskPriority::Interrupt {
            self.interrupt_count.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn count_out(&self, priority: TaskPriority) {
        let _ = self
            .pending_count
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if priority == TaskPriority::Interrupt {
            let _ = self
                .interrupt_count
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        }
    }

    async fn persist(&self, task: &Task) {
        let Some(store) = &self.store else {
            return;
        };
        let result = match TaskRecord::from_task(task) {
            Ok(record) => store.save(&record).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            warn!(task_id = %task.task_id, error = %e, "Failed to persist task");
        }
    }

    async fn forget(&self, task_ids: &[String]) {
        let Some(store) = &self.store else {
            return;
        };
        for task_id in task_ids {
            if let Err(e) = store.delete(task_id).await {
                warn!(task_id = %task_id, error = %e, "Failed to remove persisted task");
            }
        }
    }

    /// Evict up to one batch of terminal tasks, oldest first
    fn cleanup_terminal(&self, inner: &mut QueueInner) -> Vec<String> {
        let mut terminal: Vec<(u64, String)> = inner
            .slots
            .iter()
            .filter(|(_, slot)| slot.task.is_terminal())
            .map(|(id, slot)| (slot.seq, id.clone()))
            .collect();
        terminal.sort();

        let evicted: Vec<String> = terminal
            .into_iter()
            .take(self.config.cleanup_batch)
            .map(|(_, id)| id)
            .collect();
        for id in &evicted {
            inner.slots.remove(id);
        }
        if !evicted.is_empty() {
            debug!(count = evicted.len(), "Evicted terminal tasks");
        }
        evicted
    }

    /// Add a task, returning its id
    pub async fn enqueue(&self, task: Task) -> String {
        let task_id = task.task_id.clone();
        let evicted = {
            let mut inner = self.inner.lock().await;
            let evicted = if inner.slots.len() >= self.config.max_size {
                self.cleanup_terminal(&mut inner)
            } else {
                Vec::new()
            };

            if let Some(old) = inner.slots.remove(&task_id) {
                if old.queued {
                    self.count_out(old.task.priority);
                }
            }

            let seq = inner.next_seq;
            inner.next_seq += 1;
            let pending = task.is_pending();
            let priority = task.priority;
            inner.slots.insert(
                task_id.clone(),
                Slot {
                    seq,
                    task: task.clone(),
                    queued: false,
                    generation: 0,
                },
            );
            if pending {
                inner.push_heap(&task_id);
                self.count_in(priority);
            }
            evicted
        };

        debug!(task_id = %task_id, priority = ?task.priority, "Task enqueued");
        self.forget(&evicted).await;
        self.persist(&task).await;
        task_id
    }

    /// Pop the highest-priority pending task
    ///
    /// The task stays visible through [`get_by_id`](Self::get_by_id).
    pub async fn dequeue(&self) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        inner.prune_top();
        let entry = inner.heap.pop()?;
        let slot = inner.slots.get_mut(&entry.task_id)?;
        slot.queued = false;
        let task = slot.task.clone();
        drop(inner);

        self.count_out(task.priority);
        debug!(task_id = %task.task_id, "Task dequeued");
        Some(task)
    }

    pub async fn peek(&self) -> Option<Task> {
        let mut inner = self.inner.lock().await;
        inner.prune_top();
        let top = inner.heap.peek()?;
        inner.slots.get(&top.task_id).map(|slot| slot.task.clone())
    }

    /// Replace a stored task, keeping the counters and heap in step
    ///
    /// Returns `false` for an unknown task.
    pub async fn update(&self, task: Task) -> bool {
        {
            let mut inner = self.inner.lock().await;
            let Some(slot) = inner.slots.get_mut(&task.task_id) else {
                return false;
            };

            let was_queued = slot.queued;
            let was_pending = slot.task.is_pending();
            let old_priority = slot.task.priority;
            let now_pending = task.is_pending();
            slot.task = task.clone();

            if was_queued && !now_pending {
                slot.queued = false;
                self.count_out(old_priority);
            } else if was_queued && old_priority != task.priority {
                self.count_out(old_priority);
                inner.push_heap(&task.task_id);
                self.count_in(task.priority);
            } else if !was_queued && now_pending && !was_pending {
                inner.push_heap(&task.task_id);
                self.count_in(task.priority);
            }
        }
        self.persist(&task).await;
        true
    }

    pub async fn remove(&self, task_id: &str) -> Option<Task> {
        let slot = {
            let mut inner = self.inner.lock().await;
            inner.slots.remove(task_id)?
        };
        if slot.queued {
            self.count_out(slot.task.priority);
        }
        self.forget(&[task_id.to_string()]).await;
        Some(slot.task)
    }

    pub async fn get_by_id(&self, task_id: &str) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner.slots.get(task_id).map(|slot| slot.task.clone())
    }

    /// Pending, in-progress and paused tasks, by priority then insertion
    pub async fn get_all_pending(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner.sorted(|task| task.is_pending() || task.state == TaskState::Paused)
    }

    pub async fn get_paused(&self) -> Vec<Task> {
        let inner = self.inner.lock().await;
        inner.sorted(|task| task.state == TaskState::Paused)
    }

    /// First in-progress task in insertion order
    pub async fn get_current_task(&self) -> Option<Task> {
        let inner = self.inner.lock().await;
        inner
            .slots
            .values()
            .filter(|slot| slot.task.state == TaskState::InProgress)
            .min_by_key(|slot| slot.seq)
            .map(|slot| slot.task.clone())
    }

    /// Pause an in-progress task at its current plan step
    pub async fn pause_task(&self, task_id: &str, reason: Option<String>) -> bool {
        let Some(mut task) = self.get_by_id(task_id).await else {
            return false;
        };
        let step = task
            .plan
            .as_ref()
            .and_then(|plan| plan.get_current_step())
            .map(|step| step.step_type.clone());
        if task.pause(step, reason).is_err() {
            return false;
        }
        self.update(task).await
    }

    pub async fn resume_task(&self, task_id: &str) -> bool {
        let Some(mut task) = self.get_by_id(task_id).await else {
            return false;
        };
        if task.resume().is_err() {
            return false;
        }
        self.update(task).await
    }

    /// O(1), lock-free
    pub fn has_pending_sync(&self) -> bool {
        self.pending_count.load(Ordering::SeqCst) > 0
    }

    /// O(1), lock-free
    pub fn has_interrupt_sync(&self) -> bool {
        self.interrupt_count.load(Ordering::SeqCst) > 0
    }

    pub fn pending_count(&self) -> usize {
        self.pending_count.load(Ordering::SeqCst)
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.slots.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.lock().await.slots.is_empty()
    }

    /// Reload tasks from the store, oldest first; returns how many
    pub async fn recover(&self) -> usize {
        let Some(store) = &self.store else {
            return 0;
        };
        let records = match store.load_all().await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Failed to load persisted tasks");
                return 0;
            }
        };

        let mut tasks: Vec<Task> = records
            .into_iter()
            .filter_map(|record| {
                let task_id = record.task_id.clone();
                record
                    .into_task()
                    .map_err(|e| warn!(task_id = %task_id, error = %e, "Skipping corrupt task"))
                    .ok()
            })
            .collect();
        tasks.sort_by_key(|task| task.created_at);

        let mut inner = self.inner.lock().await;
        let mut recovered = 0;
        for task in tasks {
            if inner.slots.contains_key(&task.task_id) {
                continue;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            let task_id = task.task_id.clone();
            let pending = task.is_pending();
            let priority = task.priority;
            inner.slots.insert(
                task_id.clone(),
                Slot {
                    seq,
                    task,
                    queued: false,
                    generation: 0,
                },
            );
            if pending {
                inner.push_heap(&task_id);
                self.count_in(priority);
            }
            recovered += 1;
        }
        debug!(recovered, "Recovered tasks from store");
        recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intent::Intent;
    use tempfile::TempDir;

    fn task(intent: Intent, priority: TaskPriority) -> Task {
        Task::new(intent, "", priority)
    }

    #[tokio::test]
    async fn test_priority_then_fifo() {
        let queue = TaskQueue::default();
        let a = queue.enqueue(task(Intent::Book, TaskPriority::Normal)).await;
        let b = queue.enqueue(task(Intent::Faq, TaskPriority::High)).await;
        let c = queue.enqueue(task(Intent::Cancel, TaskPriority::Normal)).await;

        assert_eq!(queue.peek().await.unwrap().task_id, b);
        assert_eq!(queue.dequeue().await.unwrap().task_id, b);
        assert_eq!(queue.dequeue().await.unwrap().task_id, a);
        assert_eq!(queue.dequeue().await.unwrap().task_id, c);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_dequeued_task_stays_visible() {
        let queue = TaskQueue::default();
        let id = queue.enqueue(task(Intent::Book, TaskPriority::Normal)).await;
        queue.dequeue().await.unwrap();

        assert!(!queue.has_pending_sync());
        assert!(queue.get_by_id(&id).await.is_some());
    }

    #[tokio::test]
    async fn test_counters_follow_state_changes() {
        let queue = TaskQueue::default();
        let mut t = task(Intent::Handover, TaskPriority::Interrupt);
        let id = queue.enqueue(t.clone()).await;
        assert!(queue.has_pending_sync());
        assert!(queue.has_interrupt_sync());

        t.start().unwrap();
        queue.update(t.clone()).await;
        assert_eq!(queue.pending_count(), 1);

        assert!(queue.pause_task(&id, Some("switch".into())).await);
        assert!(!queue.has_pending_sync());
        assert!(!queue.has_interrupt_sync());

        assert!(queue.resume_task(&id).await);
        assert!(queue.has_pending_sync());
        assert!(queue.has_interrupt_sync());
        assert_eq!(queue.dequeue().await.unwrap().task_id, id);
        assert!(queue.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_lazy_deletion_skips_completed() {
        let queue = TaskQueue::default();
        let mut first = task(Intent::Book, TaskPriority::High);
        queue.enqueue(first.clone()).await;
        let second = queue.enqueue(task(Intent::Faq, TaskPriority::Low)).await;

        first.start().unwrap();
        first.complete().unwrap();
        queue.update(first).await;

        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.dequeue().await.unwrap().task_id, second);
    }

    #[tokio::test]
    async fn test_unknown_ids_are_noops() {
        let queue = TaskQueue::default();
        assert!(!queue.update(task(Intent::Book, TaskPriority::Low)).await);
        assert!(!queue.pause_task("missing", None).await);
        assert!(!queue.resume_task("missing").await);
        assert!(queue.remove("missing").await.is_none());
        assert!(queue.get_current_task().await.is_none());
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest_terminal() {
        let queue = TaskQueue::new(QueueConfig {
            max_size: 3,
            cleanup_batch: 10,
        });
        let mut done = task(Intent::Book, TaskPriority::Normal);
        done.cancel().unwrap();
        let done_id = queue.enqueue(done).await;
        queue.enqueue(task(Intent::Faq, TaskPriority::Normal)).await;
        queue.enqueue(task(Intent::Faq, TaskPriority::Normal)).await;

        queue.enqueue(task(Intent::Cancel, TaskPriority::Normal)).await;
        assert_eq!(queue.len().await, 3);
        assert!(queue.get_by_id(&done_id).await.is_none());

        // nothing terminal left: soft capacity is exceeded instead
        queue.enqueue(task(Intent::Cancel, TaskPriority::Normal)).await;
        assert_eq!(queue.len().await, 4);
    }

    #[tokio::test]
    async fn test_all_pending_includes_paused() {
        let queue = TaskQueue::default();
        let mut paused = task(Intent::Book, TaskPriority::Normal);
        paused.start().unwrap();
        paused.pause(None, None).unwrap();
        queue.enqueue(paused).await;
        queue.enqueue(task(Intent::Faq, TaskPriority::High)).await;

        let all = queue.get_all_pending().await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].intent, Intent::Faq);
        assert_eq!(queue.get_paused().await.len(), 1);
    }

    #[tokio::test]
    async fn test_current_task_is_first_in_progress() {
        let queue = TaskQueue::default();
        let mut a = task(Intent::Book, TaskPriority::Low);
        a.start().unwrap();
        let mut b = task(Intent::Faq, TaskPriority::High);
        b.start().unwrap();
        let a_id = queue.enqueue(a).await;
        queue.enqueue(b).await;

        assert_eq!(queue.get_current_task().await.unwrap().task_id, a_id);
    }

    #[tokio::test]
    async fn test_recover_from_memory_store() {
        let store = InMemoryTaskStore::new();
        let queue = TaskQueue::default().with_store(Arc::new(store.clone()));
        let id = queue.enqueue(task(Intent::Book, TaskPriority::High)).await;
        assert_eq!(store.len().await, 1);

        let restarted = TaskQueue::default().with_store(Arc::new(store.clone()));
        assert_eq!(restarted.recover().await, 1);
        assert!(restarted.has_pending_sync());
        assert_eq!(restarted.dequeue().await.unwrap().task_id, id);
    }

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let store = FileTaskStore::for_session(dir.path(), "call-1").unwrap();
        let t = task(Intent::Cancel, TaskPriority::Normal);
        let record = TaskRecord::from_task(&t).unwrap();

        store.save(&record).await.unwrap();
        let loaded = store.load_all().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].priority, 1);
        assert_eq!(loaded[0].clone().into_task().unwrap(), t);

        assert!(store.delete(&t.task_id).await.unwrap());
        assert!(store.load_all().await.unwrap().is_empty());
    }

    #[test]
    fn test_file_store_rejects_bad_session() {
        assert!(FileTaskStore::for_session(Path::new("/tmp"), "../x").is_err());
    }
}

//! Per-call session: the one mutable context every node receives
//!
//! A [`Session`] owns everything a call accumulates:
//!
//! ```text
//! Session
//! ├── WorkingMemory      conversation history + working variables
//! ├── TaskQueue          every task of the call, priority ordered
//! ├── LazyCheckpointer   write-behind snapshots
//! ├── WorkflowState      node cursor, interrupt flags, errors
//! ├── StepTracker        named call steps
//! ├── DynamicVariables   call context from the init API (set once)
//! └── background tasks   named tokio handles, aborted on close
//! ```
//!
//! Sessions are never shared between calls. Two sessions built from the same
//! id still get their own queue and checkpointer.

use crate::config::Settings;
use crate::dynamic_vars::DynamicVariables;
use crate::error::{Result, WorkflowError};
use crate::intent::Intent;
use crate::llm::LlmMessage;
use crate::memory::{Role, WorkingMemory};
use crate::queue::{TaskQueue, TaskStore};
use crate::task::{Task, TaskPriority};
use crate::workflow_state::{StashedResponse, StepTracker, WorkflowState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;
use voiceflow_checkpoint::{CheckpointStore, LazyCheckpointer};

/// Output of a background task: workflow variables to merge on completion
pub type BackgroundOutput = Result<Map<String, Value>>;

#[derive(Serialize)]
struct SnapshotRef<'a> {
    session_id: &'a str,
    working_memory: &'a WorkingMemory,
    workflow_state: &'a WorkflowState,
    step_tracker: &'a StepTracker,
    dynamic_vars: Option<&'a DynamicVariables>,
    timestamp: String,
}

#[derive(Deserialize)]
struct Snapshot {
    working_memory: WorkingMemory,
    workflow_state: WorkflowState,
    #[serde(default)]
    step_tracker: StepTracker,
    #[serde(default)]
    dynamic_vars: Option<DynamicVariables>,
}

#[derive(Debug)]
pub struct Session {
    session_id: String,
    settings: Settings,
    working_memory: WorkingMemory,
    queue: TaskQueue,
    checkpointer: LazyCheckpointer,
    workflow_state: WorkflowState,
    step_tracker: StepTracker,
    dynamic_vars: Option<DynamicVariables>,
    background: HashMap<String, JoinHandle<BackgroundOutput>>,
    created_at: DateTime<Utc>,
    started: bool,
    /// Suffix for generated checkpoint ids
    checkpoint_seq: AtomicU64,
}

impl Session {
    /// New session with a random id
    pub fn new(settings: &Settings) -> Result<Self> {
        Self::with_id(Uuid::new_v4().to_string(), settings)
    }

    /// New session with stores chosen by `settings`
    pub fn with_id(session_id: impl Into<String>, settings: &Settings) -> Result<Self> {
        let session_id = session_id.into();
        let task_store = settings.task_store(&session_id)?;
        let checkpoint_store = settings.checkpoint_store();
        Ok(Self::with_stores(
            session_id,
            settings,
            checkpoint_store,
            task_store,
        ))
    }

    pub fn with_stores(
        session_id: impl Into<String>,
        settings: &Settings,
        checkpoint_store: Arc<dyn CheckpointStore>,
        task_store: Arc<dyn TaskStore>,
    ) -> Self {
        let session_id = session_id.into();
        Self {
            working_memory: WorkingMemory::new(
                session_id.clone(),
                settings.max_conversation_messages,
            ),
            queue: TaskQueue::new(settings.queue.clone()).with_store(task_store),
            checkpointer: LazyCheckpointer::new(
                session_id.clone(),
                checkpoint_store,
                settings.checkpoint.clone(),
            ),
            workflow_state: WorkflowState::new(session_id.clone()),
            step_tracker: StepTracker::new(),
            dynamic_vars: None,
            background: HashMap::new(),
            created_at: Utc::now(),
            started: false,
            checkpoint_seq: AtomicU64::new(0),
            settings: settings.clone(),
            session_id,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn working_memory(&self) -> &WorkingMemory {
        &self.working_memory
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    pub fn checkpointer(&self) -> &LazyCheckpointer {
        &self.checkpointer
    }

    pub fn workflow_state(&self) -> &WorkflowState {
        &self.workflow_state
    }

    pub fn workflow_state_mut(&mut self) -> &mut WorkflowState {
        &mut self.workflow_state
    }

    pub fn step_tracker(&self) -> &StepTracker {
        &self.step_tracker
    }

    pub fn dynamic_vars(&self) -> Option<&DynamicVariables> {
        self.dynamic_vars.as_ref()
    }

    // Lifecycle

    /// Start the checkpointer and recover persisted tasks
    ///
    /// Storage failures are logged; the call proceeds without recovery.
    pub async fn start(&mut self) {
        if self.started {
            return;
        }
        if let Err(e) = self.checkpointer.start().await {
            warn!(session_id = %self.session_id, error = %e, "Checkpointer recovery failed");
        }
        let recovered = self.queue.recover().await;
        self.started = true;
        self.workflow_state.started_at = Some(Utc::now());
        info!(session_id = %self.session_id, recovered_tasks = recovered, "Session started");
    }

    /// Abort background work, snapshot, and flush everything to storage
    pub async fn close(&mut self) {
        for (name, handle) in self.background.drain() {
            handle.abort();
            debug!(name = %name, "Aborted background task");
        }
        self.save_checkpoint(Some("session_close"), None);
        if let Err(e) = self.checkpointer.close().await {
            warn!(session_id = %self.session_id, error = %e, "Checkpointer close failed");
        }
        self.started = false;
        info!(session_id = %self.session_id, "Session closed");
    }

    // Dynamic variables

    /// Set the call context; only the first call takes effect
    pub fn set_dynamic_variables(&mut self, variables: DynamicVariables) -> bool {
        if self.dynamic_vars.is_some() {
            warn!(session_id = %self.session_id, "Dynamic variables already set, ignoring");
            return false;
        }
        for (key, value) in variables.to_context_map() {
            self.working_memory.set_variable(format!("dyn_{}", key), value);
        }
        self.dynamic_vars = Some(variables);
        true
    }

    pub fn get_dynamic_variable(&self, key: &str) -> Option<Value> {
        self.dynamic_vars.as_ref().and_then(|vars| vars.get(key))
    }

    // Conversation

    pub fn add_user_message(&mut self, content: impl Into<String>) -> String {
        self.working_memory
            .add_message(Role::User, content, Map::new())
    }

    pub fn add_assistant_message(&mut self, content: impl Into<String>) -> String {
        self.working_memory
            .add_message(Role::Assistant, content, Map::new())
    }

    pub fn add_tool_message(&mut self, content: impl Into<String>, tool_name: Option<&str>) -> String {
        let mut metadata = Map::new();
        if let Some(name) = tool_name {
            metadata.insert("tool_name".into(), json!(name));
        }
        self.working_memory.add_message(Role::Tool, content, metadata)
    }

    pub fn get_llm_messages(&self, max_messages: Option<usize>) -> Vec<LlmMessage> {
        self.working_memory.get_conversation_history(max_messages)
    }

    // Tasks

    /// Build a task, enqueue it and record it in the workflow view
    pub async fn create_task(
        &mut self,
        intent: Intent,
        original_input: impl Into<String>,
        priority: TaskPriority,
    ) -> Task {
        let task = Task::new(intent, original_input, priority).with_session(self.session_id.clone());
        self.queue.enqueue(task.clone()).await;
        self.workflow_state.queue_task(task.task_id.clone());
        debug!(task_id = %task.task_id, intent = %intent, "Task created");
        task
    }

    pub async fn get_current_task(&self) -> Option<Task> {
        self.queue.get_current_task().await
    }

    pub async fn get_task(&self, task_id: &str) -> Option<Task> {
        self.queue.get_by_id(task_id).await
    }

    pub async fn update_task(&self, task: Task) -> bool {
        self.queue.update(task).await
    }

    /// Mark a task in progress; `Ok(None)` for an unknown id
    pub async fn start_task(&mut self, task_id: &str) -> Result<Option<Task>> {
        let Some(mut task) = self.queue.get_by_id(task_id).await else {
            return Ok(None);
        };
        task.start()?;
        self.queue.update(task.clone()).await;
        self.workflow_state.current_task_id = Some(task_id.to_string());
        Ok(Some(task))
    }

    pub async fn complete_task(&mut self, task_id: &str) -> Result<Option<Task>> {
        let Some(mut task) = self.queue.get_by_id(task_id).await else {
            return Ok(None);
        };
        task.complete()?;
        self.queue.update(task.clone()).await;
        self.workflow_state.complete_task(task_id);
        if self.workflow_state.current_task_id.as_deref() == Some(task_id) {
            self.workflow_state.current_task_id = None;
        }
        Ok(Some(task))
    }

    pub async fn fail_task(&mut self, task_id: &str, error: impl Into<String>) -> Result<Option<Task>> {
        let Some(mut task) = self.queue.get_by_id(task_id).await else {
            return Ok(None);
        };
        let error = error.into();
        task.fail(error.clone())?;
        self.queue.update(task.clone()).await;
        self.workflow_state.add_error(error, None);
        Ok(Some(task))
    }

    /// Pause at the task's current plan step
    pub async fn pause_task(&mut self, task_id: &str, reason: Option<String>) -> bool {
        let paused = self.queue.pause_task(task_id, reason).await;
        if paused && self.workflow_state.current_task_id.as_deref() == Some(task_id) {
            self.workflow_state.current_task_id = None;
        }
        paused
    }

    pub async fn resume_task(&mut self, task_id: &str) -> bool {
        let resumed = self.queue.resume_task(task_id).await;
        if resumed {
            self.workflow_state.current_task_id = Some(task_id.to_string());
        }
        resumed
    }

    pub fn has_pending_tasks_sync(&self) -> bool {
        self.queue.has_pending_sync()
    }

    pub fn has_interrupt_sync(&self) -> bool {
        self.queue.has_interrupt_sync()
    }

    // Workflow position and variables

    pub fn move_to_node(&mut self, node_id: impl Into<String>) {
        self.workflow_state.move_to_node(node_id);
    }

    pub fn get_current_node(&self) -> Option<&str> {
        self.workflow_state.current_node_id.as_deref()
    }

    /// Set in the workflow state and mirrored into working memory
    pub fn set_workflow_variable(&mut self, key: impl Into<String>, value: Value) {
        let key = key.into();
        self.working_memory.set_variable(key.clone(), value.clone());
        self.workflow_state.set_variable(key, value);
    }

    pub fn get_workflow_variable(&self, key: &str) -> Option<&Value> {
        self.workflow_state.get_variable(key)
    }

    pub fn add_error(&mut self, error: impl Into<String>, node_id: Option<&str>) {
        self.workflow_state.add_error(error, node_id);
    }

    // Step tracking

    pub fn register_step(&mut self, step_id: impl Into<String>) {
        self.step_tracker.register_step(step_id);
    }

    pub fn start_step(&mut self, step_id: &str) {
        self.step_tracker.start_step(step_id);
    }

    pub fn complete_step(&mut self, step_id: &str, data: Option<Map<String, Value>>) {
        self.step_tracker.complete_step(step_id, data);
    }

    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.step_tracker.is_step_completed(step_id)
    }

    // Interrupt state

    pub fn is_interrupted(&self) -> bool {
        self.workflow_state.is_interrupted
    }

    pub fn stash_response(
        &mut self,
        content: impl Into<String>,
        interrupt_message: impl Into<String>,
    ) -> &StashedResponse {
        self.workflow_state.stash_response(content, interrupt_message)
    }

    pub fn stashed_response(&self) -> Option<&StashedResponse> {
        self.workflow_state.stashed_response.as_ref()
    }

    /// Clear the interrupt and return the continuation frame, if any
    pub fn take_stashed_context(&mut self) -> Option<String> {
        let max_chars = self.settings.interrupts.max_stash_chars;
        self.workflow_state
            .clear_interrupt()
            .and_then(|stash| stash.continuation_context(max_chars))
    }

    // Checkpointing

    /// Snapshot the session; returns the checkpoint id even on failure
    pub fn save_checkpoint(&self, checkpoint_id: Option<&str>, metadata: Option<Value>) -> String {
        let checkpoint_id = checkpoint_id.map(str::to_string).unwrap_or_else(|| {
            let seq = self.checkpoint_seq.fetch_add(1, Ordering::Relaxed);
            format!("cp_{}_{}", Utc::now().timestamp_micros(), seq)
        });

        let snapshot = SnapshotRef {
            session_id: &self.session_id,
            working_memory: &self.working_memory,
            workflow_state: &self.workflow_state,
            step_tracker: &self.step_tracker,
            dynamic_vars: self.dynamic_vars.as_ref(),
            timestamp: Utc::now().to_rfc3339(),
        };
        match serde_json::to_value(&snapshot) {
            Ok(state) => {
                let metadata = metadata.unwrap_or_else(|| json!({}));
                self.checkpointer
                    .save_checkpoint(checkpoint_id, state, metadata)
            }
            Err(e) => {
                warn!(checkpoint_id = %checkpoint_id, error = %e, "Failed to snapshot session");
                checkpoint_id
            }
        }
    }

    /// Restore a snapshot; on any failure the session is left untouched
    pub async fn restore_from_checkpoint(&mut self, checkpoint_id: &str) -> bool {
        let record = match self.checkpointer.get_checkpoint(checkpoint_id).await {
            Ok(Some(record)) => record,
            Ok(None) => return false,
            Err(e) => {
                warn!(checkpoint_id = %checkpoint_id, error = %e, "Failed to load checkpoint");
                return false;
            }
        };

        let snapshot: Snapshot = match serde_json::from_value(record.state) {
            Ok(snapshot) => snapshot,
            Err(e) => {
                warn!(checkpoint_id = %checkpoint_id, error = %e, "Corrupt checkpoint state");
                return false;
            }
        };

        self.working_memory = snapshot.working_memory;
        self.workflow_state = snapshot.workflow_state;
        self.step_tracker = snapshot.step_tracker;
        self.dynamic_vars = snapshot.dynamic_vars;
        info!(checkpoint_id = %checkpoint_id, "Session restored");
        true
    }

    // Background tasks

    /// Run `future` on the runtime under `name`
    ///
    /// A task already registered under the same name is aborted first.
    pub fn spawn_background<F>(&mut self, name: impl Into<String>, future: F)
    where
        F: Future<Output = BackgroundOutput> + Send + 'static,
    {
        let name = name.into();
        if let Some(previous) = self.background.insert(name.clone(), tokio::spawn(future)) {
            previous.abort();
        }
        debug!(name = %name, "Spawned background task");
    }

    pub fn has_background(&self, name: &str) -> bool {
        self.background.contains_key(name)
    }

    /// Await a named task and merge its variables into the workflow state
    ///
    /// `None` when nothing is registered under `name`.
    pub async fn background_result(&mut self, name: &str) -> Option<BackgroundOutput> {
        let handle = self.background.remove(name)?;
        let output = match handle.await {
            Ok(output) => output,
            Err(e) => Err(WorkflowError::External(format!(
                "background task {} did not finish: {}",
                name, e
            ))),
        };
        self.merge_background(name, &output);
        Some(output)
    }

    /// Collect every finished background task without waiting on the rest
    pub async fn harvest_background(&mut self) -> usize {
        let finished: Vec<String> = self
            .background
            .iter()
            .filter(|(_, handle)| handle.is_finished())
            .map(|(name, _)| name.clone())
            .collect();
        for name in &finished {
            self.background_result(name).await;
        }
        finished.len()
    }

    fn merge_background(&mut self, name: &str, output: &BackgroundOutput) {
        match output {
            Ok(vars) => {
                for (key, value) in vars {
                    self.set_workflow_variable(key.clone(), value.clone());
                }
            }
            Err(e) => warn!(name = %name, error = %e, "Background task failed"),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for handle in self.background.values() {
            handle.abort();
        }
    }
}

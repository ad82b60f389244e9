//! Execution cursor, step tracking and stashed responses
//!
//! [`WorkflowState`] records where a call is in the graph and carries the
//! interrupt flags. [`StepTracker`] keeps named per-session steps so a call
//! can pick up where it left off after a restore. [`StashedResponse`] holds
//! agent output that was cut short by the caller talking over it.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use uuid::Uuid;

/// Characters of stashed content embedded in a continuation by default
pub const DEFAULT_MAX_STASH_CHARS: usize = 1000;

/// Partial agent output interrupted by the caller
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StashedResponse {
    pub stash_id: String,
    #[serde(default)]
    pub content: String,
    pub node_id: Option<String>,
    pub step_id: Option<String>,
    #[serde(default)]
    pub tokens_generated: usize,
    #[serde(default)]
    pub was_streaming: bool,
    pub started_at: Option<DateTime<Utc>>,
    pub interrupted_at: DateTime<Utc>,
    pub interrupt_message: Option<String>,
    #[serde(default = "default_include")]
    pub include_in_continuation: bool,
}

fn default_include() -> bool {
    true
}

impl StashedResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            stash_id: Uuid::new_v4().simple().to_string()[..8].to_string(),
            content: content.into(),
            node_id: None,
            step_id: None,
            tokens_generated: 0,
            was_streaming: false,
            started_at: None,
            interrupted_at: Utc::now(),
            interrupt_message: None,
            include_in_continuation: true,
        }
    }

    pub fn with_node(mut self, node_id: Option<String>) -> Self {
        self.node_id = node_id;
        self
    }

    pub fn with_step(mut self, step_id: Option<String>) -> Self {
        self.step_id = step_id;
        self
    }

    pub fn with_interrupt_message(mut self, message: impl Into<String>) -> Self {
        self.interrupt_message = Some(message.into());
        self
    }

    pub fn streaming(mut self, tokens_generated: usize, started_at: DateTime<Utc>) -> Self {
        self.was_streaming = true;
        self.tokens_generated = tokens_generated;
        self.started_at = Some(started_at);
        self
    }

    /// Continuation frame with the default content bound
    pub fn get_continuation_context(&self) -> Option<String> {
        self.continuation_context(DEFAULT_MAX_STASH_CHARS)
    }

    /// Frame the partial output and the interruption for the next LLM call
    ///
    /// `None` when there is nothing to continue from.
    pub fn continuation_context(&self, max_chars: usize) -> Option<String> {
        if !self.include_in_continuation || self.content.is_empty() {
            return None;
        }
        let content: String = self.content.chars().take(max_chars).collect();
        let message = self.interrupt_message.as_deref().unwrap_or_default();
        Some(format!(
            "[You were in the middle of saying: \"{}...\" when the user interrupted with: \"{}\". Address their new message appropriately.]",
            content, message
        ))
    }

    pub fn is_older_than(&self, max_age_ms: u64, now: DateTime<Utc>) -> bool {
        let max_age = i64::try_from(max_age_ms).unwrap_or(i64::MAX);
        now - self.interrupted_at > ChronoDuration::milliseconds(max_age)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    NotStarted,
    InProgress,
    Completed,
    Skipped,
    Failed,
}

/// Named steps of a call, in registration order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepTracker {
    pub steps: HashMap<String, StepStatus>,
    pub step_data: HashMap<String, Map<String, Value>>,
    pub step_order: Vec<String>,
    pub current_step: Option<String>,
    pub current_step_index: usize,
    pub step_timestamps: HashMap<String, DateTime<Utc>>,
}

impl StepTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Idempotent: re-registering keeps the existing status
    pub fn register_step(&mut self, step_id: impl Into<String>) {
        let step_id = step_id.into();
        if self.steps.contains_key(&step_id) {
            return;
        }
        self.steps.insert(step_id.clone(), StepStatus::NotStarted);
        self.step_data.insert(step_id.clone(), Map::new());
        self.step_order.push(step_id);
    }

    pub fn start_step(&mut self, step_id: &str) {
        self.register_step(step_id);
        self.steps.insert(step_id.to_string(), StepStatus::InProgress);
        self.current_step = Some(step_id.to_string());
        self.step_timestamps.insert(step_id.to_string(), Utc::now());
        if let Some(index) = self.step_order.iter().position(|s| s == step_id) {
            self.current_step_index = index;
        }
    }

    pub fn complete_step(&mut self, step_id: &str, data: Option<Map<String, Value>>) {
        self.register_step(step_id);
        self.steps.insert(step_id.to_string(), StepStatus::Completed);
        if let Some(data) = data.filter(|d| !d.is_empty()) {
            self.step_data.insert(step_id.to_string(), data);
        }
    }

    pub fn fail_step(&mut self, step_id: &str, error: Option<&str>) {
        self.register_step(step_id);
        self.steps.insert(step_id.to_string(), StepStatus::Failed);
        if let Some(error) = error {
            self.step_data
                .entry(step_id.to_string())
                .or_default()
                .insert("error".to_string(), json!(error));
        }
    }

    pub fn skip_step(&mut self, step_id: &str, reason: Option<&str>) {
        self.register_step(step_id);
        self.steps.insert(step_id.to_string(), StepStatus::Skipped);
        if let Some(reason) = reason {
            self.step_data
                .entry(step_id.to_string())
                .or_default()
                .insert("skip_reason".to_string(), json!(reason));
        }
    }

    pub fn status(&self, step_id: &str) -> Option<StepStatus> {
        self.steps.get(step_id).copied()
    }

    pub fn is_step_completed(&self, step_id: &str) -> bool {
        self.status(step_id) == Some(StepStatus::Completed)
    }

    /// Unknown steps count as pending
    pub fn is_step_pending(&self, step_id: &str) -> bool {
        matches!(
            self.status(step_id),
            None | Some(StepStatus::NotStarted | StepStatus::InProgress)
        )
    }

    /// First pending step at or after the current position
    pub fn get_next_pending_step(&self) -> Option<&str> {
        self.step_order
            .iter()
            .skip(self.current_step_index)
            .find(|step_id| self.is_step_pending(step_id))
            .map(String::as_str)
    }

    pub fn get_step_data(&self, step_id: &str) -> Option<&Map<String, Value>> {
        self.step_data.get(step_id)
    }

    /// Completed and skipped over registered; 0.0 when nothing is registered
    pub fn get_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 0.0;
        }
        let done = self
            .steps
            .values()
            .filter(|s| matches!(s, StepStatus::Completed | StepStatus::Skipped))
            .count();
        done as f64 / self.steps.len() as f64
    }

    /// Completed step ids in registration order
    pub fn get_completed_steps(&self) -> Vec<&str> {
        self.step_order
            .iter()
            .filter(|id| self.is_step_completed(id))
            .map(String::as_str)
            .collect()
    }

    pub fn reset(&mut self) {
        for status in self.steps.values_mut() {
            *status = StepStatus::NotStarted;
        }
        self.current_step = None;
        self.current_step_index = 0;
    }
}

/// Per-session execution cursor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowState {
    pub state_id: String,
    #[serde(default)]
    pub session_id: String,

    pub current_node_id: Option<String>,
    pub previous_node_id: Option<String>,
    #[serde(default)]
    pub node_history: Vec<String>,

    #[serde(default)]
    pub variables: Map<String, Value>,

    pub current_task_id: Option<String>,
    #[serde(default)]
    pub task_queue: Vec<String>,
    #[serde(default)]
    pub completed_tasks: Vec<String>,

    #[serde(default)]
    pub is_interrupted: bool,
    pub stashed_response: Option<StashedResponse>,
    pub pending_interrupt: Option<String>,

    #[serde(default)]
    pub errors: Vec<Value>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default = "default_include")]
    pub is_active: bool,
    #[serde(default)]
    pub is_completed: bool,
}

impl WorkflowState {
    pub fn new(session_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            state_id: Uuid::new_v4().to_string(),
            session_id: session_id.into(),
            current_node_id: None,
            previous_node_id: None,
            node_history: Vec::new(),
            variables: Map::new(),
            current_task_id: None,
            task_queue: Vec::new(),
            completed_tasks: Vec::new(),
            is_interrupted: false,
            stashed_response: None,
            pending_interrupt: None,
            errors: Vec::new(),
            last_error: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            is_active: true,
            is_completed: false,
        }
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Revisiting a node appends to the history again
    pub fn move_to_node(&mut self, node_id: impl Into<String>) {
        let node_id = node_id.into();
        self.previous_node_id = self.current_node_id.take();
        self.current_node_id = Some(node_id.clone());
        self.node_history.push(node_id);
        self.touch();
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
        self.touch();
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }

    /// Stash partial output and raise the interrupt flag
    pub fn stash_response(
        &mut self,
        content: impl Into<String>,
        interrupt_message: impl Into<String>,
    ) -> &StashedResponse {
        let interrupt_message = interrupt_message.into();
        let stash = StashedResponse::new(content)
            .with_node(self.current_node_id.clone())
            .with_interrupt_message(interrupt_message.clone());
        self.is_interrupted = true;
        self.pending_interrupt = Some(interrupt_message);
        self.touch();
        self.stashed_response.insert(stash)
    }

    /// Reset the interrupt flags, handing back whatever was stashed
    pub fn clear_interrupt(&mut self) -> Option<StashedResponse> {
        self.is_interrupted = false;
        self.pending_interrupt = None;
        self.touch();
        self.stashed_response.take()
    }

    /// Defaults the node to the current one
    pub fn add_error(&mut self, error: impl Into<String>, node_id: Option<&str>) {
        let error = error.into();
        let node_id = node_id
            .map(str::to_string)
            .or_else(|| self.current_node_id.clone());
        self.errors.push(json!({
            "error": error,
            "node_id": node_id,
            "timestamp": Utc::now().to_rfc3339(),
        }));
        self.last_error = Some(error);
        self.touch();
    }

    pub fn queue_task(&mut self, task_id: impl Into<String>) {
        let task_id = task_id.into();
        if !self.task_queue.contains(&task_id) {
            self.task_queue.push(task_id);
            self.touch();
        }
    }

    pub fn dequeue_task(&mut self) -> Option<String> {
        if self.task_queue.is_empty() {
            return None;
        }
        self.touch();
        Some(self.task_queue.remove(0))
    }

    pub fn complete_task(&mut self, task_id: &str) {
        self.task_queue.retain(|id| id != task_id);
        self.completed_tasks.push(task_id.to_string());
        self.touch();
    }

    pub fn mark_completed(&mut self) {
        self.is_active = false;
        self.is_completed = true;
        self.completed_at = Some(Utc::now());
        self.touch();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_continuation_frame() {
        let stash = StashedResponse::new("Hello I was about to").with_interrupt_message("wait stop");
        assert_eq!(
            stash.get_continuation_context().unwrap(),
            "[You were in the middle of saying: \"Hello I was about to...\" when the user interrupted with: \"wait stop\". Address their new message appropriately.]"
        );
    }

    #[test]
    fn test_continuation_absent_when_empty_or_excluded() {
        assert!(StashedResponse::new("").get_continuation_context().is_none());

        let mut stash = StashedResponse::new("partial");
        stash.include_in_continuation = false;
        assert!(stash.get_continuation_context().is_none());
    }

    #[test]
    fn test_continuation_truncates() {
        let stash = StashedResponse::new("abcdefghij").with_interrupt_message("hi");
        let context = stash.continuation_context(4).unwrap();
        assert!(context.contains("\"abcd...\""));
        assert!(!context.contains("abcde"));
    }

    #[test]
    fn test_stash_age() {
        let stash = StashedResponse::new("x");
        let later = stash.interrupted_at + ChronoDuration::milliseconds(31_000);
        assert!(stash.is_older_than(30_000, later));
        assert!(!stash.is_older_than(30_000, stash.interrupted_at));
    }

    #[test]
    fn test_stash_age_saturates_huge_limits() {
        let stash = StashedResponse::new("x");
        let later = stash.interrupted_at + ChronoDuration::days(365);
        assert!(!stash.is_older_than(u64::MAX, later));
    }

    #[test]
    fn test_move_to_node_keeps_history() {
        let mut state = WorkflowState::new("s1");
        state.move_to_node("a");
        state.move_to_node("b");
        state.move_to_node("a");

        assert_eq!(state.current_node_id.as_deref(), Some("a"));
        assert_eq!(state.previous_node_id.as_deref(), Some("b"));
        assert_eq!(state.node_history, vec!["a", "b", "a"]);
    }

    #[test]
    fn test_stash_and_clear() {
        let mut state = WorkflowState::new("s1");
        state.move_to_node("greeting_routing_agent");
        let stash_id = state.stash_response("We have openings", "stop").stash_id.clone();

        assert!(state.is_interrupted);
        assert_eq!(state.pending_interrupt.as_deref(), Some("stop"));
        let stash = state.clear_interrupt().unwrap();
        assert_eq!(stash.stash_id, stash_id);
        assert_eq!(stash.node_id.as_deref(), Some("greeting_routing_agent"));
        assert!(!state.is_interrupted);
        assert!(state.clear_interrupt().is_none());
    }

    #[test]
    fn test_task_bookkeeping() {
        let mut state = WorkflowState::new("s1");
        state.queue_task("t1");
        state.queue_task("t2");
        state.queue_task("t1");
        assert_eq!(state.task_queue, vec!["t1", "t2"]);

        assert_eq!(state.dequeue_task().as_deref(), Some("t1"));
        state.complete_task("t2");
        assert!(state.task_queue.is_empty());
        assert_eq!(state.completed_tasks, vec!["t2"]);
        assert!(state.dequeue_task().is_none());
    }

    #[test]
    fn test_add_error_defaults_node() {
        let mut state = WorkflowState::new("s1");
        state.move_to_node("transformation_tool");
        state.add_error("boom", None);
        state.add_error("bang", Some("fallback_agent"));

        assert_eq!(state.errors[0]["node_id"], "transformation_tool");
        assert_eq!(state.errors[1]["node_id"], "fallback_agent");
        assert_eq!(state.last_error.as_deref(), Some("bang"));
    }

    #[test]
    fn test_step_tracker_flow() {
        let mut tracker = StepTracker::new();
        assert_eq!(tracker.get_progress(), 0.0);

        tracker.register_step("greet");
        tracker.register_step("collect_service");
        tracker.register_step("confirm");
        tracker.register_step("greet");
        assert_eq!(tracker.step_order.len(), 3);

        tracker.start_step("greet");
        tracker.complete_step("greet", None);
        assert_eq!(tracker.get_next_pending_step(), Some("collect_service"));

        tracker.skip_step("collect_service", Some("already known"));
        assert_eq!(tracker.get_next_pending_step(), Some("confirm"));
        assert!((tracker.get_progress() - 2.0 / 3.0).abs() < 1e-9);
        assert_eq!(tracker.get_completed_steps(), vec!["greet"]);
        assert_eq!(
            tracker.get_step_data("collect_service").unwrap()["skip_reason"],
            "already known"
        );

        tracker.fail_step("confirm", Some("declined"));
        assert!(!tracker.is_step_pending("confirm"));
        assert!(tracker.is_step_pending("never_registered"));

        tracker.reset();
        assert!(tracker.is_step_pending("greet"));
        assert_eq!(tracker.get_next_pending_step(), Some("greet"));
    }

    #[test]
    fn test_workflow_state_serde() {
        let mut state = WorkflowState::new("s1");
        state.move_to_node("a");
        state.stash_response("partial", "hey");
        let json = serde_json::to_value(&state).unwrap();
        let restored: WorkflowState = serde_json::from_value(json).unwrap();
        assert_eq!(restored, state);
    }
}

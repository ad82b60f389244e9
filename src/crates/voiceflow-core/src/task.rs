//! Tasks, plans and steps
//!
//! A [`Task`] is one caller intent ("book a haircut") together with the
//! [`TaskPlan`] that fulfils it. Tasks move through a small state machine:
//!
//! ```text
//! pending ──► in_progress ──► completed | failed
//!                 ▲   │
//!                 │   ▼
//!               paused
//!
//! any non-terminal state ──► cancelled
//! ```
//!
//! Transition methods return [`WorkflowError::InvalidTransition`] and leave
//! the task untouched when the move is not allowed.

use crate::error::{Result, WorkflowError};
use crate::intent::Intent;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use uuid::Uuid;

/// Execution state shared by tasks and plan steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskState::Completed | TaskState::Failed | TaskState::Cancelled
        )
    }

    /// Pending in the queue sense: waiting or actively being worked on
    pub fn is_pending(&self) -> bool {
        matches!(self, TaskState::Pending | TaskState::InProgress)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        use TaskState::*;
        match (self, next) {
            (Pending, InProgress) => true,
            (InProgress, Completed | Failed | Paused) => true,
            (Paused, InProgress) => true,
            (from, Cancelled) => !from.is_terminal(),
            _ => false,
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Pending => "pending",
            TaskState::InProgress => "in_progress",
            TaskState::Paused => "paused",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
            TaskState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Queue priority; interrupts jump ahead of everything else
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum TaskPriority {
    Low = 0,
    #[default]
    Normal = 1,
    High = 2,
    Interrupt = 3,
}

impl TaskPriority {
    pub fn value(&self) -> u8 {
        *self as u8
    }

    pub fn from_value(value: u8) -> Self {
        match value {
            0 => TaskPriority::Low,
            1 => TaskPriority::Normal,
            2 => TaskPriority::High,
            _ => TaskPriority::Interrupt,
        }
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..8].to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_retries() -> u32 {
    3
}

/// A single step in a task plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub step_id: String,
    pub step_name: String,
    /// `collect_service`, `collect_therapist`, `check_availability`, ...
    pub step_type: String,
    pub state: TaskState,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub input_data: Map<String, Value>,
    #[serde(default)]
    pub output_data: Map<String, Value>,
    #[serde(default = "default_true")]
    pub required: bool,
    pub order: usize,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    pub error: Option<String>,
    /// Step id to fall back to when this one fails
    pub fallback_step: Option<String>,
}

impl TaskStep {
    pub fn new(step_name: impl Into<String>, step_type: impl Into<String>) -> Self {
        Self {
            step_id: short_id(),
            step_name: step_name.into(),
            step_type: step_type.into(),
            state: TaskState::Pending,
            started_at: None,
            completed_at: None,
            input_data: Map::new(),
            output_data: Map::new(),
            required: true,
            order: 0,
            retry_count: 0,
            max_retries: default_max_retries(),
            error: None,
            fallback_step: None,
        }
    }

    pub fn with_input(mut self, input: Map<String, Value>) -> Self {
        self.input_data = input;
        self
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }

    pub fn with_fallback(mut self, step_id: impl Into<String>) -> Self {
        self.fallback_step = Some(step_id.into());
        self
    }

    pub fn mark_started(&mut self) {
        self.state = TaskState::InProgress;
        self.started_at = Some(Utc::now());
    }

    /// An empty output leaves previously collected output in place
    pub fn mark_completed(&mut self, output: Option<Map<String, Value>>) {
        self.state = TaskState::Completed;
        self.completed_at = Some(Utc::now());
        if let Some(output) = output.filter(|o| !o.is_empty()) {
            self.output_data = output;
        }
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.state = TaskState::Failed;
        self.error = Some(error.into());
        self.retry_count += 1;
        self.completed_at = Some(Utc::now());
    }

    pub fn can_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn is_completed(&self) -> bool {
        self.state == TaskState::Completed
    }

    pub fn is_pending(&self) -> bool {
        self.state == TaskState::Pending
    }
}

/// Ordered execution plan for a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub plan_id: String,
    pub steps: Vec<TaskStep>,
    pub current_step_index: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Default for TaskPlan {
    fn default() -> Self {
        Self::new()
    }
}

impl TaskPlan {
    pub fn new() -> Self {
        let now = Utc::now();
        Self {
            plan_id: short_id(),
            steps: Vec::new(),
            current_step_index: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Append a step, assigning its order from its position
    pub fn add_step(&mut self, mut step: TaskStep) -> &TaskStep {
        step.order = self.steps.len();
        self.steps.push(step);
        self.updated_at = Utc::now();
        &self.steps[self.steps.len() - 1]
    }

    pub fn get_current_step(&self) -> Option<&TaskStep> {
        self.steps.get(self.current_step_index)
    }

    pub fn get_current_step_mut(&mut self) -> Option<&mut TaskStep> {
        self.steps.get_mut(self.current_step_index)
    }

    /// Move to the next pending step after the current one
    ///
    /// Returns `None` at the end of the plan without moving the cursor;
    /// callers then check [`is_complete`](Self::is_complete).
    pub fn advance_to_next_step(&mut self) -> Option<&TaskStep> {
        let next = (self.current_step_index + 1..self.steps.len())
            .find(|&i| self.steps[i].is_pending())?;
        self.current_step_index = next;
        self.updated_at = Utc::now();
        self.steps.get(next)
    }

    pub fn get_step_by_id(&self, step_id: &str) -> Option<&TaskStep> {
        self.steps.iter().find(|s| s.step_id == step_id)
    }

    pub fn get_step_by_id_mut(&mut self, step_id: &str) -> Option<&mut TaskStep> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }

    pub fn get_completed_steps(&self) -> Vec<&TaskStep> {
        self.steps.iter().filter(|s| s.is_completed()).collect()
    }

    pub fn get_pending_steps(&self) -> Vec<&TaskStep> {
        self.steps.iter().filter(|s| s.is_pending()).collect()
    }

    /// True iff every required step is completed
    pub fn is_complete(&self) -> bool {
        self.steps
            .iter()
            .filter(|s| s.required)
            .all(TaskStep::is_completed)
    }

    /// Fraction of steps completed, 1.0 for an empty plan
    pub fn get_progress(&self) -> f64 {
        if self.steps.is_empty() {
            return 1.0;
        }
        self.get_completed_steps().len() as f64 / self.steps.len() as f64
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn step_types(&self) -> Vec<&str> {
        self.steps.iter().map(|s| s.step_type.as_str()).collect()
    }
}

fn indexed(index: usize) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("service_index".to_string(), json!(index));
    input
}

/// One caller intent and its fulfilment state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub task_id: String,
    pub intent: Intent,
    #[serde(default)]
    pub original_input: String,
    pub state: TaskState,
    #[serde(default)]
    pub priority: TaskPriority,
    pub plan: Option<TaskPlan>,
    #[serde(default)]
    pub collected_data: Map<String, Value>,

    #[serde(default)]
    pub services: Vec<Map<String, Value>>,
    #[serde(default)]
    pub therapists: Vec<Map<String, Value>>,
    #[serde(default)]
    pub addons: Vec<Map<String, Value>>,

    #[serde(default)]
    pub session_id: String,
    pub current_node: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,

    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,

    pub paused_at_step: Option<String>,
    pub pause_reason: Option<String>,
}

impl Task {
    pub fn new(intent: Intent, original_input: impl Into<String>, priority: TaskPriority) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4().to_string(),
            intent,
            original_input: original_input.into(),
            state: TaskState::Pending,
            priority,
            plan: None,
            collected_data: Map::new(),
            services: Vec::new(),
            therapists: Vec::new(),
            addons: Vec::new(),
            session_id: String::new(),
            current_node: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            error: None,
            retry_count: 0,
            paused_at_step: None,
            pause_reason: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = session_id.into();
        self
    }

    fn transition(&mut self, to: TaskState) -> Result<()> {
        if !self.state.can_transition_to(to) {
            return Err(WorkflowError::InvalidTransition {
                from: self.state,
                to,
            });
        }
        self.state = to;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        self.transition(TaskState::InProgress)?;
        self.started_at = Some(self.updated_at);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<()> {
        self.transition(TaskState::Completed)?;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<()> {
        self.transition(TaskState::Failed)?;
        self.error = Some(error.into());
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<()> {
        self.transition(TaskState::Cancelled)?;
        self.completed_at = Some(self.updated_at);
        Ok(())
    }

    /// Pause mid-flow, remembering where and why
    pub fn pause(&mut self, step_id: Option<String>, reason: Option<String>) -> Result<()> {
        self.transition(TaskState::Paused)?;
        self.paused_at_step = step_id;
        self.pause_reason = reason;
        Ok(())
    }

    /// Resume as-is: the plan cursor is not revalidated
    pub fn resume(&mut self) -> Result<()> {
        self.transition(TaskState::InProgress)?;
        self.paused_at_step = None;
        self.pause_reason = None;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn is_pending(&self) -> bool {
        self.state.is_pending()
    }

    pub fn add_service(
        &mut self,
        service_id: impl Into<String>,
        service_name: impl Into<String>,
        extra: Map<String, Value>,
    ) {
        let mut service = Map::new();
        service.insert("service_id".to_string(), Value::String(service_id.into()));
        service.insert("service_name".to_string(), Value::String(service_name.into()));
        service.extend(extra);
        self.services.push(service);
        self.updated_at = Utc::now();
    }

    pub fn set_data(&mut self, key: impl Into<String>, value: Value) {
        self.collected_data.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn get_data(&self, key: &str) -> Option<&Value> {
        self.collected_data.get(key)
    }

    /// Build the booking plan for this task's services
    ///
    /// Pure in the two flags and the service count; calling it again
    /// replaces the previous plan.
    pub fn create_plan(
        &mut self,
        allows_multiple_services: bool,
        allows_multiple_therapists: bool,
    ) -> &TaskPlan {
        let mut plan = TaskPlan::new();
        let num_services = self.services.len().max(1);

        if allows_multiple_services && allows_multiple_therapists {
            for i in 0..num_services {
                plan.add_step(
                    TaskStep::new(format!("Collect Service {} Details", i + 1), "collect_service")
                        .with_input(indexed(i)),
                );
                plan.add_step(
                    TaskStep::new(
                        format!("Collect Therapist {} Details", i + 1),
                        "collect_therapist",
                    )
                    .with_input(indexed(i)),
                );
            }
        } else if allows_multiple_services {
            for i in 0..num_services {
                plan.add_step(
                    TaskStep::new(format!("Collect Service {} Details", i + 1), "collect_service")
                        .with_input(indexed(i)),
                );
            }
            plan.add_step(
                TaskStep::new("Collect Therapist Details", "collect_therapist")
                    .with_input(indexed(0)),
            );
        } else {
            plan.add_step(
                TaskStep::new("Collect Service Details", "collect_service").with_input(indexed(0)),
            );
            plan.add_step(
                TaskStep::new("Collect Therapist Details", "collect_therapist")
                    .with_input(indexed(0)),
            );
        }

        plan.add_step(TaskStep::new("Check Availability", "check_availability"));
        plan.add_step(TaskStep::new("Confirm Booking", "confirm_booking"));

        self.updated_at = Utc::now();
        self.plan.insert(plan)
    }

    pub fn is_booking_intent(&self) -> bool {
        self.intent == Intent::Book
    }

    pub fn is_cancellation_intent(&self) -> bool {
        self.intent == Intent::Cancel
    }

    pub fn is_reschedule_intent(&self) -> bool {
        self.intent == Intent::Reschedule
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn booking_task(services: usize) -> Task {
        let mut task = Task::new(Intent::Book, "book please", TaskPriority::Normal);
        for i in 0..services {
            task.add_service(format!("svc-{i}"), format!("Service {i}"), Map::new());
        }
        task
    }

    #[test]
    fn test_single_service_plan() {
        let mut task = booking_task(1);
        let plan = task.create_plan(false, false);
        assert_eq!(
            plan.step_types(),
            vec![
                "collect_service",
                "collect_therapist",
                "check_availability",
                "confirm_booking"
            ]
        );
        assert_eq!(plan.steps[0].step_name, "Collect Service Details");
        assert_eq!(plan.steps[3].order, 3);
    }

    #[test]
    fn test_multi_service_multi_therapist_interleaves() {
        let mut task = booking_task(2);
        let plan = task.create_plan(true, true);
        assert_eq!(
            plan.step_types(),
            vec![
                "collect_service",
                "collect_therapist",
                "collect_service",
                "collect_therapist",
                "check_availability",
                "confirm_booking"
            ]
        );
        assert_eq!(plan.steps[2].step_name, "Collect Service 2 Details");
        assert_eq!(plan.steps[3].input_data["service_index"], 1);
    }

    #[test]
    fn test_multi_service_single_therapist() {
        let mut task = booking_task(3);
        let plan = task.create_plan(true, false);
        assert_eq!(plan.len(), 6);
        assert_eq!(plan.steps[3].step_name, "Collect Therapist Details");
    }

    #[test]
    fn test_no_services_counts_as_one() {
        let mut task = booking_task(0);
        assert_eq!(task.create_plan(true, true).len(), 4);
    }

    #[test]
    fn test_create_plan_replaces() {
        let mut task = booking_task(2);
        let first = task.create_plan(true, true).plan_id.clone();
        let second = task.create_plan(false, false);
        assert_ne!(first, second.plan_id);
        assert_eq!(second.len(), 4);
    }

    #[test]
    fn test_advance_skips_non_pending() {
        let mut task = booking_task(1);
        task.create_plan(false, false);
        let plan = task.plan.as_mut().unwrap();

        plan.steps[1].mark_completed(None);
        let next = plan.advance_to_next_step().unwrap();
        assert_eq!(next.step_type, "check_availability");
        assert_eq!(plan.current_step_index, 2);

        plan.advance_to_next_step();
        assert!(plan.advance_to_next_step().is_none());
        assert_eq!(plan.current_step_index, 3);
    }

    #[test]
    fn test_progress_and_completion() {
        let mut plan = TaskPlan::new();
        assert_eq!(plan.get_progress(), 1.0);
        assert!(plan.is_complete());

        plan.add_step(TaskStep::new("a", "collect_service"));
        plan.add_step(TaskStep::new("b", "extra").optional());
        assert!(!plan.is_complete());

        plan.steps[1].mark_completed(None);
        assert!(!plan.is_complete());
        assert_eq!(plan.get_progress(), 0.5);

        plan.steps[0].mark_completed(None);
        assert!(plan.is_complete());
    }

    #[test]
    fn test_step_failure_tracks_retries() {
        let mut step = TaskStep::new("a", "collect_service");
        step.mark_failed("no slots");
        assert_eq!(step.state, TaskState::Failed);
        assert!(step.can_retry());
        step.mark_failed("no slots");
        step.mark_failed("no slots");
        assert!(!step.can_retry());
    }

    #[test]
    fn test_transitions() {
        let mut task = booking_task(0);
        assert!(task.complete().is_err());
        assert_eq!(task.state, TaskState::Pending);

        task.start().unwrap();
        assert!(task.started_at.is_some());
        task.pause(Some("collect_service".into()), Some("question".into()))
            .unwrap();
        task.resume().unwrap();
        task.complete().unwrap();

        let err = task.start().unwrap_err();
        assert!(matches!(
            err,
            WorkflowError::InvalidTransition {
                from: TaskState::Completed,
                to: TaskState::InProgress
            }
        ));
        assert!(task.cancel().is_err());
    }

    #[test]
    fn test_cancel_from_any_live_state() {
        let mut pending = booking_task(0);
        pending.cancel().unwrap();
        assert_eq!(pending.state, TaskState::Cancelled);

        let mut paused = booking_task(0);
        paused.start().unwrap();
        paused.pause(None, None).unwrap();
        paused.cancel().unwrap();
        assert!(paused.is_terminal());
    }

    #[test]
    fn test_intent_helpers() {
        let task = Task::new("booking".parse().unwrap(), "", TaskPriority::Low);
        assert!(task.is_booking_intent());
        assert!(!task.is_cancellation_intent());
    }

    #[test]
    fn test_serde_roundtrip_preserves_state() {
        let mut task = booking_task(1);
        task.start().unwrap();
        task.create_plan(false, false);
        task.set_data("date", json!("2024-05-01"));

        let json = serde_json::to_value(&task).unwrap();
        assert_eq!(json["state"], "in_progress");
        assert_eq!(json["priority"], "normal");
        let restored: Task = serde_json::from_value(json).unwrap();
        assert_eq!(restored, task);
    }

    #[test]
    fn test_priority_ordering() {
        assert!(TaskPriority::Interrupt > TaskPriority::High);
        assert_eq!(TaskPriority::from_value(TaskPriority::High.value()), TaskPriority::High);
    }
}

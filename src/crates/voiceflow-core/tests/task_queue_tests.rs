//! Integration tests for task ordering, planning and pause/resume
//!
//! These exercise the queue and task model through the public API only.

use proptest::prelude::*;
use voiceflow_core::{Intent, QueueConfig, Task, TaskPriority, TaskQueue, TaskState};

fn priority_from(n: u8) -> TaskPriority {
    TaskPriority::from_value(n % 4)
}

proptest! {
    /// Dequeue order is by priority, then by enqueue order
    #[test]
    fn prop_dequeue_orders_by_priority_then_fifo(priorities in prop::collection::vec(0u8..4, 1..40)) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let queue = TaskQueue::new(QueueConfig::default());
            for (i, p) in priorities.iter().enumerate() {
                queue
                    .enqueue(Task::new(Intent::Faq, i.to_string(), priority_from(*p)))
                    .await;
            }

            let mut drained = Vec::new();
            while let Some(task) = queue.dequeue().await {
                let index: usize = task.original_input.parse().unwrap();
                drained.push((task.priority, index));
            }

            prop_assert_eq!(drained.len(), priorities.len());
            for pair in drained.windows(2) {
                let (p0, i0) = pair[0];
                let (p1, i1) = pair[1];
                prop_assert!(p0 >= p1, "priority rose from {:?} to {:?}", p0, p1);
                if p0 == p1 {
                    prop_assert!(i0 < i1, "FIFO broken at {} then {}", i0, i1);
                }
            }
            Ok::<(), TestCaseError>(())
        })?;
    }
}

#[tokio::test]
async fn test_pending_check_tracks_queue() {
    let queue = TaskQueue::default();
    assert!(!queue.has_pending_sync());

    for i in 0..25 {
        queue
            .enqueue(Task::new(Intent::Book, format!("task {}", i), TaskPriority::Normal))
            .await;
    }
    assert!(queue.has_pending_sync());
    assert_eq!(queue.pending_count(), 25);

    while queue.dequeue().await.is_some() {}
    assert!(!queue.has_pending_sync());
    assert_eq!(queue.pending_count(), 0);
}

#[tokio::test]
async fn test_interrupt_task_jumps_the_queue() {
    let queue = TaskQueue::default();
    queue
        .enqueue(Task::new(Intent::Book, "book a massage", TaskPriority::Normal))
        .await;
    let handover = queue
        .enqueue(Task::new(Intent::Handover, "get me a person", TaskPriority::Interrupt))
        .await;
    assert!(queue.has_interrupt_sync());

    let first = queue.dequeue().await.unwrap();
    assert_eq!(first.task_id, handover);
    assert_eq!(first.intent, Intent::Handover);
    assert!(!queue.has_interrupt_sync());
}

#[test]
fn test_single_service_plan_has_four_steps() {
    let mut task = Task::new(Intent::Book, "book a facial", TaskPriority::Normal);
    task.add_service("svc-1", "Facial", Default::default());
    let plan = task.create_plan(false, false);
    assert_eq!(
        plan.step_types(),
        vec!["collect_service", "collect_therapist", "check_availability", "confirm_booking"]
    );
}

#[test]
fn test_plan_completion_needs_every_required_step() {
    let mut task = Task::new(Intent::Book, "book", TaskPriority::Normal);
    task.add_service("svc-1", "Facial", Default::default());
    let mut plan = task.create_plan(false, false).clone();
    plan.steps[1].required = false;

    plan.steps[1].mark_completed(None);
    assert!(!plan.is_complete());

    for i in [0, 2] {
        plan.steps[i].mark_completed(None);
        assert!(!plan.is_complete());
    }
    plan.steps[3].mark_completed(None);
    assert!(plan.is_complete());
}

#[tokio::test]
async fn test_paused_task_resumes_at_same_step() {
    let queue = TaskQueue::default();
    let mut task = Task::new(Intent::Book, "book a facial", TaskPriority::Normal);
    task.add_service("svc-1", "Facial", Default::default());
    task.create_plan(false, false);
    if let Some(plan) = task.plan.as_mut() {
        plan.get_current_step_mut().unwrap().mark_completed(None);
        plan.advance_to_next_step();
    }
    task.start().unwrap();
    let task_id = queue.enqueue(task).await;

    assert!(queue.pause_task(&task_id, Some("topic switch".into())).await);
    let paused = queue.get_by_id(&task_id).await.unwrap();
    assert_eq!(paused.state, TaskState::Paused);
    assert_eq!(paused.paused_at_step.as_deref(), Some("collect_therapist"));
    assert_eq!(paused.pause_reason.as_deref(), Some("topic switch"));

    assert!(queue.resume_task(&task_id).await);
    let resumed = queue.get_by_id(&task_id).await.unwrap();
    assert_eq!(resumed.state, TaskState::InProgress);
    assert!(resumed.paused_at_step.is_none());
    assert!(resumed.pause_reason.is_none());
    assert_eq!(
        resumed.plan.unwrap().get_current_step().unwrap().step_type,
        "collect_therapist"
    );
}

#[test]
fn test_terminal_tasks_reject_transitions() {
    let mut task = Task::new(Intent::Cancel, "cancel it", TaskPriority::High);
    task.start().unwrap();
    task.complete().unwrap();
    assert!(task.is_terminal());
    assert!(task.start().is_err());
    assert!(task.pause(None, None).is_err());
}

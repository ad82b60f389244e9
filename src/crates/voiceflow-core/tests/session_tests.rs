//! Integration tests for per-call session state
//!
//! Covers barge-in stashing, isolation between calls and checkpoint restore.

use serde_json::json;
use voiceflow_core::{InterruptHandler, Intent, Session, Settings, TaskPriority};

fn session(id: &str) -> Session {
    Session::with_id(id, &Settings::in_memory()).unwrap()
}

#[tokio::test]
async fn test_interrupt_stash_round_trip() {
    let mut session = session("call-1");
    session.start().await;
    let mut handler = InterruptHandler::default();

    handler.trigger_interrupt(&mut session, "barge_in", Some("wait stop"));
    handler.stash_response(&mut session, "Hello I was about to", None);
    assert!(handler.is_interrupted(&session));

    let context = handler.get_continuation_context(&session).unwrap();
    assert!(context.contains("Hello I was about to"));
    assert!(context.contains("wait stop"));
    // Reading the frame does not consume it
    assert_eq!(handler.get_continuation_context(&session), Some(context));

    let stash = handler.clear_interrupt(&mut session);
    assert_eq!(stash.unwrap().content, "Hello I was about to");
    assert!(handler.get_stashed_response(&session).is_none());
    assert!(!session.is_interrupted());
    session.close().await;
}

#[tokio::test]
async fn test_sessions_with_same_id_are_isolated() {
    let mut first = session("shared-id");
    let mut second = session("shared-id");
    first.start().await;
    second.start().await;

    first
        .create_task(Intent::Book, "book a facial", TaskPriority::Normal)
        .await;
    first.set_workflow_variable("guest", json!("Ana"));
    first.save_checkpoint(Some("cp-1"), None);

    assert_eq!(first.queue().len().await, 1);
    assert!(second.queue().is_empty().await);
    assert!(second.get_workflow_variable("guest").is_none());
    assert!(second
        .checkpointer()
        .get_checkpoint("cp-1")
        .await
        .unwrap()
        .is_none());

    first.close().await;
    second.close().await;
}

#[tokio::test]
async fn test_restore_rewinds_workflow_state() {
    let mut session = session("call-restore");
    session.start().await;
    session.move_to_node("greeting_routing_agent");
    session.set_workflow_variable("step", json!(1));
    session.add_user_message("I want a massage");
    session.save_checkpoint(Some("before"), None);

    session.move_to_node("fallback_agent");
    session.set_workflow_variable("step", json!(2));
    session.add_user_message("actually cancel it");

    assert!(session.restore_from_checkpoint("before").await);
    assert_eq!(session.get_current_node(), Some("greeting_routing_agent"));
    assert_eq!(session.get_workflow_variable("step"), Some(&json!(1)));
    assert_eq!(session.get_llm_messages(None).len(), 1);

    assert!(!session.restore_from_checkpoint("missing").await);
    session.close().await;
}

#[tokio::test]
async fn test_close_aborts_background_work() {
    let mut session = session("call-bg");
    session.start().await;
    session.spawn_background("slow", async {
        tokio::time::sleep(std::time::Duration::from_secs(60)).await;
        Ok(Default::default())
    });
    assert!(session.has_background("slow"));

    session.close().await;
    assert!(!session.has_background("slow"));
}

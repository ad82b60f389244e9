use super::{InterruptConfig, InterruptReason, InterruptState};
use crate::llm::LlmMessage;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::debug;

#[derive(Debug, Default)]
struct FollowupState {
    state: InterruptState,
    reason: Option<InterruptReason>,
    stashed: Option<String>,
    waiting: bool,
    followup: Option<String>,
    interrupted_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    wait: Duration,
    max_stash_chars: usize,
    state: Mutex<FollowupState>,
    arrived: Notify,
}

/// Batches a trailing utterance after a barge-in
///
/// Callers often keep talking for a moment after interrupting ("wait, no,
/// make it Thursday"). The manager holds the continuation back for a short
/// window so the whole utterance lands in one turn. Clones share state, so
/// the transcript feed and the responder can each hold one.
///
/// Neither [`WorkflowExecutor`](crate::WorkflowExecutor) nor the websocket
/// server drives this manager; a bridge that streams partial transcripts
/// feeds it directly.
#[derive(Debug, Clone)]
pub struct FollowupInterruptManager {
    inner: Arc<Inner>,
}

impl FollowupInterruptManager {
    pub fn new(config: &InterruptConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                wait: Duration::from_millis(config.followup_wait_ms),
                max_stash_chars: config.max_stash_chars,
                state: Mutex::new(FollowupState::default()),
                arrived: Notify::new(),
            }),
        }
    }

    pub fn state(&self) -> InterruptState {
        self.inner.state.lock().state
    }

    pub fn is_interrupted(&self) -> bool {
        self.state().is_active()
    }

    pub fn interrupted_at(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().interrupted_at
    }

    pub fn reason(&self) -> Option<InterruptReason> {
        self.inner.state.lock().reason
    }

    pub fn signal_interrupt(&self, reason: InterruptReason, new_message: Option<String>) {
        let mut state = self.inner.state.lock();
        if !state.state.is_active() {
            state.state = InterruptState::Interrupted;
            state.interrupted_at = Some(Utc::now());
        }
        state.reason = Some(reason);
        if let Some(message) = new_message {
            append(&mut state.followup, &message);
        }
        debug!(reason = ?reason, "Follow-up manager interrupted");
    }

    /// Feed a caller utterance
    ///
    /// Inside the wait window it becomes the follow-up; outside it starts a
    /// new interrupt.
    pub fn receive_message(&self, message: &str) {
        let mut state = self.inner.state.lock();
        if state.waiting {
            append(&mut state.followup, message);
            state.waiting = false;
            drop(state);
            self.inner.arrived.notify_one();
        } else {
            drop(state);
            self.signal_interrupt(InterruptReason::UserInterrupt, Some(message.to_string()));
        }
    }

    pub fn stash_partial_response(&self, content: &str) {
        self.inner.state.lock().stashed = Some(content.to_string());
    }

    pub fn get_stashed_response(&self) -> Option<String> {
        self.inner.state.lock().stashed.clone()
    }

    /// Wait up to the configured window for a follow-up
    ///
    /// Returns `true` when one arrived. A zero window never waits.
    pub async fn wait_for_followup(&self) -> bool {
        if self.inner.wait.is_zero() {
            return false;
        }
        {
            let mut state = self.inner.state.lock();
            state.waiting = true;
            if state.state == InterruptState::Interrupted {
                state.state = InterruptState::AwaitingFollowup;
            }
        }

        let deadline = tokio::time::Instant::now() + self.inner.wait;
        loop {
            let timed_out = tokio::time::timeout_at(deadline, self.inner.arrived.notified())
                .await
                .is_err();
            let mut state = self.inner.state.lock();
            // receive_message clears the flag; a wake without that is a stale permit
            let received = !state.waiting;
            if received || timed_out {
                state.waiting = false;
                return received;
            }
        }
    }

    pub fn has_followup(&self) -> bool {
        self.inner.state.lock().followup.is_some()
    }

    pub fn get_followup_message(&self) -> Option<String> {
        self.inner.state.lock().followup.clone()
    }

    /// History plus one user message merging the stash and the follow-up
    pub fn get_continuation_messages(
        &self,
        history: &[LlmMessage],
        max_history: usize,
    ) -> Vec<LlmMessage> {
        let skip = history.len().saturating_sub(max_history);
        let mut messages: Vec<LlmMessage> = history[skip..].to_vec();

        let state = self.inner.state.lock();
        match (&state.stashed, &state.followup) {
            (Some(stashed), Some(followup)) => {
                let stashed: String = stashed.chars().take(self.inner.max_stash_chars).collect();
                messages.push(LlmMessage::user(format!(
                    "The user interrupted while you were saying:\n\"{}\"\n\nThe user now says: {}",
                    stashed, followup
                )));
            }
            (None, Some(followup)) => messages.push(LlmMessage::user(followup.clone())),
            _ => {}
        }
        messages
    }

    /// Close the cycle and reset for the next one
    pub fn resolve(&self) -> Option<String> {
        let mut state = self.inner.state.lock();
        let followup = state.followup.take();
        *state = FollowupState {
            state: InterruptState::Resolved,
            ..FollowupState::default()
        };
        followup
    }

    pub fn reset(&self) {
        *self.inner.state.lock() = FollowupState::default();
    }
}

fn append(target: &mut Option<String>, message: &str) {
    match target {
        Some(existing) => {
            existing.push(' ');
            existing.push_str(message);
        }
        None => *target = Some(message.to_string()),
    }
}

use super::{InterruptConfig, InterruptSignal, InterruptState};
use crate::session::Session;
use crate::workflow_state::StashedResponse;
use async_stream::stream;
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use std::time::Duration;
use tracing::debug;

const DEFAULT_INTERRUPT_MESSAGE: &str = "User interrupted";

/// Interrupt cycle for one session
///
/// The handler holds only cycle bookkeeping. The stash itself lives in the
/// session's [`WorkflowState`](crate::workflow_state::WorkflowState) so it is
/// captured by checkpoints.
#[derive(Debug)]
pub struct InterruptHandler {
    config: InterruptConfig,
    signal: InterruptSignal,
    state: InterruptState,
    interrupt_message: Option<String>,
    interrupt_count: u64,
    last_interrupt_at: Option<DateTime<Utc>>,
}

impl Default for InterruptHandler {
    fn default() -> Self {
        Self::new(InterruptConfig::default())
    }
}

impl InterruptHandler {
    pub fn new(config: InterruptConfig) -> Self {
        Self {
            config,
            signal: InterruptSignal::new(),
            state: InterruptState::Idle,
            interrupt_message: None,
            interrupt_count: 0,
            last_interrupt_at: None,
        }
    }

    pub fn config(&self) -> &InterruptConfig {
        &self.config
    }

    pub fn state(&self) -> InterruptState {
        self.state
    }

    pub fn interrupt_count(&self) -> u64 {
        self.interrupt_count
    }

    pub fn last_interrupt_at(&self) -> Option<DateTime<Utc>> {
        self.last_interrupt_at
    }

    /// Handle for raising interrupts from another task
    pub fn signal(&self) -> InterruptSignal {
        self.signal.clone()
    }

    pub fn is_interrupted(&self, session: &Session) -> bool {
        self.state.is_active() || session.is_interrupted()
    }

    fn enter_interrupted(&mut self) {
        if self.state.is_active() {
            return;
        }
        self.state = InterruptState::Interrupted;
        self.interrupt_count += 1;
        self.last_interrupt_at = Some(Utc::now());
        debug!(count = self.interrupt_count, "Interrupt detected");
    }

    /// O(1) check of the queue and the external signal
    pub fn check_for_interrupt(&mut self, session: &Session) -> bool {
        let queued = session.has_interrupt_sync();
        let raised = self.signal.is_raised();
        if raised {
            if let Some(raised) = self.signal.take() {
                if raised.message.is_some() {
                    self.interrupt_message = raised.message;
                }
            }
        }
        if queued || raised {
            self.enter_interrupted();
        }
        queued || raised
    }

    /// Enter the interrupted state explicitly
    pub fn trigger_interrupt(
        &mut self,
        session: &mut Session,
        reason: &str,
        user_message: Option<&str>,
    ) {
        self.interrupt_message = Some(user_message.unwrap_or(reason).to_string());
        self.enter_interrupted();
        let state = session.workflow_state_mut();
        state.is_interrupted = true;
        state.pending_interrupt = user_message.map(str::to_string);
    }

    /// Open the follow-up window of the current cycle
    pub fn await_followup(&mut self) -> bool {
        if self.state == InterruptState::Interrupted {
            self.state = InterruptState::AwaitingFollowup;
            true
        } else {
            false
        }
    }

    /// Capture partial output; returns the stash id
    ///
    /// `node_id` defaults to the session's current node.
    pub fn stash_response(
        &mut self,
        session: &mut Session,
        content: &str,
        node_id: Option<&str>,
    ) -> String {
        let stash = StashedResponse::new(content);
        self.store_stash(session, stash, node_id)
    }

    fn store_stash(
        &mut self,
        session: &mut Session,
        mut stash: StashedResponse,
        node_id: Option<&str>,
    ) -> String {
        let message = self
            .interrupt_message
            .clone()
            .unwrap_or_else(|| DEFAULT_INTERRUPT_MESSAGE.to_string());
        stash.node_id = node_id
            .map(str::to_string)
            .or_else(|| session.get_current_node().map(str::to_string));
        stash.interrupt_message = Some(message.clone());
        stash.include_in_continuation = self.config.include_stashed_in_continuation;
        let stash_id = stash.stash_id.clone();
        let chars = stash.content.chars().count();

        self.enter_interrupted();
        let state = session.workflow_state_mut();
        state.is_interrupted = true;
        state.pending_interrupt = Some(message);
        state.stashed_response = Some(stash);
        debug!(stash_id = %stash_id, chars, "Response stashed");
        stash_id
    }

    /// Current stash, unless it has aged out
    pub fn get_stashed_response<'s>(&self, session: &'s Session) -> Option<&'s StashedResponse> {
        let max_age = self.config.max_stash_age_ms;
        session.stashed_response().filter(|stash| {
            let fresh = !stash.is_older_than(max_age, Utc::now());
            if !fresh {
                debug!(stash_id = %stash.stash_id, "Ignoring expired stash");
            }
            fresh
        })
    }

    /// Continuation frame for the next LLM call; idempotent until cleared
    pub fn get_continuation_context(&self, session: &Session) -> Option<String> {
        if !self.config.include_stashed_in_continuation {
            return None;
        }
        self.get_stashed_response(session)
            .and_then(|stash| stash.continuation_context(self.config.max_stash_chars))
    }

    /// Resolve the cycle, handing back the stash if it is still fresh
    pub fn clear_interrupt(&mut self, session: &mut Session) -> Option<StashedResponse> {
        let max_age = self.config.max_stash_age_ms;
        let stash = session
            .workflow_state_mut()
            .clear_interrupt()
            .filter(|stash| !stash.is_older_than(max_age, Utc::now()));
        self.interrupt_message = None;
        self.state = InterruptState::Resolved;
        stash
    }

    /// Poll until an interrupt shows up or `timeout` passes
    pub async fn wait_for_interrupt(&mut self, session: &Session, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        let interval = Duration::from_millis(self.config.check_interval_ms.max(1));
        loop {
            if self.check_for_interrupt(session) {
                return true;
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    /// Forward `chunks` until an interrupt is detected
    ///
    /// Before each chunk the queue and signal are checked. On interrupt the
    /// text yielded so far is stashed and the stream ends.
    pub fn interrupt_aware<'a, S>(
        &'a mut self,
        session: &'a mut Session,
        chunks: S,
    ) -> impl Stream<Item = String> + Send + 'a
    where
        S: Stream<Item = String> + Send + 'a,
    {
        stream! {
            let started_at = Utc::now();
            let mut accumulated = String::new();
            let mut yielded = 0usize;
            let mut chunks = Box::pin(chunks);
            while let Some(chunk) = chunks.next().await {
                if self.check_for_interrupt(session) {
                    if !accumulated.is_empty() {
                        let stash = StashedResponse::new(accumulated.as_str())
                            .streaming(yielded, started_at);
                        self.store_stash(session, stash, None);
                    }
                    break;
                }
                accumulated.push_str(&chunk);
                yielded += 1;
                yield chunk;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::intent::Intent;
    use crate::interrupt::InterruptReason;
    use crate::task::TaskPriority;
    use futures::stream;

    fn session() -> Session {
        Session::with_id("interrupt-test", &Settings::in_memory()).unwrap()
    }

    #[test]
    fn test_stash_round_trip() {
        let mut session = session();
        let mut handler = InterruptHandler::default();

        handler.trigger_interrupt(&mut session, "barge-in", Some("wait stop"));
        assert_eq!(handler.state(), InterruptState::Interrupted);
        let stash_id = handler.stash_response(&mut session, "Hello I was about to", None);
        assert_eq!(stash_id.len(), 8);

        let first = handler.get_continuation_context(&session).unwrap();
        assert!(first.contains("Hello I was about to"));
        assert!(first.contains("wait stop"));
        assert_eq!(handler.get_continuation_context(&session).unwrap(), first);

        let cleared = handler.clear_interrupt(&mut session).unwrap();
        assert_eq!(cleared.stash_id, stash_id);
        assert!(handler.get_stashed_response(&session).is_none());
        assert!(handler.get_continuation_context(&session).is_none());
        assert_eq!(handler.state(), InterruptState::Resolved);
        assert!(!handler.is_interrupted(&session));
    }

    #[tokio::test]
    async fn test_queue_interrupt_detected_once_per_cycle() {
        let mut session = session();
        let mut handler = InterruptHandler::default();
        assert!(!handler.check_for_interrupt(&session));

        session
            .create_task(Intent::Handover, "get me a person", TaskPriority::Interrupt)
            .await;
        assert!(handler.check_for_interrupt(&session));
        assert!(handler.check_for_interrupt(&session));
        assert_eq!(handler.interrupt_count(), 1);
        assert!(handler.await_followup());
        assert_eq!(handler.state(), InterruptState::AwaitingFollowup);
    }

    #[test]
    fn test_expired_stash_is_absent() {
        let mut session = session();
        let mut handler = InterruptHandler::new(InterruptConfig::default().with_max_stash_age_ms(0));
        handler.stash_response(&mut session, "old news", Some("greeting_routing_agent"));
        if let Some(stash) = session.workflow_state_mut().stashed_response.as_mut() {
            stash.interrupted_at = Utc::now() - chrono::Duration::seconds(5);
        }

        assert!(handler.get_stashed_response(&session).is_none());
        assert!(handler.clear_interrupt(&mut session).is_none());
    }

    #[test]
    fn test_continuation_disabled() {
        let mut session = session();
        let config = InterruptConfig {
            include_stashed_in_continuation: false,
            ..InterruptConfig::default()
        };
        let mut handler = InterruptHandler::new(config);
        handler.stash_response(&mut session, "partial", None);
        assert!(handler.get_stashed_response(&session).is_some());
        assert!(handler.get_continuation_context(&session).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_interrupt_sees_remote_signal() {
        let session = session();
        let mut handler = InterruptHandler::default();
        assert!(!handler.wait_for_interrupt(&session, Duration::from_millis(200)).await);

        let signal = handler.signal();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            signal.raise(InterruptReason::VoiceActivity, Some("hold on".into()));
        });
        assert!(handler.wait_for_interrupt(&session, Duration::from_secs(1)).await);
        assert_eq!(handler.state(), InterruptState::Interrupted);
    }

    #[tokio::test]
    async fn test_interrupt_aware_stashes_partial_stream() {
        let mut session = session();
        session.move_to_node("fallback_agent");
        let mut handler = InterruptHandler::default();
        let signal = handler.signal();

        let chunks = stream::iter(vec!["Your ", "booking ", "is ", "confirmed"])
            .map(str::to_string)
            .inspect(move |chunk| {
                if chunk == "is " {
                    signal.raise(InterruptReason::UserInterrupt, Some("actually no".into()));
                }
            });

        let seen: Vec<String> = handler
            .interrupt_aware(&mut session, chunks)
            .collect()
            .await;
        assert_eq!(seen, vec!["Your ", "booking "]);

        let stash = session.stashed_response().unwrap();
        assert_eq!(stash.content, "Your booking ");
        assert!(stash.was_streaming);
        assert_eq!(stash.node_id.as_deref(), Some("fallback_agent"));
        assert_eq!(stash.interrupt_message.as_deref(), Some("actually no"));
    }
}

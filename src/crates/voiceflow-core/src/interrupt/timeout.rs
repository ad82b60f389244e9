use crate::config::TimeoutConfig;
use futures::future::BoxFuture;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::debug;

/// Async callback fired when a timer expires
pub type TimeoutCallback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Soft and turn deadlines while waiting on the caller
///
/// [`start_waiting`](Self::start_waiting) arms both timers and re-arms them
/// if they are already running; [`stop_waiting`](Self::stop_waiting) disarms
/// them. Timers run as spawned tasks, so arming needs a tokio runtime.
pub struct TimeoutManager {
    soft_timeout: Duration,
    turn_timeout: Duration,
    on_soft_timeout: Option<TimeoutCallback>,
    on_turn_timeout: Option<TimeoutCallback>,
    waiting: Arc<AtomicBool>,
    soft_timer: Option<JoinHandle<()>>,
    turn_timer: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for TimeoutManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimeoutManager")
            .field("soft_timeout", &self.soft_timeout)
            .field("turn_timeout", &self.turn_timeout)
            .field("waiting", &self.is_waiting())
            .finish()
    }
}

impl TimeoutManager {
    pub fn new(config: &TimeoutConfig) -> Self {
        Self {
            soft_timeout: config.soft_timeout(),
            turn_timeout: config.turn_timeout(),
            on_soft_timeout: None,
            on_turn_timeout: None,
            waiting: Arc::new(AtomicBool::new(false)),
            soft_timer: None,
            turn_timer: None,
        }
    }

    pub fn set_soft_timeout_callback(&mut self, callback: TimeoutCallback) {
        self.on_soft_timeout = Some(callback);
    }

    pub fn set_turn_timeout_callback(&mut self, callback: TimeoutCallback) {
        self.on_turn_timeout = Some(callback);
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.load(Ordering::SeqCst)
    }

    /// Arm both timers from now
    pub fn start_waiting(&mut self) {
        self.disarm();
        self.waiting.store(true, Ordering::SeqCst);
        self.soft_timer = self.arm("soft", self.soft_timeout, self.on_soft_timeout.clone());
        self.turn_timer = self.arm("turn", self.turn_timeout, self.on_turn_timeout.clone());
    }

    pub fn stop_waiting(&mut self) {
        self.waiting.store(false, Ordering::SeqCst);
        self.disarm();
    }

    fn disarm(&mut self) {
        for timer in [self.soft_timer.take(), self.turn_timer.take()].into_iter().flatten() {
            timer.abort();
        }
    }

    fn arm(
        &self,
        kind: &'static str,
        after: Duration,
        callback: Option<TimeoutCallback>,
    ) -> Option<JoinHandle<()>> {
        let callback = callback?;
        let waiting = Arc::clone(&self.waiting);
        Some(tokio::spawn(async move {
            tokio::time::sleep(after).await;
            if waiting.load(Ordering::SeqCst) {
                debug!(kind, after_ms = after.as_millis() as u64, "Timeout fired");
                callback().await;
            }
        }))
    }
}

impl Drop for TimeoutManager {
    fn drop(&mut self) {
        self.disarm();
    }
}

const ENGAGEMENT_MESSAGES: [&str; 4] = [
    "Just a moment...",
    "Let me check that for you...",
    "One second please...",
    "I'm looking that up...",
];

/// Rotating filler lines for the soft timeout
#[derive(Debug)]
pub struct SoftTimeoutHandler {
    messages: Vec<String>,
    index: AtomicUsize,
}

impl Default for SoftTimeoutHandler {
    fn default() -> Self {
        Self::new(ENGAGEMENT_MESSAGES.iter().map(|m| m.to_string()).collect())
    }
}

impl SoftTimeoutHandler {
    /// An empty list falls back to the built-in lines
    pub fn new(messages: Vec<String>) -> Self {
        let messages = if messages.is_empty() {
            ENGAGEMENT_MESSAGES.iter().map(|m| m.to_string()).collect()
        } else {
            messages
        };
        Self {
            messages,
            index: AtomicUsize::new(0),
        }
    }

    pub fn get_engagement_message(&self) -> &str {
        let i = self.index.fetch_add(1, Ordering::Relaxed);
        &self.messages[i % self.messages.len()]
    }
}

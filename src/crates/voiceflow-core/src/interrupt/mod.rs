//! Barge-in handling for voice calls
//!
//! When the caller talks over the agent, the partial agent output is stashed
//! and the next turn is prefixed with a continuation frame that carries both
//! the cut-off text and what the caller said.
//!
//! # State machine
//!
//! ```text
//!            check_for_interrupt / trigger_interrupt
//!   Idle ───────────────────────────────────────────► Interrupted
//!     ▲                                                │       │
//!     │                                await_followup  │       │ stash_response
//!     │                                                ▼       │ clear_interrupt
//!     │                                      AwaitingFollowup  │
//!     │                                                │       │
//!     │          next interrupt cycle                  ▼       ▼
//!     └──────────────────────────────────────────────  Resolved
//! ```
//!
//! - [`InterruptHandler`] drives the task-queue based cycle for one session.
//! - [`FollowupInterruptManager`] batches a trailing utterance inside a short
//!   wait window before the continuation is generated.
//! - [`TimeoutManager`] and [`SoftTimeoutHandler`] keep the line from going
//!   quiet while the agent works.
//!
//! Interrupt handling fails open: anything unexpected is logged and the turn
//! proceeds as if the caller had not interrupted.

mod followup;
mod handler;
mod timeout;

pub use followup::FollowupInterruptManager;
pub use handler::InterruptHandler;
pub use timeout::{SoftTimeoutHandler, TimeoutCallback, TimeoutManager};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Tuning for interrupt detection and continuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptConfig {
    /// Poll period for [`InterruptHandler::wait_for_interrupt`]
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_true")]
    pub include_stashed_in_continuation: bool,

    /// Stashes older than this are treated as absent
    #[serde(default = "default_max_stash_age_ms")]
    pub max_stash_age_ms: u64,

    #[serde(default = "default_true")]
    pub auto_clear: bool,

    /// Truncation bound for stashed text in the continuation frame
    #[serde(default = "default_max_stash_chars")]
    pub max_stash_chars: usize,

    #[serde(default = "default_followup_wait_ms")]
    pub followup_wait_ms: u64,
}

fn default_check_interval_ms() -> u64 {
    50
}

fn default_true() -> bool {
    true
}

fn default_max_stash_age_ms() -> u64 {
    30_000
}

fn default_max_stash_chars() -> usize {
    crate::workflow_state::DEFAULT_MAX_STASH_CHARS
}

fn default_followup_wait_ms() -> u64 {
    500
}

impl Default for InterruptConfig {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            include_stashed_in_continuation: true,
            max_stash_age_ms: default_max_stash_age_ms(),
            auto_clear: true,
            max_stash_chars: default_max_stash_chars(),
            followup_wait_ms: default_followup_wait_ms(),
        }
    }
}

impl InterruptConfig {
    /// Shorter follow-up window for live phone audio
    pub fn voice() -> Self {
        Self {
            followup_wait_ms: 300,
            ..Self::default()
        }
    }

    pub fn with_followup_wait_ms(mut self, ms: u64) -> Self {
        self.followup_wait_ms = ms;
        self
    }

    pub fn with_max_stash_age_ms(mut self, ms: u64) -> Self {
        self.max_stash_age_ms = ms;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptState {
    #[default]
    Idle,
    Interrupted,
    AwaitingFollowup,
    Resolved,
}

impl InterruptState {
    /// Interrupted or waiting on a follow-up
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Interrupted | Self::AwaitingFollowup)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InterruptReason {
    #[default]
    UserInterrupt,
    SystemInterrupt,
    Timeout,
    PriorityMessage,
    VoiceActivity,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RaisedInterrupt {
    pub reason: InterruptReason,
    pub message: Option<String>,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct SignalInner {
    raised: AtomicBool,
    pending: Mutex<Option<RaisedInterrupt>>,
}

/// Cross-task barge-in flag
///
/// The connection layer keeps a clone and raises it when the caller speaks
/// while a response is still streaming; the handler polls it alongside the
/// task queue.
#[derive(Debug, Clone, Default)]
pub struct InterruptSignal {
    inner: Arc<SignalInner>,
}

impl InterruptSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self, reason: InterruptReason, message: Option<String>) {
        *self.inner.pending.lock() = Some(RaisedInterrupt {
            reason,
            message,
            raised_at: Utc::now(),
        });
        self.inner.raised.store(true, Ordering::SeqCst);
    }

    /// O(1), lock-free
    pub fn is_raised(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Consume the pending interrupt, lowering the flag
    pub fn take(&self) -> Option<RaisedInterrupt> {
        self.inner.raised.store(false, Ordering::SeqCst);
        self.inner.pending.lock().take()
    }
}

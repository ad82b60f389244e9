//! Engine settings
//!
//! Settings resolve in three layers: compiled defaults, an optional TOML
//! file, then `VOICEFLOW_*` environment variables.
//!
//! ```toml
//! storage_backend = "file"
//! storage_path = "/var/lib/voiceflow"
//!
//! [timeouts]
//! soft_timeout_ms = 1200
//!
//! [endpoints]
//! init_url = "https://api.example.com/v1/calls/init"
//! ```

use crate::error::{Result, WorkflowError};
use crate::interrupt::InterruptConfig;
use crate::queue::{FileTaskStore, InMemoryTaskStore, TaskStore};
use crate::retry::RetryPolicy;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tracing::debug;
use voiceflow_checkpoint::{
    CheckpointStore, CheckpointerConfig, FileCheckpointStore, InMemoryCheckpointStore,
};

/// Compiled-in identifiers and copy
pub struct Defaults;

impl Defaults {
    pub const WORKFLOW_INIT: &'static str = "workflow_init";
    pub const FIRST_MESSAGE_MAKER: &'static str = "first_message_maker";
    pub const GREETING_ROUTING_AGENT: &'static str = "greeting_routing_agent";
    pub const TRANSFORMATION_TOOL: &'static str = "transformation_tool";
    pub const SERVICE_CHECK_AGENT: &'static str = "service_check_agent";
    pub const SERVICE_INFO_RETRIEVAL: &'static str = "service_info_retrieval";
    pub const SERVICE_GUIDELINES_AGENT: &'static str = "service_guidelines_agent";
    pub const BOOKING_TOOL: &'static str = "booking_tool";
    pub const FALLBACK_AGENT: &'static str = "fallback_agent";
    pub const HANDOVER_TOOL: &'static str = "handover_tool";
    pub const CANCELLATION_AGENT: &'static str = "cancellation_agent";
    pub const RESCHEDULE_AGENT: &'static str = "reschedule_agent";

    pub const FIRST_MESSAGE_OUTSIDE_HOURS_NEW: &'static str =
        "Hey, you have reached outside business hours. I still can help you.";
    pub const FIRST_MESSAGE_INSIDE_HOURS_NEW: &'static str = "Hey, how can I help you today?";
    pub const FIRST_MESSAGE_OUTSIDE_HOURS_EXISTING: &'static str =
        "Hey {guest_name}, you have reached outside business hours. I still can help you.";
    pub const FIRST_MESSAGE_INSIDE_HOURS_EXISTING: &'static str =
        "Hey {guest_name}, how can I help you today?";

    pub const FALLBACK_ERROR_RESPONSE: &'static str =
        "I apologize, something went wrong. How can I help you?";
    pub const GENERIC_APOLOGY: &'static str =
        "I apologize, something went wrong. Let me try again.";
    pub const TURN_TIMEOUT_PROMPT: &'static str =
        "Are you still there? Take your time, I'm here when you're ready.";

    pub const DEFAULT_AGENT_NAME: &'static str = "Atlas";
    pub const CHECKPOINT_STORAGE_PATH: &'static str = ".checkpoints";
    pub const MAX_CONVERSATION_MESSAGES: usize = 100;
    pub const MAX_CHECKPOINTS: usize = 50;
}

/// Soft and hard turn deadlines
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Engagement nudge fires after this much silence
    #[serde(default = "default_soft_timeout_ms")]
    pub soft_timeout_ms: u64,

    /// Waiting for the caller is abandoned after this long
    #[serde(default = "default_turn_timeout_ms")]
    pub turn_timeout_ms: u64,
}

fn default_soft_timeout_ms() -> u64 {
    1500
}

fn default_turn_timeout_ms() -> u64 {
    2000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            soft_timeout_ms: default_soft_timeout_ms(),
            turn_timeout_ms: default_turn_timeout_ms(),
        }
    }
}

impl TimeoutConfig {
    pub fn soft_timeout(&self) -> Duration {
        Duration::from_millis(self.soft_timeout_ms)
    }

    pub fn turn_timeout(&self) -> Duration {
        Duration::from_millis(self.turn_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Soft capacity; terminal tasks are evicted when reached
    #[serde(default = "default_queue_max_size")]
    pub max_size: usize,

    /// Terminal tasks evicted per cleanup pass
    #[serde(default = "default_cleanup_batch")]
    pub cleanup_batch: usize,
}

fn default_queue_max_size() -> usize {
    100
}

fn default_cleanup_batch() -> usize {
    10
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: default_queue_max_size(),
            cleanup_batch: default_cleanup_batch(),
        }
    }
}

/// External service endpoints used by tool nodes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub init_url: Option<String>,

    #[serde(default)]
    pub kb_search_url: Option<String>,

    #[serde(default = "default_http_timeout_ms")]
    pub http_timeout_ms: u64,
}

fn default_http_timeout_ms() -> u64 {
    30_000
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            init_url: None,
            kb_search_url: None,
            http_timeout_ms: default_http_timeout_ms(),
        }
    }
}

impl EndpointConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }
}

/// Where checkpoints and tasks are persisted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    #[default]
    File,
}

/// Top-level engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub storage_backend: StorageBackend,

    #[serde(default = "default_storage_path")]
    pub storage_path: PathBuf,

    #[serde(default = "default_max_conversation_messages")]
    pub max_conversation_messages: usize,

    #[serde(default = "default_max_checkpoints")]
    pub max_checkpoints: usize,

    #[serde(default)]
    pub checkpoint: CheckpointerConfig,

    #[serde(default)]
    pub timeouts: TimeoutConfig,

    #[serde(default)]
    pub interrupts: InterruptConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub endpoints: EndpointConfig,
}

fn default_storage_path() -> PathBuf {
    PathBuf::from(Defaults::CHECKPOINT_STORAGE_PATH)
}

fn default_max_conversation_messages() -> usize {
    Defaults::MAX_CONVERSATION_MESSAGES
}

fn default_max_checkpoints() -> usize {
    Defaults::MAX_CHECKPOINTS
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            storage_backend: StorageBackend::default(),
            storage_path: default_storage_path(),
            max_conversation_messages: default_max_conversation_messages(),
            max_checkpoints: default_max_checkpoints(),
            checkpoint: CheckpointerConfig::default(),
            timeouts: TimeoutConfig::default(),
            interrupts: InterruptConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            endpoints: EndpointConfig::default(),
        }
    }
}

impl Settings {
    /// In-memory storage, for tests and offline runs
    pub fn in_memory() -> Self {
        Self {
            storage_backend: StorageBackend::Memory,
            ..Self::default()
        }
    }

    /// Defaults, then `path` if given, then the environment
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::from_file(path).await?,
            None => Self::default(),
        };
        settings.apply_env();
        Ok(settings)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            WorkflowError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let settings = Self::from_toml(&content)?;
        debug!(path = %path.display(), "Loaded settings file");
        Ok(settings)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    /// Apply `VOICEFLOW_*` overrides from an arbitrary lookup
    ///
    /// Unparseable values are ignored.
    pub fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn parsed<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
        ) -> Option<T> {
            lookup(key).and_then(|v| v.trim().parse().ok())
        }

        match lookup("VOICEFLOW_STORAGE_BACKEND").as_deref() {
            Some("memory") => self.storage_backend = StorageBackend::Memory,
            Some("file") => self.storage_backend = StorageBackend::File,
            _ => {}
        }
        if let Some(path) = lookup("VOICEFLOW_STORAGE_PATH") {
            self.storage_path = PathBuf::from(path);
        }
        if let Some(url) = lookup("VOICEFLOW_INIT_URL") {
            self.endpoints.init_url = Some(url);
        }
        if let Some(url) = lookup("VOICEFLOW_KB_SEARCH_URL") {
            self.endpoints.kb_search_url = Some(url);
        }
        if let Some(ms) = parsed(&lookup, "VOICEFLOW_HTTP_TIMEOUT_MS") {
            self.endpoints.http_timeout_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "VOICEFLOW_SOFT_TIMEOUT_MS") {
            self.timeouts.soft_timeout_ms = ms;
        }
        if let Some(ms) = parsed(&lookup, "VOICEFLOW_TURN_TIMEOUT_MS") {
            self.timeouts.turn_timeout_ms = ms;
        }
        if let Some(days) = parsed(&lookup, "VOICEFLOW_CHECKPOINT_TTL_DAYS") {
            self.checkpoint.ttl_days = days;
        }
        if let Some(size) = parsed(&lookup, "VOICEFLOW_QUEUE_MAX_SIZE") {
            self.queue.max_size = size;
        }
        if let Some(n) = parsed(&lookup, "VOICEFLOW_MAX_CONVERSATION_MESSAGES") {
            self.max_conversation_messages = n;
        }
    }

    pub fn checkpoint_store(&self) -> Arc<dyn CheckpointStore> {
        match self.storage_backend {
            StorageBackend::Memory => Arc::new(InMemoryCheckpointStore::new()),
            StorageBackend::File => Arc::new(FileCheckpointStore::new(&self.storage_path)),
        }
    }

    /// Task store scoped to one session
    pub fn task_store(&self, session_id: &str) -> Result<Arc<dyn TaskStore>> {
        Ok(match self.storage_backend {
            StorageBackend::Memory => Arc::new(InMemoryTaskStore::new()),
            StorageBackend::File => Arc::new(FileTaskStore::for_session(
                &self.storage_path,
                session_id,
            )?),
        })
    }
}

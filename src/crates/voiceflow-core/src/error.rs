//! Error types for the workflow engine
//!
//! ```text
//! WorkflowError
//! ├── Validation         - Missing or malformed node input
//! ├── External           - Tool or collaborator failures
//! ├── Init               - Call initialization failed (fatal)
//! ├── InvalidTransition  - Illegal task state change
//! ├── NodeNotFound       - Routing to an unregistered node
//! ├── SessionNotStarted  - Executor used before start
//! ├── Config             - Settings could not be loaded
//! ├── Timeout            - Deadline exceeded
//! ├── Llm                - Model call failed
//! ├── Http               - Transport failure
//! ├── Checkpoint         - Persistence errors
//! ├── Serialization      - JSON errors
//! └── Io                 - Filesystem errors
//! ```
//!
//! Only [`WorkflowError::Init`] is expected to reach the telephony bridge.
//! Everything raised during a turn is converted into a
//! [`NodeOutput`](crate::nodes::NodeOutput) failure and routed to the
//! fallback node by the executor.

use crate::task::TaskState;
use thiserror::Error;
use voiceflow_checkpoint::CheckpointError;

/// Errors that can occur while running a call workflow
#[derive(Error, Debug)]
pub enum WorkflowError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("External service error: {0}")]
    External(String),

    #[error("Initialization failed: {0}")]
    Init(String),

    #[error("Invalid task transition from {from} to {to}")]
    InvalidTransition { from: TaskState, to: TaskState },

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Session not started")]
    SessionNotStarted,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<reqwest::Error> for WorkflowError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            WorkflowError::Http(format!("request timed out: {}", err))
        } else {
            WorkflowError::Http(err.to_string())
        }
    }
}

impl From<toml::de::Error> for WorkflowError {
    fn from(err: toml::de::Error) -> Self {
        WorkflowError::Config(err.to_string())
    }
}

/// Result type for workflow operations
pub type Result<T> = std::result::Result<T, WorkflowError>;

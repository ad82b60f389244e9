//! # voiceflow-core - Interrupt-aware workflow engine for voice booking calls
//!
//! `voiceflow-core` runs one phone call at a time through a graph of nodes.
//! Each call gets its own [`Session`], which owns the conversation, a
//! priority [`TaskQueue`], write-behind checkpoints and the workflow cursor.
//! The [`WorkflowExecutor`] feeds caller utterances through the
//! [`Workflow`] graph and always answers: failures are routed to a fallback
//! node, and a failing fallback becomes a short apology.
//!
//! ## Call lifecycle
//!
//! ```text
//!  execute_init(CallContext)
//!    ├── workflow_init          resolve call context from the init API
//!    └── first_message_maker    greeting for this caller
//!
//!  process_user_input(text)     one per utterance
//!    ├── node under the cursor
//!    ├── first matching edge    tool targets run in the same turn
//!    └── on failure             fallback node, then generic apology
//!
//!  cancel()                     abort background work, flush checkpoints
//! ```
//!
//! ## Tasks
//!
//! Callers change their minds. When the intent changes mid-task the current
//! [`Task`] is paused at its plan step and a higher-priority task takes
//! over. Paused tasks resume exactly where they stopped.
//!
//! ## Interrupts
//!
//! When the caller talks over the agent, the spoken part of the reply is
//! stashed and the next turn is prefixed with a continuation frame, so the
//! model knows what it was saying and what the caller cut in with. See
//! [`interrupt`].
//!
//! ## Quick start
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use voiceflow_core::{CallContext, ScriptedLlm, Settings, StaticInitClient, StaticKbSearch, Workflow, WorkflowExecutor};
//!
//! #[tokio::main]
//! async fn main() -> voiceflow_core::Result<()> {
//!     let workflow = Workflow::salon_booking(
//!         Arc::new(ScriptedLlm::new()),
//!         Arc::new(StaticInitClient::new(serde_json::json!({"first_name": "Ana"}))),
//!         Arc::new(StaticKbSearch::new()),
//!     );
//!     let mut executor = WorkflowExecutor::new(Arc::new(workflow), Settings::in_memory());
//!
//!     let init = executor.execute_init(CallContext::new("+15550100", "c1", "o1", "a1")).await?;
//!     println!("{}", init.first_message);
//!
//!     let turn = executor.process_user_input("I'd like a facial").await?;
//!     println!("{}", turn.response);
//!
//!     executor.cancel().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dynamic_vars;
pub mod edge;
pub mod error;
pub mod executor;
pub mod intent;
pub mod interrupt;
pub mod llm;
pub mod memory;
pub mod nodes;
pub mod queue;
pub mod retry;
pub mod session;
pub mod task;
pub mod tools;
pub mod workflow;
pub mod workflow_state;

pub use config::{Defaults, EndpointConfig, QueueConfig, Settings, StorageBackend, TimeoutConfig};
pub use dynamic_vars::DynamicVariables;
pub use edge::{
    BookingEdge, ConditionEdge, ConditionalEdge, Edge, EdgeCondition, EdgeContext, Operator, PassThrough,
    UnconditionalEdge,
};
pub use error::{Result, WorkflowError};
pub use executor::{InitResult, TurnResult, TurnStream, WorkflowExecutor};
pub use intent::{detect_intent, Intent};
pub use interrupt::{
    FollowupInterruptManager, InterruptConfig, InterruptHandler, InterruptReason, InterruptSignal, InterruptState,
    SoftTimeoutHandler, TimeoutCallback, TimeoutManager,
};
pub use llm::{Llm, LlmConfig, LlmMessage, LlmResponse, ScriptedLlm, ToolCall};
pub use memory::{ConversationHistory, ConversationMessage, Role, WorkingMemory};
pub use nodes::{ErrorKind, ExecutionContext, Node, NodeConfig, NodeKind, NodeOutput};
pub use queue::{FileTaskStore, InMemoryTaskStore, TaskQueue, TaskRecord, TaskStore};
pub use retry::RetryPolicy;
pub use session::Session;
pub use task::{Task, TaskPlan, TaskPriority, TaskState, TaskStep};
pub use tools::{
    CallContext, HttpInitClient, HttpKbSearch, InitClient, KbQuery, KbSearch, StaticInitClient, StaticKbSearch,
};
pub use workflow::Workflow;
pub use workflow_state::{StashedResponse, StepStatus, StepTracker, WorkflowState};

pub use voiceflow_checkpoint::{CheckpointError, CheckpointRecord, CheckpointStore, CheckpointerConfig};

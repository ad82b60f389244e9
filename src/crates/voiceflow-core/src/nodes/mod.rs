//! Workflow nodes
//!
//! A node is one step of the call graph. It receives the input map produced
//! by the previous edge, the call's [`Session`], and an [`ExecutionContext`],
//! and always returns a [`NodeOutput`]. Failures are values, never errors:
//! the executor routes a failed output to the fallback node.
//!
//! ```text
//! workflow_init ──► first_message_maker ──► greeting_routing_agent
//!                                                   │ booking_edge
//!                                                   ▼
//!                        fallback_agent ◄──── transformation_tool
//! ```
//!
//! Tool nodes call deterministic collaborators (HTTP APIs, the task queue).
//! Agent nodes call the [`Llm`](crate::llm::Llm).

mod fallback;
mod first_message;
mod greeting;
mod prompts;
mod transformation;
mod workflow_init;

pub use fallback::FallbackAgent;
pub use first_message::{FirstMessageNode, FirstMessageTemplates};
pub use greeting::GreetingRoutingAgent;
pub use transformation::{TransformationNode, KB_SEARCH_TASK};
pub use workflow_init::WorkflowInitNode;

use crate::error::{Result, WorkflowError};
use crate::session::Session;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::future::Future;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeKind {
    Tool,
    Agent,
}

/// Why a node failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Missing or malformed input
    Validation,
    /// A collaborator (HTTP API, LLM) failed
    External,
    /// The node ran past its deadline
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn of(err: &WorkflowError) -> Self {
        match err {
            WorkflowError::Validation(_) => ErrorKind::Validation,
            WorkflowError::Timeout(_) => ErrorKind::Timeout,
            WorkflowError::External(_) | WorkflowError::Http(_) | WorkflowError::Llm(_) => {
                ErrorKind::External
            }
            _ => ErrorKind::Internal,
        }
    }
}

/// Per-node tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Node to run when this one fails; the workflow default otherwise
    #[serde(default)]
    pub fallback_node: Option<String>,

    /// Extra operator instructions appended to agent prompts
    #[serde(default)]
    pub customer_instructions: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_max_retries() -> u32 {
    3
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
            fallback_node: None,
            customer_instructions: None,
        }
    }
}

impl NodeConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = ms;
        self
    }

    pub fn with_fallback(mut self, node_id: impl Into<String>) -> Self {
        self.fallback_node = Some(node_id.into());
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.customer_instructions = Some(instructions.into());
        self
    }
}

/// Identifies one node run within a call
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub execution_id: String,
    /// Zero for initialization, then one per caller utterance
    pub turn: u64,
    pub started_at: DateTime<Utc>,
}

impl ExecutionContext {
    pub fn new(workflow_id: impl Into<String>, turn: u64) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            execution_id: Uuid::new_v4().to_string(),
            turn,
            started_at: Utc::now(),
        }
    }
}

/// Result of one node run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeOutput {
    pub node_id: String,
    pub output: Map<String, Value>,
    pub success: bool,
    pub error: Option<String>,
    pub error_kind: Option<ErrorKind>,
    pub latency_ms: f64,
}

impl NodeOutput {
    pub fn success(node_id: impl Into<String>, output: Map<String, Value>) -> Self {
        Self {
            node_id: node_id.into(),
            output,
            success: true,
            error: None,
            error_kind: None,
            latency_ms: 0.0,
        }
    }

    pub fn failure(node_id: impl Into<String>, err: &WorkflowError) -> Self {
        Self {
            node_id: node_id.into(),
            output: Map::new(),
            success: false,
            error: Some(err.to_string()),
            error_kind: Some(ErrorKind::of(err)),
            latency_ms: 0.0,
        }
    }

    pub fn with_latency(mut self, elapsed: Duration) -> Self {
        self.latency_ms = elapsed.as_secs_f64() * 1000.0;
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.output.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.output.get(key).and_then(Value::as_str)
    }

    /// Text to speak back to the caller, if the node produced any
    pub fn response(&self) -> Option<&str> {
        self.get_str("response")
    }
}

/// Run a node body, timing it and folding its error into the output
pub async fn timed<F>(node_id: &str, body: F) -> NodeOutput
where
    F: Future<Output = Result<Map<String, Value>>>,
{
    let started = Instant::now();
    let output = match body.await {
        Ok(output) => NodeOutput::success(node_id, output),
        Err(err) => NodeOutput::failure(node_id, &err),
    };
    output.with_latency(started.elapsed())
}

/// A node run whose response is delivered in chunks
pub struct NodeStream {
    pub output: NodeOutput,
    pub chunks: BoxStream<'static, String>,
}

impl std::fmt::Debug for NodeStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeStream")
            .field("output", &self.output)
            .finish_non_exhaustive()
    }
}

#[async_trait]
pub trait Node: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> NodeKind;

    fn config(&self) -> &NodeConfig;

    async fn execute(
        &self,
        input: Map<String, Value>,
        session: &mut Session,
        ctx: &ExecutionContext,
    ) -> NodeOutput;

    /// Streaming variant of [`execute`](Self::execute)
    ///
    /// Nodes without token streaming deliver the whole response as one chunk.
    async fn stream(
        &self,
        input: Map<String, Value>,
        session: &mut Session,
        ctx: &ExecutionContext,
    ) -> NodeStream {
        let output = self.execute(input, session, ctx).await;
        let chunks = match output.response() {
            Some(text) if !text.is_empty() => stream::iter(vec![text.to_string()]).boxed(),
            _ => stream::empty().boxed(),
        };
        NodeStream { output, chunks }
    }

    /// Release pooled resources held by the node
    async fn close(&self) {}
}

/// String field of a node input, empty when absent
pub(crate) fn input_str<'a>(input: &'a Map<String, Value>, key: &str) -> &'a str {
    input.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Agent system prompt with the operator's instructions appended
pub(crate) fn with_instructions(prompt: String, config: &NodeConfig) -> String {
    match config.customer_instructions.as_deref().map(str::trim) {
        Some(extra) if !extra.is_empty() => format!("{}\n\nAdditional instructions:\n{}", prompt, extra),
        _ => prompt,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_timed_maps_errors_to_kinds() {
        let ok = timed("n", async { Ok(Map::new()) }).await;
        assert!(ok.success);
        assert!(ok.error_kind.is_none());

        let invalid = timed("n", async {
            Err(WorkflowError::Validation("no service names".into()))
        })
        .await;
        assert!(!invalid.success);
        assert_eq!(invalid.error_kind, Some(ErrorKind::Validation));
        assert!(invalid.error.unwrap().contains("no service names"));

        let external = timed("n", async { Err(WorkflowError::Llm("overloaded".into())) }).await;
        assert_eq!(external.error_kind, Some(ErrorKind::External));
    }

    #[test]
    fn test_node_config_defaults() {
        let config: NodeConfig = serde_json::from_value(json!({"fallback_node": "x"})).unwrap();
        assert_eq!(config.timeout_ms, 30_000);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.fallback_node.as_deref(), Some("x"));
    }

    #[test]
    fn test_instructions_appended_only_when_present() {
        let plain = NodeConfig::default();
        assert_eq!(with_instructions("base".into(), &plain), "base");

        let custom = NodeConfig::default().with_instructions("Never upsell.");
        assert!(with_instructions("base".into(), &custom).ends_with("Never upsell."));
    }
}

//! Per-call driver of a [`Workflow`]
//!
//! One executor serves one call. It owns the call's [`Session`] and runs
//! nodes strictly one after another:
//!
//! 1. `execute_init` runs `workflow_init` then `first_message_maker` and
//!    parks the cursor on the workflow's start node. Failures here are fatal.
//! 2. Each `process_user_input` runs the node under the cursor, then follows
//!    the first matching edge. Tool targets run in the same turn; agent
//!    targets wait for the next utterance.
//! 3. A failed node, or a cursor on an unknown node, is handed to the
//!    fallback node. If that fails too the caller hears a generic apology.
//!    A turn never returns an error once the session is started.

use crate::config::{Defaults, Settings};
use crate::dynamic_vars::DynamicVariables;
use crate::edge::EdgeContext;
use crate::error::{Result, WorkflowError};
use crate::interrupt::{InterruptHandler, SoftTimeoutHandler, TimeoutCallback, TimeoutManager};
use crate::nodes::{ExecutionContext, Node, NodeKind, NodeOutput};
use crate::session::Session;
use crate::tools::CallContext;
use crate::workflow::Workflow;
use futures::stream::{self, BoxStream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Upper bound on tool nodes chained within one turn
const MAX_CHAINED_TOOLS: usize = 8;

/// What the caller hears first
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitResult {
    pub first_message: String,
    pub session_id: String,
    pub dynamic_variables: DynamicVariables,
}

/// Outcome of one caller utterance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnResult {
    pub response: String,
    /// Where the cursor rests for the next turn
    pub next_node: Option<String>,
    pub detected_intent: Option<String>,
    pub tool_calls: Vec<Value>,
    /// A node failed and the fallback node answered instead
    pub error_handled: bool,
    pub error: Option<String>,
}

/// A turn whose response is delivered in chunks
///
/// Chunks stop early if the caller barges in; the part already spoken is
/// stashed for the next turn.
pub struct TurnStream<'a> {
    pub result: TurnResult,
    pub chunks: BoxStream<'a, String>,
}

pub struct WorkflowExecutor {
    workflow: Arc<Workflow>,
    settings: Settings,
    session: Option<Session>,
    interrupts: InterruptHandler,
    timeouts: TimeoutManager,
    engagement: Arc<SoftTimeoutHandler>,
    turn: u64,
    running: bool,
}

impl WorkflowExecutor {
    pub fn new(workflow: Arc<Workflow>, settings: Settings) -> Self {
        Self {
            interrupts: InterruptHandler::new(settings.interrupts.clone()),
            timeouts: TimeoutManager::new(&settings.timeouts),
            engagement: Arc::new(SoftTimeoutHandler::default()),
            workflow,
            settings,
            session: None,
            turn: 0,
            running: false,
        }
    }

    pub fn workflow(&self) -> &Workflow {
        &self.workflow
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    pub fn interrupt_handler(&mut self) -> &mut InterruptHandler {
        &mut self.interrupts
    }

    pub fn current_node(&self) -> Option<&str> {
        self.session.as_ref().and_then(Session::get_current_node)
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// Next rotating filler line for a slow turn
    pub fn engagement_message(&self) -> String {
        self.engagement.get_engagement_message().to_string()
    }

    pub fn engagement_handler(&self) -> Arc<SoftTimeoutHandler> {
        Arc::clone(&self.engagement)
    }

    pub fn set_soft_timeout_callback(&mut self, callback: TimeoutCallback) {
        self.timeouts.set_soft_timeout_callback(callback);
    }

    pub fn set_turn_timeout_callback(&mut self, callback: TimeoutCallback) {
        self.timeouts.set_turn_timeout_callback(callback);
    }

    /// Create and start the session; returns its id
    ///
    /// A second call keeps the existing session.
    pub async fn start(&mut self, session_id: Option<String>) -> Result<String> {
        if let Some(session) = &self.session {
            return Ok(session.session_id().to_string());
        }
        let session_id = session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let mut session = Session::with_id(session_id.clone(), &self.settings)?;
        session.start().await;
        session.move_to_node(self.workflow.start_node());
        self.session = Some(session);
        self.running = true;
        Ok(session_id)
    }

    /// Resolve the call context and build the greeting
    pub async fn execute_init(&mut self, call: CallContext) -> Result<InitResult> {
        self.start(None).await?;
        let session = self.session.as_mut().ok_or(WorkflowError::SessionNotStarted)?;
        let ctx = ExecutionContext::new(self.workflow.id(), 0);

        let input = match serde_json::to_value(&call)? {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        let mut first_message = String::new();
        for node_id in [Defaults::WORKFLOW_INIT, Defaults::FIRST_MESSAGE_MAKER] {
            let node = self
                .workflow
                .get_node(node_id)
                .ok_or_else(|| WorkflowError::Init(format!("{} is not registered", node_id)))?;
            session.move_to_node(node_id);
            let output = execute_node(node.as_ref(), input.clone(), session, &ctx).await;
            if !output.success {
                return Err(WorkflowError::Init(format!(
                    "{} failed: {}",
                    node_id,
                    output.error.unwrap_or_default()
                )));
            }
            if let Some(message) = output.get_str("first_message") {
                first_message = message.to_string();
            }
        }

        let start_node = self.workflow.start_node().to_string();
        session.move_to_node(&start_node);
        session.save_checkpoint(Some("init"), Some(json!({"turn": 0, "node": start_node})));
        self.timeouts.start_waiting();
        info!(session_id = %session.session_id(), caller = %call.caller_id, "Call initialized");

        Ok(InitResult {
            first_message,
            session_id: session.session_id().to_string(),
            dynamic_variables: session.dynamic_vars().cloned().unwrap_or_default(),
        })
    }

    /// Run one caller utterance through the graph
    ///
    /// Errors only with [`WorkflowError::SessionNotStarted`]; node failures
    /// come back as a fallback or apology response.
    pub async fn process_user_input(&mut self, text: &str) -> Result<TurnResult> {
        let session = self.session.as_mut().ok_or(WorkflowError::SessionNotStarted)?;
        self.timeouts.stop_waiting();
        self.running = true;
        session.harvest_background().await;

        let user_input = splice_continuation(&mut self.interrupts, session, text);
        self.turn += 1;
        let result = run_turn(&self.workflow, session, &user_input, self.turn).await;

        session.save_checkpoint(
            None,
            Some(json!({"turn": self.turn, "node": result.next_node})),
        );
        self.timeouts.start_waiting();
        Ok(result)
    }

    /// [`process_user_input`](Self::process_user_input) with the response
    /// streamed sentence by sentence
    pub async fn stream_user_input(&mut self, text: &str) -> Result<TurnStream<'_>> {
        let result = self.process_user_input(text).await?;
        let chunks = sentence_chunks(&result.response);
        let session = self.session.as_mut().ok_or(WorkflowError::SessionNotStarted)?;
        let chunks = self
            .interrupts
            .interrupt_aware(session, stream::iter(chunks))
            .boxed();
        Ok(TurnStream { result, chunks })
    }

    /// Stop the timers and snapshot the session
    pub async fn pause(&mut self) -> bool {
        let Some(session) = &self.session else {
            return false;
        };
        self.timeouts.stop_waiting();
        session.save_checkpoint(Some("pause"), Some(json!({"turn": self.turn, "paused": true})));
        self.running = false;
        debug!(session_id = %session.session_id(), "Executor paused");
        true
    }

    /// Close and drop the session, flushing checkpoints and aborting
    /// background work
    ///
    /// Later turns fail with [`WorkflowError::SessionNotStarted`].
    pub async fn cancel(&mut self) -> bool {
        self.timeouts.stop_waiting();
        self.running = false;
        match self.session.take() {
            Some(mut session) => {
                session.close().await;
                true
            }
            None => false,
        }
    }
}

/// Prefix the utterance with the continuation frame of an interrupted reply
fn splice_continuation(interrupts: &mut InterruptHandler, session: &mut Session, text: &str) -> String {
    if !interrupts.is_interrupted(session) {
        return text.to_string();
    }
    let continuation = interrupts.get_continuation_context(session);
    interrupts.clear_interrupt(session);
    match continuation {
        Some(context) => format!("{}\n\nUser: {}", context, text),
        None => text.to_string(),
    }
}

async fn execute_node(
    node: &dyn Node,
    input: Map<String, Value>,
    session: &mut Session,
    ctx: &ExecutionContext,
) -> NodeOutput {
    let timeout = node.config().timeout();
    match tokio::time::timeout(timeout, node.execute(input, session, ctx)).await {
        Ok(output) => {
            debug!(node = %node.id(), success = output.success, latency_ms = output.latency_ms, "Node finished");
            output
        }
        Err(_) => NodeOutput::failure(
            node.id(),
            &WorkflowError::Timeout(timeout.as_millis() as u64),
        ),
    }
}

enum Step {
    Run {
        node_id: String,
        input: Map<String, Value>,
    },
    Recover {
        failed: String,
        fallback: Option<String>,
        error: String,
    },
}

#[derive(Default)]
struct TurnAccumulator {
    responses: Vec<String>,
    detected_intent: Option<String>,
    tool_calls: Vec<Value>,
    error_handled: bool,
    error: Option<String>,
}

impl TurnAccumulator {
    fn absorb(&mut self, output: &NodeOutput) {
        if let Some(text) = output.response().filter(|t| !t.trim().is_empty()) {
            self.responses.push(text.to_string());
        }
        if let Some(intent) = output.get_str("detected_intent") {
            self.detected_intent = Some(intent.to_string());
        }
        if let Some(Value::Array(calls)) = output.get("tool_calls") {
            self.tool_calls.extend(calls.iter().cloned());
        }
    }

    fn finish(self, session: &Session) -> TurnResult {
        let mut response = self.responses.join(" ");
        if response.is_empty() && self.error_handled {
            response = Defaults::FALLBACK_ERROR_RESPONSE.to_string();
        }
        TurnResult {
            response,
            next_node: session.get_current_node().map(str::to_string),
            detected_intent: self.detected_intent,
            tool_calls: self.tool_calls,
            error_handled: self.error_handled,
            error: self.error,
        }
    }

    fn apology(self, session: &Session) -> TurnResult {
        TurnResult {
            response: Defaults::GENERIC_APOLOGY.to_string(),
            next_node: session.get_current_node().map(str::to_string),
            detected_intent: self.detected_intent,
            tool_calls: self.tool_calls,
            error_handled: false,
            error: self.error,
        }
    }
}

fn user_input_map(user_input: &str) -> Map<String, Value> {
    let mut input = Map::new();
    input.insert("user_input".into(), Value::String(user_input.to_string()));
    input
}

/// First matching edge out of the node that produced `output`
///
/// `None` keeps the cursor where it is: no edge matched, or the matching
/// edge lacks a required field the current node should ask for.
fn next_hop(workflow: &Workflow, session: &Session, output: &NodeOutput) -> Option<(String, Map<String, Value>)> {
    let ctx = EdgeContext::new(&output.output, session);
    let edge = workflow
        .edges_from(&output.node_id)
        .iter()
        .find(|edge| edge.should_traverse(&ctx))?;
    let missing = edge.missing_required_fields(&output.output);
    if !missing.is_empty() {
        debug!(edge = %edge.id(), missing = ?missing, "Edge matched without required fields, staying");
        return None;
    }
    debug!(edge = %edge.id(), target = %edge.target(), "Edge traversed");
    Some((edge.target().to_string(), edge.transform_data(&output.output)))
}

async fn run_turn(workflow: &Workflow, session: &mut Session, user_input: &str, turn: u64) -> TurnResult {
    let ctx = ExecutionContext::new(workflow.id(), turn);
    let current = session
        .get_current_node()
        .unwrap_or(workflow.start_node())
        .to_string();

    let mut acc = TurnAccumulator::default();
    let mut step = Step::Run {
        node_id: current,
        input: user_input_map(user_input),
    };
    let mut chained = 0;
    let mut recovering = false;

    loop {
        step = match step {
            Step::Run { node_id, input } => {
                let Some(node) = workflow.get_node(&node_id) else {
                    step = Step::Recover {
                        error: WorkflowError::NodeNotFound(node_id.clone()).to_string(),
                        failed: node_id,
                        fallback: None,
                    };
                    continue;
                };
                let output = execute_node(node.as_ref(), input, session, &ctx).await;
                if !output.success {
                    step = Step::Recover {
                        failed: node_id,
                        fallback: node.config().fallback_node.clone(),
                        error: output.error.unwrap_or_else(|| "node failed".to_string()),
                    };
                    continue;
                }
                acc.absorb(&output);

                let Some((target, data)) = next_hop(workflow, session, &output) else {
                    break;
                };
                session.move_to_node(&target);
                let chain = chained < MAX_CHAINED_TOOLS
                    && workflow
                        .get_node(&target)
                        .map_or(false, |n| n.kind() == NodeKind::Tool);
                if !chain {
                    break;
                }
                chained += 1;
                let mut input = data;
                input
                    .entry("user_input")
                    .or_insert_with(|| Value::String(user_input.to_string()));
                Step::Run { node_id: target, input }
            }
            Step::Recover { failed, fallback, error } => {
                session.add_error(error.clone(), Some(&failed));
                acc.error = Some(error.clone());
                let fallback_id = fallback.unwrap_or_else(|| workflow.fallback_node().to_string());
                if recovering || fallback_id == failed || !workflow.has_node(&fallback_id) {
                    error!(node = %failed, fallback = %fallback_id, error = %error, "Fallback unavailable, apologizing");
                    return acc.apology(session);
                }
                warn!(node = %failed, fallback = %fallback_id, error = %error, "Node failed, routing to fallback");
                recovering = true;
                acc.error_handled = true;
                session.move_to_node(&fallback_id);

                let mut input = user_input_map(user_input);
                input.insert("error_context".into(), Value::String(error));
                Step::Run {
                    node_id: fallback_id,
                    input,
                }
            }
        };
    }
    acc.finish(session)
}

/// Split a reply at sentence ends, keeping the punctuation and spacing
fn sentence_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for word in text.split_inclusive(' ') {
        current.push_str(word);
        if word.trim_end().ends_with(&['.', '?', '!'][..]) {
            chunks.push(std::mem::take(&mut current));
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

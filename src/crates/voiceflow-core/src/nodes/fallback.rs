use super::prompts::{self, TaskContext, HANDOVER_CALL, ROUTE_TO_BOOKING};
use super::{input_str, timed, with_instructions, ExecutionContext, Node, NodeConfig, NodeKind, NodeOutput};
use crate::config::Defaults;
use crate::error::Result;
use crate::intent::{detect_intent, Intent};
use crate::llm::{Llm, LlmConfig};
use crate::session::Session;
use crate::task::{Task, TaskPriority};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, info};

/// Handles topic switches without losing unfinished work
///
/// When the caller moves to a different intent mid-task, the current task is
/// paused at its current plan step and a high-priority task for the new
/// intent is created and started. Input may carry an `error_context` when
/// the executor routed here after a node failure.
pub struct FallbackAgent {
    id: String,
    config: NodeConfig,
    llm: Arc<dyn Llm>,
    llm_config: LlmConfig,
    history_window: usize,
}

impl FallbackAgent {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self {
            id: Defaults::FALLBACK_AGENT.to_string(),
            config: NodeConfig::default(),
            llm,
            llm_config: LlmConfig {
                temperature: 0.7,
                max_tokens: Some(400),
                ..LlmConfig::default()
            }
            .with_tools([ROUTE_TO_BOOKING, HANDOVER_CALL]),
            history_window: 20,
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    async fn run(&self, input: &Map<String, Value>, session: &mut Session) -> Result<Map<String, Value>> {
        let user_input = input_str(input, "user_input");
        let intent = detect_intent(user_input);
        let current = session.get_current_task().await;
        let paused_count = session.queue().get_paused().await.len();

        let mut ctx = TaskContext {
            queue_count: session.queue().pending_count(),
            paused_count,
            detected_intent: intent.to_string(),
            error_context: input
                .get("error_context")
                .and_then(Value::as_str)
                .map(str::to_string),
            ..TaskContext::default()
        };
        if let Some(task) = &current {
            ctx.current_task = Some(format!("{}: {}", task.intent, task.original_input));
            ctx.task_state = task.state.to_string();
            if let Some(plan) = &task.plan {
                ctx.current_step = plan.get_current_step().map(|s| s.step_name.clone());
                ctx.pending_steps = plan
                    .get_pending_steps()
                    .into_iter()
                    .map(|s| s.step_name.clone())
                    .collect();
            }
        }

        let system = with_instructions(prompts::fallback_prompt(&ctx), &self.config);
        let messages = prompts::conversation(
            system,
            session.get_llm_messages(Some(self.history_window)),
            user_input,
        );

        let mut task_switched = false;
        if let Some(task) = current.as_ref().filter(|t| should_switch(Some(*t), intent)) {
            session
                .pause_task(&task.task_id, Some(format!("User switched to: {}", intent)))
                .await;
            let new_task = session
                .create_task(intent, user_input, TaskPriority::High)
                .await;
            session.start_task(&new_task.task_id).await?;
            task_switched = true;
            info!(
                paused = %task.task_id,
                started = %new_task.task_id,
                intent = %intent,
                "Switched task"
            );
        }

        let response = self.llm.get_answer(&messages, &self.llm_config).await?;

        if !user_input.is_empty() {
            session.add_user_message(user_input);
        }
        if !response.content.is_empty() {
            session.add_assistant_message(response.content.clone());
        }

        let routed = response.tool_call(ROUTE_TO_BOOKING);
        let next_node = if routed.is_some() {
            Some(Defaults::TRANSFORMATION_TOOL)
        } else if response.tool_call(HANDOVER_CALL).is_some() {
            Some(Defaults::HANDOVER_TOOL)
        } else {
            next_node_for(intent)
        };
        let service_names = routed.map(prompts::service_names).unwrap_or_default();
        debug!(intent = %intent, next_node = ?next_node, "Fallback handled turn");

        let mut output = Map::new();
        output.insert("response".into(), Value::String(response.content.clone()));
        output.insert("detected_intent".into(), Value::String(intent.to_string()));
        output.insert("task_switched".into(), Value::Bool(task_switched));
        output.insert("next_node".into(), json!(next_node));
        output.insert("paused_tasks_count".into(), json!(paused_count));
        output.insert("service_names".into(), json!(service_names));
        output.insert("tool_calls".into(), serde_json::to_value(&response.tool_calls)?);
        Ok(output)
    }
}

/// Switch unless the intent is unchanged or unclear
pub(crate) fn should_switch(current: Option<&Task>, intent: Intent) -> bool {
    match current {
        None => true,
        Some(task) => task.intent != intent && intent != Intent::Unknown,
    }
}

fn next_node_for(intent: Intent) -> Option<&'static str> {
    match intent {
        Intent::Book => Some(Defaults::TRANSFORMATION_TOOL),
        Intent::Cancel => Some(Defaults::CANCELLATION_AGENT),
        Intent::Reschedule => Some(Defaults::RESCHEDULE_AGENT),
        Intent::Handover => Some(Defaults::HANDOVER_TOOL),
        Intent::Faq | Intent::Unknown => None,
    }
}

#[async_trait]
impl Node for FallbackAgent {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> NodeKind {
        NodeKind::Agent
    }

    fn config(&self) -> &NodeConfig {
        &self.config
    }

    async fn execute(
        &self,
        input: Map<String, Value>,
        session: &mut Session,
        _ctx: &ExecutionContext,
    ) -> NodeOutput {
        timed(&self.id, self.run(&input, session)).await
    }
}

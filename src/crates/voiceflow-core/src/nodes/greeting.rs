use super::prompts::{self, HANDOVER_CALL, ROUTE_TO_BOOKING};
use super::{input_str, timed, with_instructions, ExecutionContext, Node, NodeConfig, NodeKind, NodeOutput};
use crate::config::Defaults;
use crate::error::Result;
use crate::intent::{detect_intent, Intent};
use crate::llm::{Llm, LlmConfig};
use crate::session::Session;
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::debug;

/// First conversational node: answers the caller and picks a route
///
/// Output fields: `response`, `detected_intent`, `service_names`,
/// `tool_calls` and `next_edge` (`"booking_edge"`, `"handover_edge"` or
/// null). A routing tool call outranks keyword detection.
pub struct GreetingRoutingAgent {
    id: String,
    config: NodeConfig,
    llm: Arc<dyn Llm>,
    llm_config: LlmConfig,
    history_window: usize,
}

impl GreetingRoutingAgent {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self {
            id: Defaults::GREETING_ROUTING_AGENT.to_string(),
            config: NodeConfig::default().with_fallback(Defaults::FALLBACK_AGENT),
            llm,
            llm_config: LlmConfig::default().with_tools([ROUTE_TO_BOOKING, HANDOVER_CALL]),
            history_window: 20,
        }
    }

    pub fn with_config(mut self, config: NodeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_llm_config(mut self, llm_config: LlmConfig) -> Self {
        self.llm_config = llm_config;
        self
    }

    async fn run(&self, input: &Map<String, Value>, session: &mut Session) -> Result<Map<String, Value>> {
        let user_input = input_str(input, "user_input");
        let system = with_instructions(prompts::greeting_prompt(session.dynamic_vars()), &self.config);
        let messages = prompts::conversation(
            system,
            session.get_llm_messages(Some(self.history_window)),
            user_input,
        );

        let response = self.llm.get_answer(&messages, &self.llm_config).await?;

        let routed = response.tool_call(ROUTE_TO_BOOKING);
        let handover = response.tool_call(HANDOVER_CALL).is_some();
        let (intent, next_edge) = if routed.is_some() {
            (Intent::Book, Some("booking_edge"))
        } else if handover {
            (Intent::Handover, Some("handover_edge"))
        } else {
            (detect_intent(user_input), None)
        };
        let service_names = routed.map(prompts::service_names).unwrap_or_default();

        if !user_input.is_empty() {
            session.add_user_message(user_input);
        }
        if !response.content.is_empty() {
            session.add_assistant_message(response.content.clone());
        }
        debug!(intent = %intent, services = service_names.len(), "Greeting routed");

        let mut output = Map::new();
        output.insert("response".into(), Value::String(response.content.clone()));
        output.insert("detected_intent".into(), Value::String(intent.to_string()));
        output.insert("service_names".into(), json!(service_names));
        output.insert("tool_calls".into(), serde_json::to_value(&response.tool_calls)?);
        output.insert("next_edge".into(), json!(next_edge));
        Ok(output)
    }
}

#[async_trait]
impl Node for GreetingRoutingAgent {
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

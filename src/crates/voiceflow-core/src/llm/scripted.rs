use super::{Llm, LlmConfig, LlmMessage, LlmResponse, ToolCall};
use crate::error::{Result, WorkflowError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone)]
enum Scripted {
    Reply(LlmResponse),
    Fail(String),
}

#[derive(Debug, Default)]
struct ScriptState {
    script: VecDeque<Scripted>,
    calls: Vec<Vec<LlmMessage>>,
}

/// Replays canned responses in order
///
/// Once the script runs out every call gets the fallback reply. Clones share
/// the script and the call log, so a test can keep one handle and give the
/// other to a node.
#[derive(Debug, Clone)]
pub struct ScriptedLlm {
    state: Arc<Mutex<ScriptState>>,
    fallback: LlmResponse,
    latency: Option<Duration>,
}

impl Default for ScriptedLlm {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedLlm {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ScriptState::default())),
            fallback: LlmResponse::text("How can I help you today?"),
            latency: None,
        }
    }

    pub fn with_reply(self, content: impl Into<String>) -> Self {
        self.with_response(LlmResponse::text(content))
    }

    pub fn with_response(self, response: LlmResponse) -> Self {
        self.state.lock().script.push_back(Scripted::Reply(response));
        self
    }

    /// Reply that also requests `tool` with `arguments`
    pub fn with_tool_reply(
        self,
        content: impl Into<String>,
        tool: &str,
        arguments: serde_json::Value,
    ) -> Self {
        let call_id = format!("call_{}", self.state.lock().script.len());
        self.with_response(
            LlmResponse::text(content).with_tool_call(ToolCall::new(call_id, tool, arguments)),
        )
    }

    pub fn with_failure(self, message: impl Into<String>) -> Self {
        self.state.lock().script.push_back(Scripted::Fail(message.into()));
        self
    }

    pub fn with_fallback(mut self, content: impl Into<String>) -> Self {
        self.fallback = LlmResponse::text(content);
        self
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Messages received by the most recent call
    pub fn last_messages(&self) -> Option<Vec<LlmMessage>> {
        self.state.lock().calls.last().cloned()
    }
}

#[async_trait]
impl Llm for ScriptedLlm {
    async fn get_answer(&self, messages: &[LlmMessage], _config: &LlmConfig) -> Result<LlmResponse> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        let next = {
            let mut state = self.state.lock();
            state.calls.push(messages.to_vec());
            state.script.pop_front()
        };

        match next {
            Some(Scripted::Reply(response)) => Ok(response),
            Some(Scripted::Fail(message)) => Err(WorkflowError::Llm(message)),
            None => Ok(self.fallback.clone()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_replays_script_then_fallback() {
        let llm = ScriptedLlm::new()
            .with_reply("first")
            .with_failure("model overloaded")
            .with_fallback("again?");
        let config = LlmConfig::default();
        let messages = [LlmMessage::user("hi")];

        assert_eq!(llm.get_answer(&messages, &config).await.unwrap().content, "first");
        let err = llm.get_answer(&messages, &config).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Llm(ref m) if m == "model overloaded"));
        assert_eq!(llm.get_answer(&messages, &config).await.unwrap().content, "again?");
        assert_eq!(llm.call_count(), 3);
    }

    #[tokio::test]
    async fn test_clones_share_call_log() {
        let llm = ScriptedLlm::new().with_tool_reply(
            "Let me book that",
            "route_to_booking",
            json!({"service_names": ["Massage"]}),
        );
        let handle = llm.clone();

        let response = llm
            .get_answer(&[LlmMessage::user("book a massage")], &LlmConfig::default())
            .await
            .unwrap();

        let call = response.tool_call("route_to_booking").unwrap();
        assert_eq!(call.arguments["service_names"][0], "Massage");
        assert_eq!(handle.call_count(), 1);
        assert_eq!(handle.last_messages().unwrap()[0].content, "book a massage");
    }
}

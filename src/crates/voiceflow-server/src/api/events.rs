//! Websocket wire format
//!
//! Both directions are JSON objects tagged by `event`.

use serde::{Deserialize, Serialize};
use voiceflow_core::{CallContext, InitResult, TurnResult};

/// Inbound event from the telephony bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallEvent {
    /// Call connected; runs init and returns the greeting
    Start { call: CallContext },

    /// One finished caller utterance
    Media { transcript: String },

    /// Caller hung up
    Stop,
}

/// Outbound event to the telephony bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum CallResponse {
    Greeting {
        session_id: String,
        message: String,
    },

    Reply {
        response: String,
        #[serde(default)]
        next_node: Option<String>,
        #[serde(default)]
        detected_intent: Option<String>,
    },

    Error {
        message: String,
    },

    /// Unprompted line while the caller is silent
    Prompt {
        reason: PromptReason,
        message: String,
    },

    Closed,
}

/// Which timer produced a [`CallResponse::Prompt`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PromptReason {
    /// Engagement nudge; the turn keeps waiting
    SoftTimeout,
    /// Waiting gave up; the agent re-prompts
    TurnTimeout,
}

impl CallResponse {
    pub fn error(message: impl Into<String>) -> Self {
        CallResponse::Error {
            message: message.into(),
        }
    }
}

impl From<InitResult> for CallResponse {
    fn from(init: InitResult) -> Self {
        CallResponse::Greeting {
            session_id: init.session_id,
            message: init.first_message,
        }
    }
}

impl From<TurnResult> for CallResponse {
    fn from(turn: TurnResult) -> Self {
        CallResponse::Reply {
            response: turn.response,
            next_node: turn.next_node,
            detected_intent: turn.detected_intent,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_event_deserialization() {
        let event: CallEvent = serde_json::from_value(json!({
            "event": "start",
            "call": {
                "caller_id": "+15550100",
                "center_id": "center-1",
                "org_id": "org-1",
                "agent_id": "agent-1"
            }
        }))
        .unwrap();

        match event {
            CallEvent::Start { call } => {
                assert_eq!(call.caller_id, "+15550100");
                assert!(call.called_number.is_empty());
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_media_and_stop_events() {
        let media: CallEvent = serde_json::from_str(r#"{"event":"media","transcript":"hi"}"#).unwrap();
        assert_eq!(media, CallEvent::Media { transcript: "hi".into() });

        let stop: CallEvent = serde_json::from_str(r#"{"event":"stop"}"#).unwrap();
        assert_eq!(stop, CallEvent::Stop);

        assert!(serde_json::from_str::<CallEvent>(r#"{"event":"dtmf"}"#).is_err());
    }

    #[test]
    fn test_reply_from_turn() {
        let turn = TurnResult {
            response: "Sure.".into(),
            next_node: Some("fallback_agent".into()),
            detected_intent: Some("BOOK".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(CallResponse::from(turn)).unwrap();
        assert_eq!(
            value,
            json!({
                "event": "reply",
                "response": "Sure.",
                "next_node": "fallback_agent",
                "detected_intent": "BOOK"
            })
        );
    }

    #[test]
    fn test_prompt_serialization() {
        let prompt = CallResponse::Prompt {
            reason: PromptReason::SoftTimeout,
            message: "Just a moment...".into(),
        };
        assert_eq!(
            serde_json::to_value(prompt).unwrap(),
            json!({"event": "prompt", "reason": "soft_timeout", "message": "Just a moment..."})
        );
    }

    #[test]
    fn test_closed_serialization() {
        let json = serde_json::to_string(&CallResponse::Closed).unwrap();
        assert_eq!(json, r#"{"event":"closed"}"#);
    }
}

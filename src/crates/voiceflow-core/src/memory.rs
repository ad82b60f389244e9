//! Working memory: bounded conversation history plus a variable map
//!
//! History keeps the most recent `max_messages` entries; older ones are
//! dropped from the front as new ones arrive.

use crate::llm::LlmMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub metadata: Map<String, Value>,
    pub timestamp: DateTime<Utc>,
}

impl ConversationMessage {
    pub fn new(role: Role, content: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            metadata,
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationHistory {
    messages: VecDeque<ConversationMessage>,
    max_messages: usize,
}

impl ConversationHistory {
    pub fn new(max_messages: usize) -> Self {
        Self {
            messages: VecDeque::new(),
            max_messages: max_messages.max(1),
        }
    }

    /// Append and return the message id
    pub fn add(&mut self, message: ConversationMessage) -> String {
        let id = message.id.clone();
        self.messages.push_back(message);
        while self.messages.len() > self.max_messages {
            self.messages.pop_front();
        }
        id
    }

    /// The `max` most recent messages in model format, oldest first
    pub fn to_llm_messages(&self, max: Option<usize>) -> Vec<LlmMessage> {
        let skip = max.map_or(0, |max| self.messages.len().saturating_sub(max));
        self.messages
            .iter()
            .skip(skip)
            .map(|m| LlmMessage::new(m.role, m.content.clone()))
            .collect()
    }

    pub fn last_by_role(&self, role: Role) -> Option<&ConversationMessage> {
        self.messages.iter().rev().find(|m| m.role == role)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConversationMessage> {
        self.messages.iter()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub fn clear(&mut self) {
        self.messages.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingMemory {
    pub session_id: String,
    pub conversation: ConversationHistory,
    #[serde(default)]
    pub variables: Map<String, Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkingMemory {
    pub fn new(session_id: impl Into<String>, max_messages: usize) -> Self {
        let now = Utc::now();
        Self {
            session_id: session_id.into(),
            conversation: ConversationHistory::new(max_messages),
            variables: Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn add_message(
        &mut self,
        role: Role,
        content: impl Into<String>,
        metadata: Map<String, Value>,
    ) -> String {
        self.updated_at = Utc::now();
        self.conversation
            .add(ConversationMessage::new(role, content, metadata))
    }

    pub fn get_conversation_history(&self, max_messages: Option<usize>) -> Vec<LlmMessage> {
        self.conversation.to_llm_messages(max_messages)
    }

    pub fn set_variable(&mut self, key: impl Into<String>, value: Value) {
        self.variables.insert(key.into(), value);
        self.updated_at = Utc::now();
    }

    pub fn get_variable(&self, key: &str) -> Option<&Value> {
        self.variables.get(key)
    }
}

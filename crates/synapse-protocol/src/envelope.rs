use serde::{Deserialize, Serialize};
use uuid::Uuid;

use synapse_core::config::DEFAULT_MODEL_NAME;

/// OpenAI-style chat-completion reply envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<Choice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

/// Token accounting is not exposed by the engine — always zero-filled.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

impl ChatCompletion {
    /// Wrap a full assistant reply. `model` falls back to the well-known
    /// default when the request did not name one.
    pub fn new(model: Option<&str>, content: impl Into<String>) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4()),
            object: "chat.completion".to_string(),
            created: chrono::Utc::now().timestamp(),
            model: model.unwrap_or(DEFAULT_MODEL_NAME).to_string(),
            choices: vec![Choice {
                index: 0,
                message: AssistantMessage {
                    role: "assistant".to_string(),
                    content: content.into(),
                },
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| r#"{"error":"encoding failed"}"#.to_string())
    }
}

/// Metadata object returned by conversation-management calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationInfo {
    pub conversation_id: String,
    pub ttl_ms: i64,
    pub created_at: i64,
    pub last_access_time: i64,
    pub expires_at: i64,
    pub remaining_ttl_ms: i64,
}

/// `{"error": "<message>"}`
pub fn error_json(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}

/// `{"success": true}`
pub fn success_json() -> String {
    serde_json::json!({ "success": true }).to_string()
}

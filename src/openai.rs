//! OpenAI chat-completions wire types and inbound request normalization.

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProxyError;
use crate::models::DEFAULT_MODEL;

/// Marker prefixed to in-band error text so the aggregator can spot it.
pub const UPSTREAM_ERROR_SENTINEL: &str = "[UPSTREAM_ERROR]";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

/// An inbound request after normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    pub stream: bool,
}

impl ChatRequest {
    /// Validate a raw request body. Messages whose role is missing or whose
    /// content is not a plain string are dropped; at least one must remain.
    pub fn from_value(body: &Value) -> Result<Self, ProxyError> {
        let Some(obj) = body.as_object() else {
            return Err(ProxyError::InvalidRequest(
                "Request body must be a JSON object.".to_string(),
            ));
        };

        let model = obj
            .get("model")
            .and_then(Value::as_str)
            .filter(|m| !m.trim().is_empty())
            .unwrap_or(DEFAULT_MODEL)
            .to_string();

        let raw_messages = obj
            .get("messages")
            .and_then(Value::as_array)
            .filter(|m| !m.is_empty())
            .ok_or_else(|| ProxyError::InvalidRequest("messages field is required.".to_string()))?;

        let messages: Vec<ChatMessage> = raw_messages
            .iter()
            .filter_map(|m| {
                let role = m.get("role")?.as_str().filter(|r| !r.is_empty())?;
                let content = m.get("content")?.as_str()?;
                Some(ChatMessage {
                    role: role.to_string(),
                    content: content.to_string(),
                })
            })
            .collect();

        if messages.is_empty() {
            return Err(ProxyError::InvalidRequest(
                "No valid messages found to process. The 'messages' array may be empty or malformed."
                    .to_string(),
            ));
        }

        let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);

        Ok(Self {
            model,
            messages,
            stream,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: ChunkDelta,
    pub finish_reason: Option<String>,
}

/// One `chat.completion.chunk` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
}

impl ChatChunk {
    fn new(id: &str, model: &str, delta: ChunkDelta, finish_reason: Option<&str>) -> Self {
        Self {
            id: id.to_string(),
            object: "chat.completion.chunk".to_string(),
            created: unix_now(),
            model: model.to_string(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: finish_reason.map(str::to_string),
            }],
        }
    }

    pub fn role(id: &str, model: &str) -> Self {
        let delta = ChunkDelta {
            role: Some("assistant".to_string()),
            content: None,
        };
        Self::new(id, model, delta, None)
    }

    pub fn content(id: &str, model: &str, text: impl Into<String>) -> Self {
        let delta = ChunkDelta {
            role: None,
            content: Some(text.into()),
        };
        Self::new(id, model, delta, None)
    }

    pub fn error(id: &str, model: &str, message: &str) -> Self {
        let delta = ChunkDelta {
            role: None,
            content: Some(format!("{UPSTREAM_ERROR_SENTINEL}: {message}")),
        };
        Self::new(id, model, delta, Some("error"))
    }

    pub fn stop(id: &str, model: &str) -> Self {
        Self::new(id, model, ChunkDelta::default(), Some("stop"))
    }

    pub fn delta(&self) -> Option<&ChunkDelta> {
        self.choices.first().map(|c| &c.delta)
    }

    pub fn finish_reason(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.finish_reason.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: CompletionMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// Non-streaming `chat.completion` response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

impl ChatCompletion {
    pub fn assistant(id: String, model: &str, content: String) -> Self {
        Self {
            id,
            object: "chat.completion".to_string(),
            created: unix_now(),
            model: model.to_string(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant".to_string(),
                    content,
                },
                finish_reason: "stop".to_string(),
            }],
            usage: Usage::default(),
        }
    }
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn normalization_drops_non_string_content() {
        let req = ChatRequest::from_value(&json!({
            "model": "gpt-4o",
            "stream": true,
            "messages": [
                {"role": "system", "content": "be brief"},
                {"role": "user", "content": [{"type": "text", "text": "dropped"}]},
                {"content": "no role"},
                {"role": "", "content": "empty role"},
                {"role": "user", "content": "hi"},
            ]
        }))
        .expect("valid");

        assert_eq!(req.model, "gpt-4o");
        assert!(req.stream);
        assert_eq!(
            req.messages,
            vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: "be brief".to_string()
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: "hi".to_string()
                },
            ]
        );
    }

    #[test]
    fn defaults_model_and_stream() {
        let req = ChatRequest::from_value(&json!({
            "messages": [{"role": "user", "content": "hi"}],
            "stream": "yes"
        }))
        .expect("valid");
        assert_eq!(req.model, DEFAULT_MODEL);
        assert!(!req.stream);
    }

    #[test]
    fn rejects_missing_or_empty_messages() {
        for body in [json!({}), json!({"messages": []}), json!({"messages": "hi"})] {
            let err = ChatRequest::from_value(&body).expect_err("invalid");
            assert_eq!(err.to_string(), "messages field is required.");
        }
    }

    #[test]
    fn rejects_when_nothing_survives_normalization() {
        let err = ChatRequest::from_value(&json!({
            "messages": [{"role": "user", "content": null}]
        }))
        .expect_err("invalid");
        assert!(err.to_string().starts_with("No valid messages found"));
        assert!(ChatRequest::from_value(&json!([1, 2])).is_err());
    }

    #[test]
    fn chunk_serialization_matches_openai() {
        let role = serde_json::to_value(ChatChunk::role("chatcmpl-1", "m")).expect("json");
        assert_eq!(role["object"], "chat.completion.chunk");
        assert_eq!(role["choices"][0]["delta"], json!({"role": "assistant"}));
        assert_eq!(role["choices"][0]["finish_reason"], Value::Null);

        let stop = serde_json::to_value(ChatChunk::stop("chatcmpl-1", "m")).expect("json");
        assert_eq!(stop["choices"][0]["delta"], json!({}));
        assert_eq!(stop["choices"][0]["finish_reason"], "stop");

        let err = ChatChunk::error("chatcmpl-1", "m", "bad token");
        assert_eq!(
            err.delta().and_then(|d| d.content.as_deref()),
            Some("[UPSTREAM_ERROR]: bad token")
        );
        assert_eq!(err.finish_reason(), Some("error"));
    }

    #[test]
    fn completion_ids_have_openai_prefix() {
        let id = new_completion_id();
        assert!(id.starts_with("chatcmpl-"));
        assert_eq!(id.len(), "chatcmpl-".len() + 32);
    }
}

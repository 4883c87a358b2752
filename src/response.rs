use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// Upstream payload, either a full completion or one stream chunk.
///
/// Legacy completion endpoints put text in `choices[].text` instead of a
/// message or delta; both shapes are accepted here.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamPayload {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub created: Option<u64>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub choices: Vec<UpstreamChoice>,
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamChoice {
    #[serde(default)]
    pub index: Option<u32>,
    #[serde(default)]
    pub message: Option<UpstreamMessage>,
    #[serde(default)]
    pub delta: Option<UpstreamMessage>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamMessage {
    #[serde(default)]
    pub role: Option<String>,
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletion {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionChoice {
    pub index: u32,
    pub message: AssistantMessage,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssistantMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: u32,
    pub delta: Delta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

pub fn completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4().simple())
}

/// Converts an upstream non-streaming body to the client `chat.completion` shape.
pub fn transform_completion(
    body: &[u8],
    requested_model: &str,
) -> Result<ChatCompletion, serde_json::Error> {
    let payload: UpstreamPayload = serde_json::from_slice(body)?;

    let choices = payload
        .choices
        .into_iter()
        .enumerate()
        .map(|(position, choice)| {
            let (role, content) = match (choice.message, choice.text) {
                (Some(message), _) => (message.role, message.content.unwrap_or_default()),
                (None, Some(text)) => (None, text),
                (None, None) => (None, String::new()),
            };
            CompletionChoice {
                index: choice.index.unwrap_or(position as u32),
                message: AssistantMessage {
                    role: role.unwrap_or_else(|| "assistant".to_string()),
                    content,
                },
                finish_reason: choice.finish_reason,
            }
        })
        .collect();

    Ok(ChatCompletion {
        id: payload.id.unwrap_or_else(completion_id),
        object: "chat.completion".to_string(),
        created: payload.created.unwrap_or_else(unix_now),
        model: payload.model.unwrap_or_else(|| requested_model.to_string()),
        choices,
        usage: payload.usage,
    })
}

/// Fallback identity for chunks whose upstream payload omits it.
#[derive(Debug, Clone)]
pub struct ChunkDefaults {
    pub id: String,
    pub model: String,
    pub created: u64,
}

/// Converts one upstream stream payload to the client `chat.completion.chunk` shape.
pub fn transform_chunk(payload: UpstreamPayload, defaults: &ChunkDefaults) -> ChatCompletionChunk {
    let choices = payload
        .choices
        .into_iter()
        .enumerate()
        .map(|(position, choice)| {
            let delta = match (choice.delta, choice.message, choice.text) {
                (Some(delta), _, _) | (None, Some(delta), _) => Delta {
                    role: delta.role,
                    content: delta.content,
                },
                (None, None, text) => Delta {
                    role: None,
                    content: text,
                },
            };
            ChunkChoice {
                index: choice.index.unwrap_or(position as u32),
                delta,
                finish_reason: choice.finish_reason,
            }
        })
        .collect();

    ChatCompletionChunk {
        id: payload.id.unwrap_or_else(|| defaults.id.clone()),
        object: "chat.completion.chunk".to_string(),
        created: payload.created.unwrap_or(defaults.created),
        model: payload.model.unwrap_or_else(|| defaults.model.clone()),
        choices,
        usage: payload.usage,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn chat_shape_passes_through() {
        let body = json!({
            "id": "chatcmpl-1",
            "created": 1700000000,
            "model": "gpt-4o",
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "hello"}, "finish_reason": "stop"}],
            "usage": {"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4}
        });
        let out = transform_completion(&serde_json::to_vec(&body).unwrap(), "gpt-4").unwrap();
        assert_eq!(out.id, "chatcmpl-1");
        assert_eq!(out.object, "chat.completion");
        assert_eq!(out.model, "gpt-4o");
        assert_eq!(out.choices[0].message.content, "hello");
        assert_eq!(out.usage.unwrap().total_tokens, 4);
    }

    #[test]
    fn legacy_text_is_normalized_and_gaps_filled() {
        let body = json!({"choices": [{"text": "legacy answer", "finish_reason": "length"}]});
        let out = transform_completion(&serde_json::to_vec(&body).unwrap(), "gpt-4").unwrap();
        assert!(out.id.starts_with("chatcmpl-"));
        assert_eq!(out.model, "gpt-4");
        assert_eq!(out.choices[0].message.role, "assistant");
        assert_eq!(out.choices[0].message.content, "legacy answer");
        assert_eq!(out.choices[0].finish_reason.as_deref(), Some("length"));
    }

    #[test]
    fn chunk_uses_delta_or_text() {
        let defaults = ChunkDefaults {
            id: "chatcmpl-x".to_string(),
            model: "gpt-4".to_string(),
            created: 42,
        };

        let payload: UpstreamPayload = serde_json::from_value(json!({
            "choices": [{"delta": {"role": "assistant", "content": "Hi"}}]
        }))
        .unwrap();
        let chunk = transform_chunk(payload, &defaults);
        assert_eq!(chunk.id, "chatcmpl-x");
        assert_eq!(chunk.object, "chat.completion.chunk");
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("Hi"));

        let payload: UpstreamPayload = serde_json::from_value(json!({
            "model": "codex", "choices": [{"index": 0, "text": "fn", "finish_reason": null}]
        }))
        .unwrap();
        let chunk = transform_chunk(payload, &defaults);
        assert_eq!(chunk.model, "codex");
        assert_eq!(chunk.choices[0].delta.content.as_deref(), Some("fn"));
        assert!(chunk.choices[0].delta.role.is_none());
    }
}

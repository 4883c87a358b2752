use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    pub message: String,
    pub param: Option<&'static str>,
}

impl ValidationError {
    fn new(message: impl Into<String>, param: Option<&'static str>) -> Self {
        Self {
            message: message.into(),
            param,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text {
        text: String,
    },
    ImageUrl {
        image_url: serde_json::Value,
    },
    #[serde(other)]
    Unsupported,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

impl MessageContent {
    /// Text-only rendering: non-text blocks are dropped, text blocks joined by a space.
    pub fn flatten(&self) -> String {
        match self {
            MessageContent::Text(text) => text.clone(),
            MessageContent::Parts(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    ContentPart::Text { text } => Some(text.as_str()),
                    ContentPart::ImageUrl { .. } | ContentPart::Unsupported => None,
                })
                .collect::<Vec<_>>()
                .join(" "),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StopSequence {
    One(String),
    Many(Vec<String>),
}

#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub role: Role,
    pub content: MessageContent,
}

/// Wire shape accepted from clients, before validation.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundChatRequest {
    pub model: String,
    pub messages: Vec<InboundMessage>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop: Option<StopSequence>,
    #[serde(default)]
    pub stream: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

/// Validated, text-only chat request.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: Option<f64>,
    max_tokens: Option<u32>,
    top_p: Option<f64>,
    stop: Option<StopSequence>,
    stream: bool,
}

impl ChatRequest {
    pub fn parse(body: &[u8]) -> Result<Self, ValidationError> {
        let inbound: InboundChatRequest = serde_json::from_slice(body)
            .map_err(|err| ValidationError::new(format!("invalid request body: {err}"), None))?;
        Self::try_from(inbound)
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn is_stream(&self) -> bool {
        self.stream
    }

    /// Deterministic cache/deduplication key over the fields that shape the answer.
    pub fn fingerprint(&self) -> Fingerprint {
        #[derive(Serialize)]
        struct Key<'a> {
            model: &'a str,
            messages: &'a [Message],
            temperature: Option<f64>,
            max_tokens: Option<u32>,
            stream: bool,
        }

        let key = Key {
            model: &self.model,
            messages: &self.messages,
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            stream: self.stream,
        };
        let encoded = serde_json::to_vec(&key).unwrap_or_default();
        Fingerprint(format!("{:x}", Sha256::digest(&encoded)))
    }

    /// Request body for one candidate endpoint's request format.
    pub fn upstream_body(&self, format: RequestFormat) -> Result<Vec<u8>, serde_json::Error> {
        let sampling = SamplingParams {
            temperature: self.temperature,
            max_tokens: self.max_tokens,
            top_p: self.top_p,
            stop: self.stop.as_ref(),
        };

        match format {
            RequestFormat::Standard => serde_json::to_vec(&MessagesBody {
                model: &self.model,
                messages: &self.messages,
                stream: self.stream,
                sampling,
                intent: None,
                n: None,
            }),
            RequestFormat::WithIntent => serde_json::to_vec(&MessagesBody {
                model: &self.model,
                messages: &self.messages,
                stream: self.stream,
                sampling,
                intent: Some(true),
                n: Some(1),
            }),
            RequestFormat::LegacyPrompt => serde_json::to_vec(&PromptBody {
                model: &self.model,
                prompt: self.legacy_prompt(),
                stream: self.stream,
                sampling,
            }),
        }
    }

    fn legacy_prompt(&self) -> String {
        self.messages
            .iter()
            .map(|message| format!("{}: {}", message.role.as_str(), message.content))
            .collect::<Vec<_>>()
            .join("\n")
    }

    /// Smallest request accepted by a chat endpoint; used by endpoint health probes.
    pub fn probe(model: &str) -> Self {
        Self {
            model: model.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: "ping".to_string(),
            }],
            temperature: None,
            max_tokens: Some(1),
            top_p: None,
            stop: None,
            stream: false,
        }
    }
}

impl TryFrom<InboundChatRequest> for ChatRequest {
    type Error = ValidationError;

    fn try_from(inbound: InboundChatRequest) -> Result<Self, Self::Error> {
        let model = inbound.model.trim();
        if model.is_empty() {
            return Err(ValidationError::new("model must not be empty", Some("model")));
        }
        if inbound.messages.is_empty() {
            return Err(ValidationError::new(
                "messages must contain at least one message",
                Some("messages"),
            ));
        }
        if let Some(temperature) = inbound.temperature {
            if !(0.0..=2.0).contains(&temperature) {
                return Err(ValidationError::new(
                    "temperature must be between 0 and 2",
                    Some("temperature"),
                ));
            }
        }
        if let Some(top_p) = inbound.top_p {
            if !(0.0..=1.0).contains(&top_p) {
                return Err(ValidationError::new(
                    "top_p must be between 0 and 1",
                    Some("top_p"),
                ));
            }
        }
        if inbound.max_tokens == Some(0) {
            return Err(ValidationError::new(
                "max_tokens must be greater than 0",
                Some("max_tokens"),
            ));
        }

        let messages = inbound
            .messages
            .iter()
            .map(|message| Message {
                role: message.role,
                content: message.content.flatten(),
            })
            .collect();

        Ok(Self {
            model: model.to_string(),
            messages,
            temperature: inbound.temperature,
            max_tokens: inbound.max_tokens,
            top_p: inbound.top_p,
            stop: inbound.stop,
            stream: inbound.stream.unwrap_or(false),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Serialize)]
struct SamplingParams<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stop: Option<&'a StopSequence>,
}

#[derive(Serialize)]
struct MessagesBody<'a> {
    model: &'a str,
    messages: &'a [Message],
    stream: bool,
    #[serde(flatten)]
    sampling: SamplingParams<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    intent: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    n: Option<u32>,
}

#[derive(Serialize)]
struct PromptBody<'a> {
    model: &'a str,
    prompt: String,
    stream: bool,
    #[serde(flatten)]
    sampling: SamplingParams<'a>,
}

/// Upstream request body shapes; the numeric ids are the ones used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestFormat {
    Standard,
    WithIntent,
    LegacyPrompt,
}

impl RequestFormat {
    pub fn id(&self) -> u8 {
        match self {
            RequestFormat::Standard => 0,
            RequestFormat::WithIntent => 1,
            RequestFormat::LegacyPrompt => 2,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointConfig {
    pub path: String,
    pub format: RequestFormat,
}

impl EndpointConfig {
    pub fn new(path: impl Into<String>, format: RequestFormat) -> Self {
        Self {
            path: path.into(),
            format,
        }
    }

    pub fn url(&self, base_url: &str) -> String {
        format!(
            "{}/{}",
            base_url.trim_end_matches('/'),
            self.path.trim_start_matches('/')
        )
    }
}

impl fmt::Display for EndpointConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (format {})", self.path, self.format.id())
    }
}

/// Discovery search space for chat completions, in preference order.
pub fn chat_completion_candidates() -> Vec<EndpointConfig> {
    vec![
        EndpointConfig::new("/chat/completions", RequestFormat::Standard),
        EndpointConfig::new("/v1/chat/completions", RequestFormat::Standard),
        EndpointConfig::new("/chat/completions", RequestFormat::WithIntent),
        EndpointConfig::new("/v1/engines/copilot-codex/completions", RequestFormat::LegacyPrompt),
    ]
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use thiserror::Error;
use tracing_error::SpanTrace;

/// One message in a conversation.
///
/// `streaming` is a transient marker: it is true only while content is still
/// arriving for the trailing assistant turn, and it is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Turn {
    pub role: Role,
    pub content: TurnContent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub streaming: bool,
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl Turn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: TurnContent::Text(text.into()),
            usage: None,
            streaming: false,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: TurnContent::Text(text.into()),
            usage: None,
            streaming: false,
        }
    }

    /// Collapses structured content to a single string; plain text borrows.
    pub fn flattened_text(&self) -> Cow<'_, str> {
        match &self.content {
            TurnContent::Text(text) => Cow::Borrowed(text.as_str()),
            TurnContent::Blocks(blocks) => Cow::Owned(
                blocks
                    .iter()
                    .map(|b| b.text.as_str())
                    .collect::<Vec<_>>()
                    .concat(),
            ),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.flattened_text().is_empty()
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

impl std::str::FromStr for Role {
    type Err = ObservedError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Role::User),
            "assistant" => Ok(Role::Assistant),
            other => Err(ColloquyError::Internal(
                format!("Unknown role in store: {}", other),
                SpanTrace::capture(),
            )
            .into()),
        }
    }
}

/// Turn content as held by a UI: plain text or a list of text blocks.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TurnContent {
    Text(String),
    Blocks(Vec<TextBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextBlock {
    pub text: String,
}

/// Token accounting for one completion. Partial records arrive twice per
/// stream and are merged by field union, later values winning per field.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_read_input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_creation_input_tokens: Option<u64>,
}

impl Usage {
    pub fn merge(&mut self, other: &Usage) {
        if other.input_tokens.is_some() {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens.is_some() {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_read_input_tokens.is_some() {
            self.cache_read_input_tokens = other.cache_read_input_tokens;
        }
        if other.cache_creation_input_tokens.is_some() {
            self.cache_creation_input_tokens = other.cache_creation_input_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.input_tokens.is_none()
            && self.output_tokens.is_none()
            && self.cache_read_input_tokens.is_none()
            && self.cache_creation_input_tokens.is_none()
    }
}

/// The wire unit between relay and client: the only event vocabulary the
/// conversation state machine ever consumes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RelayEvent {
    Text { text: String },
    Usage { usage: Usage },
    UsageStart { usage: Usage },
    Error { error: String },
    Done,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub model: String,
    #[serde(default)]
    pub system: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub turns: Vec<Turn>,
}

impl Conversation {
    pub fn new(id: String, title: String, model: String, system: String) -> Self {
        let now = Utc::now();
        Self {
            id,
            title,
            model,
            system,
            created_at: now,
            updated_at: now,
            turns: Vec::new(),
        }
    }

    /// Bumps `updated_at`; called on every turn append or metadata edit.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

/// Listing shape: metadata only, no turns.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// `POST /chat` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    pub messages: Vec<Turn>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
}

/// `POST /auth` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// `POST /conversations` body. The id is client-minted when present so local
/// and store ids agree.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewConversation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub title: String,
    pub model: String,
    #[serde(default)]
    pub system: String,
}

/// `PATCH /conversations/:id` body.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConversationPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
}

#[derive(Error, Debug)]
pub enum ColloquyError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid ingress payload: {0}")]
    InvalidIngress(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Send already in flight for conversation {0}")]
    SendInFlight(String),

    #[error("Upstream error (status {0}): {1}")]
    Upstream(axum::http::StatusCode, String),

    #[error("Internal error: {0}")]
    Internal(String, SpanTrace),
}

impl axum::response::IntoResponse for ObservedError {
    fn into_response(self) -> axum::response::Response {
        let (status, msg, code) = match &self.inner {
            ColloquyError::Upstream(s, m) => (*s, m.clone(), "UPSTREAM_ERROR"),
            ColloquyError::InvalidIngress(m) => (
                axum::http::StatusCode::BAD_REQUEST,
                m.clone(),
                "INVALID_INGRESS",
            ),
            ColloquyError::Unauthorized(m) => (
                axum::http::StatusCode::UNAUTHORIZED,
                m.clone(),
                "UNAUTHORIZED",
            ),
            ColloquyError::NotFound(m) => {
                (axum::http::StatusCode::NOT_FOUND, m.clone(), "NOT_FOUND")
            }
            ColloquyError::SendInFlight(cid) => (
                axum::http::StatusCode::CONFLICT,
                cid.clone(),
                "SEND_IN_FLIGHT",
            ),
            ColloquyError::Network(e) => (
                axum::http::StatusCode::BAD_GATEWAY,
                e.to_string(),
                "NETWORK_ERROR",
            ),
            ColloquyError::Database(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "DATABASE_ERROR",
            ),
            ColloquyError::Serialization(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "SERIALIZATION_ERROR",
            ),
            ColloquyError::Io(e) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                e.to_string(),
                "IO_ERROR",
            ),
            ColloquyError::Internal(m, _) => (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                m.clone(),
                "INTERNAL_ERROR",
            ),
        };
        (
            status,
            axum::Json(serde_json::json!({
                "error": msg,
                "code": code,
                "span_trace": self.span_trace.to_string(),
            })),
        )
            .into_response()
    }
}

#[derive(Debug)]
pub struct ObservedError {
    pub inner: ColloquyError,
    pub span_trace: SpanTrace,
}

impl std::fmt::Display for ObservedError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}\n\nSpan Trace:\n{}", self.inner, self.span_trace)
    }
}

impl std::error::Error for ObservedError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.inner)
    }
}

impl<E> From<E> for ObservedError
where
    E: Into<ColloquyError>,
{
    fn from(error: E) -> Self {
        Self {
            inner: error.into(),
            span_trace: SpanTrace::capture(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ObservedError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_merge_is_order_independent_across_fields() {
        let input = Usage {
            input_tokens: Some(10),
            ..Default::default()
        };
        let output = Usage {
            output_tokens: Some(5),
            ..Default::default()
        };

        let mut forward = input.clone();
        forward.merge(&output);
        let mut reverse = output.clone();
        reverse.merge(&input);

        assert_eq!(forward, reverse);
        assert_eq!(forward.input_tokens, Some(10));
        assert_eq!(forward.output_tokens, Some(5));
    }

    #[test]
    fn usage_merge_later_value_wins_per_field() {
        let mut acc = Usage {
            input_tokens: Some(10),
            output_tokens: Some(1),
            ..Default::default()
        };
        acc.merge(&Usage {
            output_tokens: Some(2),
            ..Default::default()
        });
        assert_eq!(acc.input_tokens, Some(10));
        assert_eq!(acc.output_tokens, Some(2));
    }

    #[test]
    fn relay_events_serialize_with_type_tags() {
        let done = serde_json::to_value(&RelayEvent::Done).unwrap();
        assert_eq!(done, serde_json::json!({"type": "done"}));

        let text = serde_json::to_value(&RelayEvent::Text {
            text: "Hel".to_string(),
        })
        .unwrap();
        assert_eq!(text, serde_json::json!({"type": "text", "text": "Hel"}));

        let parsed: RelayEvent =
            serde_json::from_str(r#"{"type":"usage_start","usage":{"input_tokens":100}}"#).unwrap();
        match parsed {
            RelayEvent::UsageStart { usage } => assert_eq!(usage.input_tokens, Some(100)),
            other => panic!("Expected UsageStart, got {:?}", other),
        }
    }

    #[test]
    fn turn_content_accepts_both_shapes() {
        let plain: Turn = serde_json::from_str(r#"{"role":"user","content":"hi"}"#).unwrap();
        assert_eq!(plain.flattened_text(), "hi");

        let blocks: Turn = serde_json::from_str(
            r#"{"role":"user","content":[{"type":"text","text":"Hel"},{"type":"text","text":"lo"}]}"#,
        )
        .unwrap();
        assert_eq!(blocks.flattened_text(), "Hello");
    }

    #[test]
    fn streaming_flag_is_not_serialized_when_clear() {
        let turn = Turn::assistant("done");
        let json = serde_json::to_value(&turn).unwrap();
        assert!(json.get("streaming").is_none());

        let mut live = Turn::assistant("");
        live.streaming = true;
        let json = serde_json::to_value(&live).unwrap();
        assert_eq!(json.get("streaming"), Some(&serde_json::json!(true)));
    }
}

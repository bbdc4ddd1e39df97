use crate::constants::{
    ANTHROPIC_VERSION, API_ERROR_FALLBACK, DEFAULT_MAX_TOKENS, DEFAULT_MODEL, DEFAULT_TEMPERATURE,
};
use crate::normalize::normalize_history;
use crate::specs::anthropic::{CacheControl, ContentBlock, ErrorEnvelope, MessagesRequest};
use crate::text::prefix_chars;
use crate::types::{ChatRequest, ColloquyError, Result};

/// Builds the upstream request, applying completion defaults and the
/// system-prompt rule: trimmed-empty system prompts are omitted entirely,
/// anything else becomes a single cache-marked block.
pub fn build_request(chat: &ChatRequest) -> MessagesRequest {
    let system = chat
        .system
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|text| {
            vec![ContentBlock::Text {
                text: text.to_string(),
                cache_control: Some(CacheControl::ephemeral()),
            }]
        });

    MessagesRequest {
        model: chat
            .model
            .clone()
            .unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        system,
        messages: normalize_history(&chat.messages),
        max_tokens: chat.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        stream: true,
        temperature: chat.temperature.unwrap_or(DEFAULT_TEMPERATURE),
    }
}

/// Issues one streaming request. A non-success status reads the error body
/// once and folds it into a single terminal `Upstream` error; no retry.
pub async fn open_stream(
    client: &reqwest::Client,
    url: &str,
    api_key: &str,
    request: &MessagesRequest,
) -> Result<reqwest::Response> {
    let response = client
        .post(url)
        .header("x-api-key", api_key)
        .header("anthropic-version", ANTHROPIC_VERSION)
        .json(request)
        .send()
        .await
        .map_err(ColloquyError::Network)?;

    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body = match response.text().await {
        Ok(text) => text,
        Err(e) => {
            tracing::error!("Failed to read upstream error body: {}", e);
            String::new()
        }
    };
    tracing::error!(
        "Upstream returned {}: {}",
        status,
        prefix_chars(&body, 300)
    );
    Err(ColloquyError::Upstream(status, extract_error_message(&body)).into())
}

/// Pulls the human-readable message out of an error body, falling back to a
/// generic string when the body carries none.
pub fn extract_error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.error.message.is_empty() => envelope.error.message,
        _ => API_ERROR_FALLBACK.to_string(),
    }
}

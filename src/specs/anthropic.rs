use crate::text::prefix_chars;
use crate::types::{Role, Usage};
use serde::{Deserialize, Serialize};

/// Outbound Messages API request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessagesRequest {
    pub model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<Vec<ContentBlock>>,
    pub messages: Vec<OutboundMessage>,
    pub max_tokens: u32,
    pub stream: bool,
    pub temperature: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundMessage {
    pub role: Role,
    pub content: OutboundContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OutboundContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ContentBlock {
    Text {
        text: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        cache_control: Option<CacheControl>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheControl {
    pub r#type: String, // "ephemeral"
}

impl CacheControl {
    pub fn ephemeral() -> Self {
        Self {
            r#type: "ephemeral".to_string(),
        }
    }
}

/// Streamed frame vocabulary. Tags outside the three the relay cares about
/// (`ping`, `content_block_start`, `content_block_stop`, `message_stop`, ...)
/// fold into `Other`.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamFrame {
    MessageStart {
        message: StartedMessage,
    },
    ContentBlockDelta {
        delta: BlockDelta,
    },
    MessageDelta {
        #[serde(default)]
        usage: Option<Usage>,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartedMessage {
    #[serde(default)]
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BlockDelta {
    TextDelta {
        text: String,
    },
    #[serde(other)]
    Other,
}

/// Error body returned on non-success responses:
/// `{"type":"error","error":{"type":"...","message":"..."}}`.
#[derive(Debug, Deserialize)]
pub struct ErrorEnvelope {
    pub error: ErrorDetail,
}

#[derive(Debug, Deserialize)]
pub struct ErrorDetail {
    #[serde(default)]
    pub message: String,
}

/// Parses one `data:` payload into a frame. Malformed payloads are logged at
/// debug level and dropped; a single bad frame never aborts the stream.
pub fn parse_frame(data: &str) -> Option<StreamFrame> {
    match serde_json::from_str::<StreamFrame>(data) {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::debug!(
                "Skipping malformed stream frame: {} | snippet: {}",
                e,
                prefix_chars(data, 120)
            );
            None
        }
    }
}

#[cfg(test)]
mod parsing_tests {
    use super::*;

    #[test]
    fn parses_text_delta_frame() {
        let frame = parse_frame(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}"#,
        );
        match frame {
            Some(StreamFrame::ContentBlockDelta {
                delta: BlockDelta::TextDelta { text },
            }) => assert_eq!(text, "Hel"),
            other => panic!("Expected text delta, got {:?}", other),
        }
    }

    #[test]
    fn parses_message_start_with_usage() {
        let frame = parse_frame(
            r#"{"type":"message_start","message":{"id":"msg_1","usage":{"input_tokens":100}}}"#,
        );
        match frame {
            Some(StreamFrame::MessageStart { message }) => {
                let usage = message.usage.expect("usage present");
                assert_eq!(usage.input_tokens, Some(100));
            }
            other => panic!("Expected message_start, got {:?}", other),
        }
    }

    #[test]
    fn parses_message_delta_with_usage() {
        let frame = parse_frame(
            r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":2}}"#,
        );
        match frame {
            Some(StreamFrame::MessageDelta { usage: Some(usage) }) => {
                assert_eq!(usage.output_tokens, Some(2));
            }
            other => panic!("Expected message_delta, got {:?}", other),
        }
    }

    #[test]
    fn unknown_tags_fold_into_other() {
        assert!(matches!(
            parse_frame(r#"{"type":"ping"}"#),
            Some(StreamFrame::Other)
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"content_block_stop","index":0}"#),
            Some(StreamFrame::Other)
        ));
        assert!(matches!(
            parse_frame(r#"{"type":"error","error":{"type":"overloaded_error","message":"x"}}"#),
            Some(StreamFrame::Other)
        ));
    }

    #[test]
    fn non_text_deltas_are_kept_but_inert() {
        let frame = parse_frame(
            r#"{"type":"content_block_delta","index":0,"delta":{"type":"input_json_delta","partial_json":"{"}}"#,
        );
        assert!(matches!(
            frame,
            Some(StreamFrame::ContentBlockDelta {
                delta: BlockDelta::Other
            })
        ));
    }

    #[test]
    fn malformed_payload_is_dropped() {
        assert!(parse_frame("{not json").is_none());
        assert!(parse_frame("").is_none());
    }

    #[test]
    fn system_block_serializes_with_cache_marker() {
        let block = ContentBlock::Text {
            text: "be brief".to_string(),
            cache_control: Some(CacheControl::ephemeral()),
        };
        let json = serde_json::to_value(&block).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "type": "text",
                "text": "be brief",
                "cache_control": {"type": "ephemeral"}
            })
        );
    }
}

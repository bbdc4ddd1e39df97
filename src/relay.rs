use crate::constants::{MAX_LINE_BYTES, MAX_STREAM_LINES};
use crate::logging::StreamMetric;
use crate::specs::anthropic::{parse_frame, BlockDelta, StreamFrame};
use crate::types::RelayEvent;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, LinesCodec, LinesCodecError};
use tokio_util::io::StreamReader;

/// Adapts a streaming HTTP response into its SSE data lines, capping line
/// length so a runaway frame cannot balloon memory. Codec overflow surfaces
/// as an IO error, which the pump treats as a transport failure.
pub fn sse_line_stream(
    response: reqwest::Response,
) -> impl Stream<Item = std::io::Result<String>> + Unpin {
    let bytes = response
        .bytes_stream()
        .map(|chunk: std::result::Result<Bytes, reqwest::Error>| {
            chunk.map_err(std::io::Error::other)
        });
    FramedRead::new(
        StreamReader::new(bytes),
        LinesCodec::new_with_max_length(MAX_LINE_BYTES),
    )
    .map(|line| {
        line.map_err(|e| match e {
            LinesCodecError::Io(io) => io,
            LinesCodecError::MaxLineLengthExceeded => {
                std::io::Error::other("Max line length exceeded")
            }
        })
    })
}

/// Maps one upstream frame to at most one relay event. Everything outside the
/// three mapped shapes is a no-op.
pub fn transcode(frame: StreamFrame) -> Option<RelayEvent> {
    match frame {
        StreamFrame::ContentBlockDelta {
            delta: BlockDelta::TextDelta { text },
        } => Some(RelayEvent::Text { text }),
        StreamFrame::MessageDelta { usage: Some(usage) } => Some(RelayEvent::Usage { usage }),
        StreamFrame::MessageStart { message } => {
            message.usage.map(|usage| RelayEvent::UsageStart { usage })
        }
        _ => None,
    }
}

/// Drives one upstream stream to completion, emitting relay events in arrival
/// order. Exactly one terminal event leaves here per stream: `{done}` when the
/// upstream ends or sends its `[DONE]` sentinel, `{error}` when the transport
/// fails mid-stream or the line guard trips. A dropped receiver stops the pump
/// with no terminal, since nobody is listening.
pub async fn pump<S>(mut lines: S, tx: &mpsc::Sender<RelayEvent>)
where
    S: Stream<Item = std::io::Result<String>> + Unpin,
{
    let mut metrics = StreamMetric::new();
    let mut line_count = 0usize;

    while let Some(line_result) = lines.next().await {
        line_count += 1;
        if line_count > MAX_STREAM_LINES {
            tracing::error!(
                "[☁️  -> ⚙️ ] Stream exceeded max line limit ({})",
                MAX_STREAM_LINES
            );
            let _ = tx
                .send(RelayEvent::Error {
                    error: "Stream exceeded max line limit".to_string(),
                })
                .await;
            return;
        }

        match line_result {
            Ok(line) => {
                if let Some(data) = line.strip_prefix("data: ") {
                    if data == "[DONE]" {
                        tracing::debug!("[☁️  -> ⚙️ ] Stream end marker [DONE] received");
                        break;
                    }
                    if let Some(frame) = parse_frame(data) {
                        if let Some(event) = transcode(frame) {
                            metrics.record_event(&event);
                            if tx.send(event).await.is_err() {
                                tracing::trace!("Client disconnected, stopping stream");
                                return;
                            }
                        }
                    }
                }
            }
            Err(e) => {
                tracing::error!("[☁️  -> ⚙️ ] Stream transport failed: {}", e);
                let _ = tx
                    .send(RelayEvent::Error {
                        error: format!("Stream transport failed: {}", e),
                    })
                    .await;
                return;
            }
        }
    }

    metrics.log_summary();
    if tx.send(RelayEvent::Done).await.is_err() {
        tracing::trace!("Client disconnected, stopping stream");
    }
}

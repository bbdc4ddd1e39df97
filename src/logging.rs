use crate::types::{ChatRequest, RelayEvent, Role};
use axum::{
    body::Body,
    http::{Request, Response},
    middleware::Next,
};
use std::panic;
use tracing::{error, info};
use tracing::{info_span, Instrument};
use uuid::Uuid;

pub const RELAY_REQUEST_ID_HEADER: &str = "x-relay-request-id";

/// Sets up a global panic hook that logs panics through tracing before
/// delegating to the previous hook.
pub fn setup_panic_hook() {
    let original_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let backtrace = std::backtrace::Backtrace::capture();

        let payload = panic_info.payload();
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            *s
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.as_str()
        } else {
            "Unknown panic payload"
        };

        let location = panic_info
            .location()
            .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
            .unwrap_or_else(|| "unknown location".to_string());

        error!(
            target: "panic",
            message = %message,
            location = %location,
            backtrace = %backtrace,
            "FATAL: Application panicked"
        );

        original_hook(panic_info);
    }));
}

/// Stamps every inbound request with an id header and wraps handling in a
/// span carrying it.
pub async fn request_id_middleware(mut req: Request<Body>, next: Next) -> Response<Body> {
    let request_id = Uuid::new_v4().to_string();
    if let Ok(val) = request_id.parse() {
        req.headers_mut().insert(RELAY_REQUEST_ID_HEADER, val);
    }

    let span = info_span!("request", request_id = %request_id);
    next.run(req).instrument(span).await
}

pub fn log_request_summary(payload: &ChatRequest) {
    let turn_count = payload.messages.len();
    let last_role = match payload.messages.last().map(|m| format!("{:?}", m.role)) {
        Some(role) => role,
        None => "NONE".into(),
    };
    let is_prefill = payload
        .messages
        .last()
        .map(|m| m.role == Role::Assistant && !m.streaming)
        .unwrap_or_default();

    info!(
        target: "relay",
        "[REQ] Turns: {} | Last Role: {} | Prefill: {} | Model: {}",
        turn_count,
        last_role,
        is_prefill,
        payload.model.as_deref().unwrap_or("default")
    );
}

#[derive(Default)]
pub struct StreamMetric {
    pub events: usize,
    pub text_chars: usize,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

impl StreamMetric {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_event(&mut self, event: &RelayEvent) {
        self.events += 1;
        match event {
            RelayEvent::Text { text } => self.text_chars += text.len(),
            RelayEvent::Usage { usage } | RelayEvent::UsageStart { usage } => {
                if let Some(n) = usage.input_tokens {
                    self.input_tokens = n;
                }
                if let Some(n) = usage.output_tokens {
                    self.output_tokens = n;
                }
            }
            _ => {}
        }
    }

    pub fn log_summary(&self) {
        info!(
            target: "relay",
            "[STREAM END] Events: {} | Text: {} chars | Tokens: {} in / {} out",
            self.events, self.text_chars, self.input_tokens, self.output_tokens
        );
    }
}

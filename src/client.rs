//! Client-side conversation driver: login, per-conversation sessions, and the
//! stream pump that feeds relay events through [`ChatSession`].

use crate::constants::DEFAULT_MODEL;
use crate::relay;
use crate::session::{ChatSession, TurnOutcome, TurnPhase};
use crate::text::{derive_title, prefix_chars};
use crate::types::{
    AuthRequest, AuthResponse, ChatRequest, ColloquyError, Conversation, ConversationPatch,
    ConversationSummary, NewConversation, RelayEvent, Result,
};
use futures_util::StreamExt;
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One conversation's shared state: the reducer everyone reads through, the
/// cancel signal for the current request, and whether the store row exists yet.
#[derive(Clone)]
struct ConversationHandle {
    session: Arc<Mutex<ChatSession>>,
    cancel: CancellationToken,
    persisted: Arc<AtomicBool>,
}

/// Facade over the relay for embedding in a frontend. Owns the session map,
/// enforces one outstanding send per conversation, and mirrors settled turns
/// into the store without blocking the caller.
pub struct ChatClient {
    http: reqwest::Client,
    base_url: String,
    token: RwLock<Option<String>>,
    conversations: Mutex<HashMap<String, ConversationHandle>>,
    active: Mutex<Option<String>>,
}

impl ChatClient {
    /// No overall request timeout here: `/chat` responses stream for as long
    /// as the completion runs.
    pub fn new(base_url: &str) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token: RwLock::new(None),
            conversations: Mutex::new(HashMap::new()),
            active: Mutex::new(None),
        })
    }

    /// Exchanges the gate password for a session token and returns the
    /// username the relay resolved.
    pub async fn login(&self, password: &str, username: Option<&str>) -> Result<String> {
        let request = AuthRequest {
            password: password.to_string(),
            username: username.map(str::to_string),
        };
        let response = self
            .http
            .post(format!("{}/auth", self.base_url))
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let auth: AuthResponse = response.json().await?;
        if !auth.success {
            let message = match auth.error {
                Some(error) => error,
                None => format!("Auth failed with {}", status),
            };
            return Err(ColloquyError::Unauthorized(message).into());
        }
        let token = match auth.token {
            Some(token) => token,
            None => {
                return Err(
                    ColloquyError::Unauthorized("Auth response carried no token".to_string())
                        .into(),
                )
            }
        };
        *self.token.write().await = Some(token);
        let username = match auth.username {
            Some(username) => username,
            None => String::new(),
        };
        tracing::info!("Logged in as {}", username);
        Ok(username)
    }

    /// Creates a conversation locally. The store row appears once the first
    /// exchange settles.
    pub async fn new_conversation(&self, model: Option<&str>, system: Option<&str>) -> String {
        let id = Uuid::new_v4().to_string();
        let conversation = Conversation::new(
            id.clone(),
            String::new(),
            model.unwrap_or(DEFAULT_MODEL).to_string(),
            system.unwrap_or("").to_string(),
        );
        let handle = ConversationHandle {
            session: Arc::new(Mutex::new(ChatSession::new(conversation))),
            cancel: CancellationToken::new(),
            persisted: Arc::new(AtomicBool::new(false)),
        };
        self.conversations.lock().await.insert(id.clone(), handle);
        id
    }

    /// Fetches a stored conversation and installs it as a local session. If it
    /// is already open, returns the live local state instead.
    pub async fn open(&self, conversation_id: &str) -> Result<Conversation> {
        {
            let conversations = self.conversations.lock().await;
            if let Some(handle) = conversations.get(conversation_id) {
                let session = handle.session.lock().await;
                return Ok(session.conversation.clone());
            }
        }
        let conversation = self.fetch_conversation(conversation_id).await?;
        let handle = ConversationHandle {
            session: Arc::new(Mutex::new(ChatSession::new(conversation.clone()))),
            cancel: CancellationToken::new(),
            persisted: Arc::new(AtomicBool::new(true)),
        };
        self.conversations
            .lock()
            .await
            .insert(conversation.id.clone(), handle);
        Ok(conversation)
    }

    /// Sends a user message and spawns the driver task that streams the reply
    /// into the session. Returns the driver handle so callers can await
    /// completion; most frontends just poll [`ChatClient::snapshot`] instead.
    pub async fn send(&self, conversation_id: &str, text: &str) -> Result<JoinHandle<()>> {
        if text.trim().is_empty() {
            return Err(
                ColloquyError::InvalidIngress("Refusing to send an empty message".to_string())
                    .into(),
            );
        }
        let token = self.bearer_token().await?;

        let (handle, request) = {
            let mut conversations = self.conversations.lock().await;
            let handle = match conversations.get_mut(conversation_id) {
                Some(handle) => handle,
                None => return Err(not_found(conversation_id)),
            };
            let request = {
                let mut session = handle.session.lock().await;
                if session.is_busy() {
                    return Err(
                        ColloquyError::SendInFlight(conversation_id.to_string()).into()
                    );
                }
                session.begin_send(text.to_string());
                let conversation = &session.conversation;
                ChatRequest {
                    messages: conversation.turns.clone(),
                    system: if conversation.system.trim().is_empty() {
                        None
                    } else {
                        Some(conversation.system.clone())
                    },
                    model: Some(conversation.model.clone()),
                    temperature: None,
                    max_tokens: None,
                }
            };
            handle.cancel = CancellationToken::new();
            (handle.clone(), request)
        };

        Ok(tokio::spawn(drive_stream(
            self.http.clone(),
            self.base_url.clone(),
            token,
            request,
            handle,
        )))
    }

    /// Cancels the in-flight request for a conversation, if any. The local
    /// truncation is immediate; the driver task winds down on its own.
    /// Idempotent.
    pub async fn cancel(&self, conversation_id: &str) {
        let handle = {
            let conversations = self.conversations.lock().await;
            conversations.get(conversation_id).cloned()
        };
        if let Some(handle) = handle {
            handle.cancel.cancel();
            let mut session = handle.session.lock().await;
            session.cancel();
        }
    }

    /// Marks a conversation active. Switching away from one that is still
    /// streaming cancels it.
    pub async fn set_active(&self, conversation_id: &str) -> Result<()> {
        {
            let conversations = self.conversations.lock().await;
            if !conversations.contains_key(conversation_id) {
                return Err(not_found(conversation_id));
            }
        }
        let previous = {
            let mut active = self.active.lock().await;
            active.replace(conversation_id.to_string())
        };
        if let Some(previous_id) = previous {
            if previous_id != conversation_id {
                self.cancel(&previous_id).await;
            }
        }
        Ok(())
    }

    pub async fn active_conversation(&self) -> Option<String> {
        self.active.lock().await.clone()
    }

    /// Renames locally right away; the store catches up in the background.
    pub async fn rename(&self, conversation_id: &str, title: &str) -> Result<()> {
        let handle = {
            let conversations = self.conversations.lock().await;
            match conversations.get(conversation_id) {
                Some(handle) => handle.clone(),
                None => return Err(not_found(conversation_id)),
            }
        };
        {
            let mut session = handle.session.lock().await;
            session.conversation.title = title.to_string();
            session.conversation.touch();
        }
        if handle.persisted.load(Ordering::Acquire) {
            let token = self.bearer_token().await?;
            let http = self.http.clone();
            let url = format!("{}/conversations/{}", self.base_url, conversation_id);
            let patch = ConversationPatch {
                title: Some(title.to_string()),
                model: None,
                system: None,
            };
            let id_tag = prefix_chars(conversation_id, 8).to_string();
            tokio::spawn(async move {
                let response = http
                    .patch(&url)
                    .header(AUTHORIZATION, format!("Bearer {}", token))
                    .json(&patch)
                    .send()
                    .await;
                log_sync_outcome("Rename", &id_tag, response);
            });
        }
        Ok(())
    }

    /// Drops the conversation locally (cancelling any stream) and deletes the
    /// store row in the background when one exists.
    pub async fn remove(&self, conversation_id: &str) -> Result<()> {
        let handle = {
            let mut conversations = self.conversations.lock().await;
            match conversations.remove(conversation_id) {
                Some(handle) => handle,
                None => return Err(not_found(conversation_id)),
            }
        };
        handle.cancel.cancel();
        {
            let mut active = self.active.lock().await;
            if active.as_deref() == Some(conversation_id) {
                *active = None;
            }
        }
        if handle.persisted.load(Ordering::Acquire) {
            let token = self.bearer_token().await?;
            let http = self.http.clone();
            let url = format!("{}/conversations/{}", self.base_url, conversation_id);
            let id_tag = prefix_chars(conversation_id, 8).to_string();
            tokio::spawn(async move {
                let response = http
                    .delete(&url)
                    .header(AUTHORIZATION, format!("Bearer {}", token))
                    .send()
                    .await;
                log_sync_outcome("Delete", &id_tag, response);
            });
        }
        Ok(())
    }

    /// A point-in-time copy of the local conversation, placeholder included.
    pub async fn snapshot(&self, conversation_id: &str) -> Option<Conversation> {
        let handle = {
            let conversations = self.conversations.lock().await;
            conversations.get(conversation_id).cloned()
        };
        match handle {
            Some(handle) => {
                let session = handle.session.lock().await;
                Some(session.conversation.clone())
            }
            None => None,
        }
    }

    pub async fn phase(&self, conversation_id: &str) -> Option<TurnPhase> {
        let handle = {
            let conversations = self.conversations.lock().await;
            conversations.get(conversation_id).cloned()
        };
        match handle {
            Some(handle) => Some(handle.session.lock().await.phase),
            None => None,
        }
    }

    pub async fn list_conversations(&self) -> Result<Vec<ConversationSummary>> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!("{}/conversations", self.base_url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        let response = check_relay_status(response).await?;
        Ok(response.json().await?)
    }

    pub async fn fetch_conversation(&self, conversation_id: &str) -> Result<Conversation> {
        let token = self.bearer_token().await?;
        let response = self
            .http
            .get(format!(
                "{}/conversations/{}",
                self.base_url, conversation_id
            ))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .send()
            .await?;
        let response = check_relay_status(response).await?;
        Ok(response.json().await?)
    }

    async fn bearer_token(&self) -> Result<String> {
        match self.token.read().await.clone() {
            Some(token) => Ok(token),
            None => Err(ColloquyError::Unauthorized("Not logged in".to_string()).into()),
        }
    }
}

/// Runs one `/chat` exchange to its terminal event, racing the cancel token.
/// On settle, the finished pair is mirrored into the store before the task
/// exits so a joined driver implies persistence was attempted.
async fn drive_stream(
    http: reqwest::Client,
    base_url: String,
    token: String,
    request: ChatRequest,
    handle: ConversationHandle,
) {
    let send_result = http
        .post(format!("{}/chat", base_url))
        .header(AUTHORIZATION, format!("Bearer {}", token))
        .json(&request)
        .send()
        .await;

    let response = match send_result {
        Ok(response) => response,
        Err(e) => {
            apply_error(&handle, format!("Relay unreachable: {}", e)).await;
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        let body = match response.text().await {
            Ok(body) => body,
            Err(_) => String::new(),
        };
        apply_error(&handle, relay_error_text(status, &body)).await;
        return;
    }

    let mut lines = relay::sse_line_stream(response);
    loop {
        tokio::select! {
            _ = handle.cancel.cancelled() => {
                let mut session = handle.session.lock().await;
                session.cancel();
                return;
            }
            item = lines.next() => match item {
                Some(Ok(line)) => {
                    if let Some(data) = line.strip_prefix("data: ") {
                        let event = match serde_json::from_str::<RelayEvent>(data) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::debug!(
                                    "Skipping malformed relay event: {} | snippet: {}",
                                    e,
                                    prefix_chars(data, 120)
                                );
                                continue;
                            }
                        };
                        let outcome = {
                            let mut session = handle.session.lock().await;
                            session.apply(&event)
                        };
                        match outcome {
                            Some(TurnOutcome::Settled) => {
                                sync_settled_pair(&http, &base_url, &token, &handle).await;
                                return;
                            }
                            Some(TurnOutcome::Errored) => return,
                            None => {}
                        }
                    }
                }
                Some(Err(e)) => {
                    apply_error(&handle, format!("Stream transport failed: {}", e)).await;
                    return;
                }
                None => {
                    apply_error(&handle, "Stream ended before completion".to_string()).await;
                    return;
                }
            }
        }
    }
}

async fn apply_error(handle: &ConversationHandle, error: String) {
    let mut session = handle.session.lock().await;
    let _ = session.apply(&RelayEvent::Error { error });
}

/// Mirrors a settled exchange into the store: creates the row (with a title
/// derived from the opening message) on first settle, then appends both turns.
/// Failures are logged and abandoned; the transcript stays usable locally.
async fn sync_settled_pair(
    http: &reqwest::Client,
    base_url: &str,
    token: &str,
    handle: &ConversationHandle,
) {
    let snapshot = {
        let session = handle.session.lock().await;
        match session.settled_pair() {
            Some((user_turn, assistant_turn)) => Some((
                session.conversation.clone(),
                user_turn.clone(),
                assistant_turn.clone(),
            )),
            None => None,
        }
    };
    let (conversation, user_turn, assistant_turn) = match snapshot {
        Some(parts) => parts,
        None => return,
    };
    let id_tag = prefix_chars(&conversation.id, 8).to_string();

    if !handle.persisted.load(Ordering::Acquire) {
        let title = match conversation.turns.first() {
            Some(turn) => derive_title(&turn.flattened_text()),
            None => String::new(),
        };
        {
            let mut session = handle.session.lock().await;
            session.conversation.title = title.clone();
        }
        let create = NewConversation {
            id: Some(conversation.id.clone()),
            title,
            model: conversation.model.clone(),
            system: conversation.system.clone(),
        };
        let response = http
            .post(format!("{}/conversations", base_url))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(&create)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => {
                handle.persisted.store(true, Ordering::Release);
            }
            Ok(r) => {
                tracing::warn!("Conversation [{}...] not persisted: {}", id_tag, r.status());
                return;
            }
            Err(e) => {
                tracing::warn!("Conversation [{}...] not persisted: {}", id_tag, e);
                return;
            }
        }
    }

    for turn in [&user_turn, &assistant_turn] {
        let response = http
            .post(format!(
                "{}/conversations/{}/messages",
                base_url, conversation.id
            ))
            .header(AUTHORIZATION, format!("Bearer {}", token))
            .json(turn)
            .send()
            .await;
        match response {
            Ok(r) if r.status().is_success() => {}
            Ok(r) => {
                tracing::warn!("Turn for [{}...] not persisted: {}", id_tag, r.status());
                return;
            }
            Err(e) => {
                tracing::warn!("Turn for [{}...] not persisted: {}", id_tag, e);
                return;
            }
        }
    }
    tracing::debug!("Settled pair for [{}...] persisted", id_tag);
}

fn log_sync_outcome(
    action: &str,
    id_tag: &str,
    response: std::result::Result<reqwest::Response, reqwest::Error>,
) {
    match response {
        Ok(r) if r.status().is_success() => {}
        Ok(r) => tracing::warn!("{} of [{}...] not persisted: {}", action, id_tag, r.status()),
        Err(e) => tracing::warn!("{} of [{}...] not persisted: {}", action, id_tag, e),
    }
}

fn not_found(conversation_id: &str) -> crate::types::ObservedError {
    ColloquyError::NotFound(format!(
        "No conversation [{}...]",
        prefix_chars(conversation_id, 8)
    ))
    .into()
}

/// Passes success responses through; anything else is read for its message
/// and mapped onto the matching error.
async fn check_relay_status(response: reqwest::Response) -> Result<reqwest::Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = match response.text().await {
        Ok(body) => body,
        Err(_) => String::new(),
    };
    let message = relay_error_text(status, &body);
    if status == StatusCode::NOT_FOUND {
        Err(ColloquyError::NotFound(message).into())
    } else if status == StatusCode::UNAUTHORIZED {
        Err(ColloquyError::Unauthorized(message).into())
    } else {
        Err(ColloquyError::Upstream(status, message).into())
    }
}

/// Pulls the `error` field out of a relay error body, falling back to the
/// status line when the body is not the expected JSON shape.
fn relay_error_text(status: StatusCode, body: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(message) = value.get("error").and_then(|v| v.as_str()) {
            if !message.is_empty() {
                return message.to_string();
            }
        }
    }
    format!("Relay returned {}", status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_error_text_prefers_body_message() {
        let text = relay_error_text(
            StatusCode::UNAUTHORIZED,
            r#"{"error": "Unauthorized", "code": "UNAUTHORIZED"}"#,
        );
        assert_eq!(text, "Unauthorized");
    }

    #[test]
    fn relay_error_text_falls_back_to_status() {
        assert_eq!(
            relay_error_text(StatusCode::BAD_GATEWAY, "<html>nope</html>"),
            "Relay returned 502 Bad Gateway"
        );
        assert_eq!(
            relay_error_text(StatusCode::BAD_GATEWAY, ""),
            "Relay returned 502 Bad Gateway"
        );
    }
}

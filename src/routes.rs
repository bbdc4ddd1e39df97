use crate::constants::{DEFAULT_USERNAME, SSE_KEEPALIVE_SECS};
use crate::health;
use crate::logging::{log_request_summary, request_id_middleware};
use crate::normalize::validate_history;
use crate::relay;
use crate::store;
use crate::text::prefix_chars;
use crate::types::{
    AuthRequest, AuthResponse, ChatRequest, ColloquyError, Conversation, ConversationPatch,
    ConversationSummary, NewConversation, RelayEvent, Result, Turn,
};
use crate::upstream;
use crate::AppState;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, Path, State},
    http::{header, Request, StatusCode},
    middleware::{self, Next},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Extension, Json, Router,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tower_http::cors::CorsLayer;
use tracing::Instrument;

/// Username resolved by the auth middleware, injected into request extensions.
#[derive(Debug, Clone)]
pub struct SessionUser(pub String);

pub fn build_router(state: Arc<AppState>) -> Router {
    let guarded = Router::new()
        .route("/chat", post(chat_handler))
        .route(
            "/conversations",
            get(list_conversations_handler).post(create_conversation_handler),
        )
        .route(
            "/conversations/:id",
            get(fetch_conversation_handler)
                .patch(patch_conversation_handler)
                .delete(delete_conversation_handler),
        )
        .route("/conversations/:id/messages", post(append_turn_handler))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    Router::new()
        .route("/auth", post(auth_handler))
        .route("/health", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .merge(guarded)
        .layer(DefaultBodyLimit::max(state.args.max_body_size))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn require_session(
    State(state): State<Arc<AppState>>,
    mut req: Request<Body>,
    next: Next,
) -> Response {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let user = match token {
        Some(t) => state.session_user(t).await,
        None => None,
    };

    match user {
        Some(username) => {
            req.extensions_mut().insert(SessionUser(username));
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "Unauthorized" })),
        )
            .into_response(),
    }
}

async fn auth_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<AuthRequest>,
) -> Response {
    if !state.verify_password(&payload.password) {
        tracing::warn!("Rejected login attempt");
        return (
            StatusCode::UNAUTHORIZED,
            Json(AuthResponse {
                success: false,
                token: None,
                username: None,
                error: Some("Invalid password".to_string()),
            }),
        )
            .into_response();
    }

    let username = payload
        .username
        .unwrap_or_else(|| DEFAULT_USERNAME.to_string());
    let token = state.issue_session(&username).await;
    tracing::info!("Session issued for {}", username);

    Json(AuthResponse {
        success: true,
        token: Some(token),
        username: Some(username),
        error: None,
    })
    .into_response()
}

/// Relays one completion as an SSE stream of relay events. Once headers
/// flush, every failure is delivered in-band as a `{type:"error"}` event;
/// only pre-stream validation may return a non-200.
#[tracing::instrument(
    name = "relay.chat",
    skip_all,
    fields(
        model = tracing::field::Empty,
        turns = tracing::field::Empty,
    )
)]
async fn chat_handler(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<ChatRequest>,
) -> Response {
    let span = tracing::Span::current();
    span.record("turns", payload.messages.len() as u64);
    log_request_summary(&payload);

    if let Err(e) = validate_history(&payload.messages) {
        return e.into_response();
    }

    let request = upstream::build_request(&payload);
    span.record("model", request.model.as_str());

    let (tx, rx) = mpsc::channel::<RelayEvent>(100);
    let client = state.client.clone();
    let url = state.args.upstream_url.clone();
    let api_key = state.anthropic_key.clone();

    tokio::spawn(async move {
        let stream_id = uuid::Uuid::new_v4().to_string();
        let stream_span = tracing::info_span!(
            "stream",
            model = %request.model,
            stream_id = %prefix_chars(&stream_id, 8)
        );

        async {
            match upstream::open_stream(&client, &url, &api_key, &request).await {
                Ok(response) => {
                    let lines = relay::sse_line_stream(response);
                    relay::pump(lines, &tx).await;
                }
                Err(e) => {
                    let message = match e.inner {
                        ColloquyError::Upstream(_, msg) => msg,
                        other => other.to_string(),
                    };
                    tracing::error!("[☁️  -> ⚙️ ] Upstream request failed: {}", message);
                    let _ = tx.send(RelayEvent::Error { error: message }).await;
                }
            }
        }
        .instrument(stream_span)
        .await;
    });

    Sse::new(ReceiverStream::new(rx).map(|event| Event::default().json_data(&event)))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
                .text(": keepalive"),
        )
        .into_response()
}

async fn list_conversations_handler(
    State(state): State<Arc<AppState>>,
    Extension(SessionUser(username)): Extension<SessionUser>,
) -> Result<Json<Vec<ConversationSummary>>> {
    let summaries = store::list_conversations(&state.db, &username).await?;
    Ok(Json(summaries))
}

async fn fetch_conversation_handler(
    State(state): State<Arc<AppState>>,
    Extension(SessionUser(username)): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Result<Json<Conversation>> {
    match store::fetch_conversation(&state.db, &username, &id).await? {
        Some(conversation) => Ok(Json(conversation)),
        None => Err(ColloquyError::NotFound(format!(
            "No conversation [{}...]",
            prefix_chars(&id, 8)
        ))
        .into()),
    }
}

async fn create_conversation_handler(
    State(state): State<Arc<AppState>>,
    Extension(SessionUser(username)): Extension<SessionUser>,
    Json(payload): Json<NewConversation>,
) -> Result<(StatusCode, Json<Conversation>)> {
    let conversation = store::create_conversation(&state.db, &username, &payload).await?;
    tracing::info!(
        "Created conversation [{}...] for {}",
        prefix_chars(&conversation.id, 8),
        username
    );
    Ok((StatusCode::CREATED, Json(conversation)))
}

async fn patch_conversation_handler(
    State(state): State<Arc<AppState>>,
    Extension(SessionUser(username)): Extension<SessionUser>,
    Path(id): Path<String>,
    Json(patch): Json<ConversationPatch>,
) -> Result<Json<ConversationSummary>> {
    match store::patch_conversation(&state.db, &username, &id, &patch).await? {
        Some(summary) => Ok(Json(summary)),
        None => Err(ColloquyError::NotFound(format!(
            "No conversation [{}...]",
            prefix_chars(&id, 8)
        ))
        .into()),
    }
}

async fn delete_conversation_handler(
    State(state): State<Arc<AppState>>,
    Extension(SessionUser(username)): Extension<SessionUser>,
    Path(id): Path<String>,
) -> Result<StatusCode> {
    if store::delete_conversation(&state.db, &username, &id).await? {
        tracing::info!("Deleted conversation [{}...]", prefix_chars(&id, 8));
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(ColloquyError::NotFound(format!(
            "No conversation [{}...]",
            prefix_chars(&id, 8)
        ))
        .into())
    }
}

async fn append_turn_handler(
    State(state): State<Arc<AppState>>,
    Extension(SessionUser(username)): Extension<SessionUser>,
    Path(id): Path<String>,
    Json(turn): Json<Turn>,
) -> Result<(StatusCode, Json<Turn>)> {
    let mut turn = turn;
    turn.streaming = false;
    if store::append_turn(&state.db, &username, &id, &turn).await? {
        Ok((StatusCode::CREATED, Json(turn)))
    } else {
        Err(ColloquyError::NotFound(format!(
            "No conversation [{}...]",
            prefix_chars(&id, 8)
        ))
        .into())
    }
}

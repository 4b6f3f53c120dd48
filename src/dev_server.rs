//! Development HTTP server over `MemoryBackend`.
//!
//! Serves the same three routes `HttpChatApi` calls, so the CLI can be run
//! end to end without the real backend. The bearer token is taken verbatim
//! as the caller's user id.
//!
//!   GET  /api/trips/:trip_id/messages                   - thread snapshot for the caller
//!   POST /api/trips/:trip_id/messages                   - {"body"} -> Message (201)
//!   POST /api/trips/:trip_id/messages/:message_id/read  - mark read (204, idempotent)
//!
//! Errors use the `{"ok": false, "error": "..."}` envelope.

use crate::api::memory::MemoryBackend;
use crate::model::{Message, ServerId, ThreadSnapshot, TripId, UserId};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

// ============== Response Envelope ==============

#[derive(Debug, Serialize)]
struct ErrorResponse {
    ok: bool,
    error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            ok: false,
            error: message.into(),
        }),
    )
}

// ============== Auth Helper ==============

fn resolve_auth(headers: &HeaderMap) -> Result<UserId, ApiError> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .map(UserId::from)
        .ok_or_else(|| {
            error(
                StatusCode::UNAUTHORIZED,
                "Missing Authorization: Bearer <user id> header",
            )
        })
}

// ============== Body Types ==============

#[derive(Deserialize)]
struct SendBody {
    body: String,
}

// ============== Routes ==============

pub fn router(backend: MemoryBackend) -> Router {
    Router::new()
        .route(
            "/api/trips/:trip_id/messages",
            get(get_messages).post(send_message),
        )
        .route(
            "/api/trips/:trip_id/messages/:message_id/read",
            post(mark_read),
        )
        .with_state(backend)
}

async fn get_messages(
    State(backend): State<MemoryBackend>,
    Path(trip_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<ThreadSnapshot>, ApiError> {
    let viewer = resolve_auth(&headers)?;
    let trip_id = TripId::from(trip_id);
    Ok(Json(backend.snapshot_for(&trip_id, &viewer)))
}

async fn send_message(
    State(backend): State<MemoryBackend>,
    Path(trip_id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<SendBody>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let sender = resolve_auth(&headers)?;
    let body = req.body.trim();
    if body.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "Message body is empty"));
    }

    let message = backend.post(&TripId::from(trip_id), &sender, body);
    debug!(trip = %message.thread_id, id = %message.id, sender = %sender, "Stored message");
    Ok((StatusCode::CREATED, Json(message)))
}

async fn mark_read(
    State(backend): State<MemoryBackend>,
    Path((trip_id, message_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let viewer = resolve_auth(&headers)?;
    let trip_id = TripId::from(trip_id);
    let message_id = ServerId::from(message_id);

    if backend.mark_read(&trip_id, &message_id, &viewer) {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(error(
            StatusCode::NOT_FOUND,
            format!("No message {} in trip {}", message_id, trip_id),
        ))
    }
}

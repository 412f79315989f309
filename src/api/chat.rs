use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::dispatch::ResponseSource;
use crate::errors::AppError;
use crate::middleware::auth::AuthUser;
use crate::models::audit::{AuditAction, ClientInfo};
use crate::models::chat::ExchangeFilter;
use crate::AppState;

use super::{audit, non_empty};

pub const MAX_SESSION_ID_CHARS: usize = 255;

// ── Request DTOs ─────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub message: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct SessionQuery {
    pub session_id: Option<String>,
}

// ── Handlers ─────────────────────────────────────────────────

/// POST /api/chat/message: run the dispatch chain and persist the exchange
pub async fn send_message(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    client: ClientInfo,
    Json(payload): Json<SendMessageRequest>,
) -> Result<Json<Value>, AppError> {
    let message = non_empty(&payload.message)
        .ok_or_else(|| AppError::Validation("The message field is required.".into()))?;

    let session_id = non_empty(&payload.session_id).map(str::to_string);
    if session_id
        .as_deref()
        .is_some_and(|s| s.chars().count() > MAX_SESSION_ID_CHARS)
    {
        return Err(AppError::Validation(format!(
            "The session id may not be greater than {} characters.",
            MAX_SESSION_ID_CHARS
        )));
    }

    let outcome = state
        .dispatcher
        .dispatch(state.store.as_ref(), user.id, message, session_id, &client)
        .await
        .map_err(|e| AppError::Persistence {
            detail: format!("{:#}", e),
            expose: state.config.debug,
        })?;

    tracing::debug!(
        user_id = user.id,
        exchange_id = outcome.exchange_id,
        source = ?outcome.source,
        "chat message answered"
    );

    let source = match &outcome.source {
        ResponseSource::Provider(name) => name.as_str(),
        ResponseSource::Fallback => "fallback",
    };
    audit(
        &state,
        user.id,
        AuditAction::ChatMessage,
        client,
        json!({
            "session_id": outcome.session_id,
            "message_length": message.chars().count(),
            "api_used": outcome.source != ResponseSource::Fallback,
            "source": source,
        }),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "response": outcome.response,
        "session_id": outcome.session_id,
        "id": outcome.exchange_id,
    })))
}

/// GET /api/chat/history: the caller's exchanges, newest first
pub async fn get_history(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Query(params): Query<SessionQuery>,
) -> Result<Json<Value>, AppError> {
    let mut filter = ExchangeFilter::for_user(user.id);
    filter.session_id = non_empty(&params.session_id).map(str::to_string);

    let history = state.store.list_exchanges(&filter, i64::MAX, 0).await?;

    Ok(Json(json!({
        "success": true,
        "chat_history": history,
    })))
}

/// GET /api/chat/sessions
pub async fn get_sessions(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
) -> Result<Json<Value>, AppError> {
    let sessions = state.store.list_sessions(user.id).await?;
    Ok(Json(json!({
        "success": true,
        "sessions": sessions,
    })))
}

/// DELETE /api/chat/history/:id: one exchange the caller owns
pub async fn delete_history_entry(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    if !state.store.delete_exchange(id, Some(user.id)).await? {
        return Err(AppError::NotFound("chat history"));
    }

    tracing::info!(user_id = user.id, chat_id = id, "chat history entry deleted");
    audit(
        &state,
        user.id,
        AuditAction::DeleteChatHistory,
        client,
        json!({ "chat_history_id": id }),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "message": "Chat history deleted successfully",
        "deleted_count": 1,
    })))
}

/// DELETE /api/chat/history?session_id=: one session, or everything when no
/// session is given
pub async fn delete_history(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    client: ClientInfo,
    Query(params): Query<SessionQuery>,
) -> Result<Json<Value>, AppError> {
    let deleted = match non_empty(&params.session_id) {
        Some(session_id) => state.store.delete_session(user.id, session_id).await?,
        None => state.store.delete_user_exchanges(user.id).await?,
    };

    tracing::info!(
        user_id = user.id,
        session_id = ?params.session_id,
        deleted,
        "chat history deleted"
    );
    audit(
        &state,
        user.id,
        AuditAction::DeleteChatHistory,
        client,
        json!({
            "session_id": non_empty(&params.session_id),
            "deleted_count": deleted,
        }),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "message": "Chat history deleted successfully",
        "deleted_count": deleted,
    })))
}

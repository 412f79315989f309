//! Admin moderation and usage-inspection handlers. Every handler takes an
//! `AdminUser`, so non-admins get 403 before any work happens.

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::errors::AppError;
use crate::middleware::auth::AdminUser;
use crate::models::audit::{AuditAction, ClientInfo};
use crate::models::chat::{parse_tristate, ExchangeFilter, ReviewAction};
use crate::models::usage::UsageFilter;
use crate::AppState;

use super::{audit, non_empty, parse_date, parse_id, Page, PageParams};

pub const MAX_FLAG_REASON_CHARS: usize = 500;
pub const MAX_REVIEW_NOTES_CHARS: usize = 1000;
pub const DEFAULT_SUMMARY_DAYS: i64 = 30;
pub const MAX_SUMMARY_DAYS: i64 = 365;

/// Summary window in days, shared by the HTTP endpoint and the CLI.
pub fn summary_days(days: i64) -> i64 {
    days.clamp(1, MAX_SUMMARY_DAYS)
}

// ── Request DTOs ─────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct ChatListParams {
    pub flagged: Option<String>,
    pub reviewed: Option<String>,
    pub user_id: Option<String>,
    pub session_id: Option<String>,
    pub search: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct UserChatParams {
    pub session_id: Option<String>,
    pub search: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageLogParams {
    pub provider: Option<String>,
    pub success: Option<String>,
    pub user_id: Option<String>,
    pub search: Option<String>,
    pub date_from: Option<String>,
    pub date_to: Option<String>,
    #[serde(flatten)]
    pub page: PageParams,
}

#[derive(Debug, Default, Deserialize)]
pub struct SummaryParams {
    pub days: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct BulkDeleteRequest {
    #[serde(default)]
    pub chat_ids: Vec<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct FlagRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ReviewRequest {
    pub action: Option<String>,
    pub notes: Option<String>,
}

fn check_len(field: &str, value: Option<&str>, max: usize) -> Result<(), AppError> {
    if value.is_some_and(|v| v.chars().count() > max) {
        return Err(AppError::Validation(format!(
            "The {} may not be greater than {} characters.",
            field, max
        )));
    }
    Ok(())
}

// ── Chats ────────────────────────────────────────────────────

/// GET /api/admin/chats
pub async fn list_chats(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<ChatListParams>,
) -> Result<Json<Value>, AppError> {
    let filter = ExchangeFilter {
        user_id: parse_id("user_id", &params.user_id)?,
        session_id: non_empty(&params.session_id).map(str::to_string),
        flagged: parse_tristate(non_empty(&params.flagged)),
        reviewed: parse_tristate(non_empty(&params.reviewed)),
        search: non_empty(&params.search).map(str::to_string),
        date_from: parse_date("date_from", &params.date_from)?,
        date_to: parse_date("date_to", &params.date_to)?,
    };

    let total = state.store.count_exchanges(&filter).await?;
    let chats = state
        .store
        .list_exchanges(&filter, params.page.per_page(), params.page.offset())
        .await?;

    Ok(Json(json!({
        "success": true,
        "chats": Page::new(chats, total, &params.page),
    })))
}

/// GET /api/admin/chats/:id
pub async fn get_chat(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let chat = state
        .store
        .get_exchange(id)
        .await?
        .ok_or(AppError::NotFound("chat"))?;
    Ok(Json(json!({ "success": true, "chat": chat })))
}

/// DELETE /api/admin/chats/:id
pub async fn delete_chat(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let chat = state
        .store
        .get_exchange(id)
        .await?
        .ok_or(AppError::NotFound("chat"))?;
    if !state.store.delete_exchange(id, None).await? {
        return Err(AppError::NotFound("chat"));
    }
    tracing::info!(admin_id = admin.id, chat_id = id, "admin deleted chat");
    audit(
        &state,
        admin.id,
        AuditAction::AdminDeleteChat,
        client,
        json!({
            "chat_id": chat.id,
            "user_id": chat.user_id,
            "session_id": chat.session_id,
        }),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "message": "Chat deleted successfully",
    })))
}

/// POST /api/admin/chats/bulk-delete
pub async fn bulk_delete_chats(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    Json(payload): Json<BulkDeleteRequest>,
) -> Result<Json<Value>, AppError> {
    if payload.chat_ids.is_empty() {
        return Err(AppError::Validation("The chat ids field is required.".into()));
    }

    let deleted = state.store.bulk_delete_exchanges(&payload.chat_ids).await?;
    tracing::info!(
        admin_id = admin.id,
        requested = payload.chat_ids.len(),
        deleted,
        "admin bulk-deleted chats"
    );
    audit(
        &state,
        admin.id,
        AuditAction::AdminBulkDeleteChats,
        client,
        json!({
            "deleted_count": deleted,
            "chat_ids": payload.chat_ids,
        }),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "message": "Chats deleted successfully",
        "deleted_count": deleted,
    })))
}

/// POST /api/admin/chats/:id/flag
pub async fn flag_chat(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    Path(id): Path<i64>,
    body: Option<Json<FlagRequest>>,
) -> Result<Json<Value>, AppError> {
    let Json(payload) = body.unwrap_or_default();
    let reason = non_empty(&payload.reason);
    check_len("reason", reason, MAX_FLAG_REASON_CHARS)?;

    let chat = state
        .store
        .flag_exchange(id, admin.id, reason)
        .await?
        .ok_or(AppError::NotFound("chat"))?;

    tracing::info!(admin_id = admin.id, chat_id = id, "chat flagged");
    audit(
        &state,
        admin.id,
        AuditAction::AdminFlagChat,
        client,
        json!({ "chat_id": id, "reason": reason }),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "message": "Chat flagged successfully",
        "chat": chat,
    })))
}

/// POST /api/admin/chats/:id/unflag
pub async fn unflag_chat(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    Path(id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let chat = state
        .store
        .unflag_exchange(id)
        .await?
        .ok_or(AppError::NotFound("chat"))?;

    tracing::info!(admin_id = admin.id, chat_id = id, "chat unflagged");
    audit(
        &state,
        admin.id,
        AuditAction::AdminUnflagChat,
        client,
        json!({ "chat_id": id }),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "message": "Chat unflagged successfully",
        "chat": chat,
    })))
}

/// POST /api/admin/chats/:id/review
pub async fn review_chat(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    client: ClientInfo,
    Path(id): Path<i64>,
    body: Option<Json<ReviewRequest>>,
) -> Result<Json<Value>, AppError> {
    let Json(payload) = body.unwrap_or_default();

    let action = match non_empty(&payload.action) {
        None => None,
        Some("approve") => Some(ReviewAction::Approve),
        Some("reject") => Some(ReviewAction::Reject),
        Some(_) => {
            return Err(AppError::Validation(
                "The selected action is invalid (expected approve or reject).".into(),
            ))
        }
    };
    let notes = non_empty(&payload.notes);
    check_len("notes", notes, MAX_REVIEW_NOTES_CHARS)?;

    let chat = state
        .store
        .review_exchange(id, admin.id, action, notes)
        .await?
        .ok_or(AppError::NotFound("chat"))?;

    tracing::info!(admin_id = admin.id, chat_id = id, action = ?action, "chat reviewed");
    audit(
        &state,
        admin.id,
        AuditAction::AdminReviewChat,
        client,
        json!({
            "chat_id": id,
            "action": non_empty(&payload.action),
            "notes": notes,
        }),
    )
    .await;
    Ok(Json(json!({
        "success": true,
        "message": "Chat reviewed successfully",
        "chat": chat,
    })))
}

// ── Per-user ─────────────────────────────────────────────────

/// GET /api/admin/users/:id/chats
pub async fn list_user_chats(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Path(user_id): Path<i64>,
    Query(params): Query<UserChatParams>,
) -> Result<Json<Value>, AppError> {
    let filter = ExchangeFilter {
        session_id: non_empty(&params.session_id).map(str::to_string),
        search: non_empty(&params.search).map(str::to_string),
        ..ExchangeFilter::for_user(user_id)
    };

    let total = state.store.count_exchanges(&filter).await?;
    let chats = state
        .store
        .list_exchanges(&filter, params.page.per_page(), params.page.offset())
        .await?;

    Ok(Json(json!({
        "success": true,
        "user_id": user_id,
        "chats": Page::new(chats, total, &params.page),
    })))
}

/// DELETE /api/admin/users/:id/chats
pub async fn delete_user_chats(
    State(state): State<Arc<AppState>>,
    AdminUser(admin): AdminUser,
    Path(user_id): Path<i64>,
) -> Result<Json<Value>, AppError> {
    let deleted = state.store.delete_user_exchanges(user_id).await?;
    tracing::info!(admin_id = admin.id, user_id, deleted, "admin deleted user's chats");
    Ok(Json(json!({
        "success": true,
        "message": "Chats deleted successfully",
        "deleted_count": deleted,
    })))
}

// ── Usage ────────────────────────────────────────────────────

/// GET /api/admin/api/usage-logs
pub async fn list_usage_logs(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<UsageLogParams>,
) -> Result<Json<Value>, AppError> {
    let filter = UsageFilter {
        provider: non_empty(&params.provider)
            .filter(|p| *p != "all")
            .map(str::to_string),
        success: parse_tristate(non_empty(&params.success)),
        user_id: parse_id("user_id", &params.user_id)?,
        search: non_empty(&params.search).map(str::to_string),
        date_from: parse_date("date_from", &params.date_from)?,
        date_to: parse_date("date_to", &params.date_to)?,
    };

    let total = state.store.count_usage(&filter).await?;
    let logs = state
        .store
        .list_usage(&filter, params.page.per_page(), params.page.offset())
        .await?;

    Ok(Json(json!({
        "success": true,
        "logs": Page::new(logs, total, &params.page),
    })))
}

/// GET /api/admin/api/usage-summary?days=30: per-provider totals over every
/// attempt, retries and failures included
pub async fn usage_summary(
    State(state): State<Arc<AppState>>,
    AdminUser(_admin): AdminUser,
    Query(params): Query<SummaryParams>,
) -> Result<Json<Value>, AppError> {
    let days = summary_days(params.days.unwrap_or(DEFAULT_SUMMARY_DAYS));
    let since = Utc::now() - Duration::days(days);
    let providers = state.store.usage_by_provider(since).await?;

    let calls: i64 = providers.iter().map(|p| p.calls).sum();
    let failed: i64 = providers.iter().map(|p| p.failed).sum();
    let total_tokens: i64 = providers.iter().map(|p| p.total_tokens).sum();
    let cost: Decimal = providers.iter().map(|p| p.cost).sum();

    Ok(Json(json!({
        "success": true,
        "days": days,
        "providers": providers,
        "totals": {
            "calls": calls,
            "failed": failed,
            "total_tokens": total_tokens,
            "cost": cost,
        },
    })))
}

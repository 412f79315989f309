use std::sync::Arc;

use axum::{
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, HeaderName, Method, StatusCode},
    middleware,
    response::IntoResponse,
    routing::{delete, get, post},
    Router,
};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::errors::AppError;
use crate::models::audit::{AuditAction, ClientInfo, NewAuditEntry};
use crate::middleware::headers;
use crate::AppState;

pub mod admin;
pub mod chat;

/// Request bodies above this size are rejected with 413.
pub const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the `/api` router. All routes are relative; `build_app` mounts it.
pub fn api_router() -> Router<Arc<AppState>> {
    Router::new()
        // User chat
        .route("/chat/message", post(chat::send_message))
        .route(
            "/chat/history",
            get(chat::get_history).delete(chat::delete_history),
        )
        .route("/chat/history/:id", delete(chat::delete_history_entry))
        .route("/chat/sessions", get(chat::get_sessions))
        // Moderation
        .route("/admin/chats", get(admin::list_chats))
        .route("/admin/chats/bulk-delete", post(admin::bulk_delete_chats))
        .route(
            "/admin/chats/:id",
            get(admin::get_chat).delete(admin::delete_chat),
        )
        .route("/admin/chats/:id/flag", post(admin::flag_chat))
        .route("/admin/chats/:id/unflag", post(admin::unflag_chat))
        .route("/admin/chats/:id/review", post(admin::review_chat))
        .route(
            "/admin/users/:id/chats",
            get(admin::list_user_chats).delete(admin::delete_user_chats),
        )
        // Usage inspection
        .route("/admin/api/usage-logs", get(admin::list_usage_logs))
        .route("/admin/api/usage-summary", get(admin::usage_summary))
        .fallback(fallback_404)
}

/// The full application: ops endpoints, `/api`, and the outer layers.
pub fn build_app(state: Arc<AppState>) -> Router {
    let dashboard_origin = state.config.dashboard_origin.clone();

    Router::new()
        // Health endpoints (no auth)
        .route("/healthz", get(|| async { "ok" }))
        .route("/readyz", get(readiness_check))
        .route("/metrics", get(metrics_handler))
        .nest("/api", api_router())
        .with_state(state)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::predicate(move |origin, _| {
                    let origin_str = origin.to_str().unwrap_or("");
                    origin_str == dashboard_origin
                        || origin_str.starts_with("http://localhost:")
                        || origin_str.starts_with("http://127.0.0.1:")
                }))
                .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
                .allow_headers([
                    CONTENT_TYPE,
                    HeaderName::from_static("authorization"),
                    headers::REQUEST_ID,
                ])
                .allow_credentials(true),
        )
        .layer(middleware::from_fn(headers::request_id))
        .layer(middleware::from_fn(headers::security_headers))
}

async fn fallback_404() -> AppError {
    AppError::NotFound("route")
}

async fn readiness_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.store.ping().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            tracing::warn!("readiness check failed: {:#}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
}

// ── Audit trail ──────────────────────────────────────────────

/// Append to the audit trail. A failed write is logged and the request goes on.
pub async fn audit(
    state: &AppState,
    user_id: i64,
    action: AuditAction,
    client: ClientInfo,
    details: serde_json::Value,
) {
    let entry = NewAuditEntry {
        user_id,
        action,
        client,
        details,
    };
    if let Err(e) = state.store.record_audit(&entry).await {
        tracing::warn!(user_id, action = action.as_str(), "failed to write audit log: {:#}", e);
    }
}

// ── Pagination ───────────────────────────────────────────────

pub const DEFAULT_PER_PAGE: i64 = 20;
pub const MAX_PER_PAGE: i64 = 100;

/// `page` and `per_page` stay strings so they survive `#[serde(flatten)]`
/// under the urlencoded deserializer; unparsable values fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PageParams {
    pub page: Option<String>,
    pub per_page: Option<String>,
}

impl PageParams {
    fn number(value: &Option<String>) -> Option<i64> {
        non_empty(value).and_then(|v| v.parse().ok())
    }

    pub fn page(&self) -> i64 {
        Self::number(&self.page).unwrap_or(1).max(1)
    }

    pub fn per_page(&self) -> i64 {
        Self::number(&self.per_page)
            .unwrap_or(DEFAULT_PER_PAGE)
            .clamp(1, MAX_PER_PAGE)
    }

    pub fn offset(&self) -> i64 {
        (self.page() - 1).saturating_mul(self.per_page())
    }
}

/// Paginated listing, `{data, total, page, per_page, last_page}`.
#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub data: Vec<T>,
    pub total: i64,
    pub page: i64,
    pub per_page: i64,
    pub last_page: i64,
}

impl<T> Page<T> {
    pub fn new(data: Vec<T>, total: i64, params: &PageParams) -> Self {
        let per_page = params.per_page();
        Self {
            data,
            total,
            page: params.page(),
            per_page,
            last_page: ((total + per_page - 1) / per_page).max(1),
        }
    }
}

// ── Query helpers ────────────────────────────────────────────

/// Empty query values count as absent.
pub fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

pub fn parse_date(field: &str, value: &Option<String>) -> Result<Option<NaiveDate>, AppError> {
    non_empty(value)
        .map(|v| {
            NaiveDate::parse_from_str(v, "%Y-%m-%d")
                .map_err(|_| AppError::Validation(format!("{} must be a date (YYYY-MM-DD)", field)))
        })
        .transpose()
}

pub fn parse_id(field: &str, value: &Option<String>) -> Result<Option<i64>, AppError> {
    non_empty(value)
        .map(|v| {
            v.parse::<i64>()
                .map_err(|_| AppError::Validation(format!("{} must be an integer", field)))
        })
        .transpose()
}

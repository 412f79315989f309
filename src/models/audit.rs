use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Where a request came from, as far as the edge lets us tell.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Actions written to the audit trail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    ChatMessage,
    DeleteChatHistory,
    AdminDeleteChat,
    AdminBulkDeleteChats,
    AdminFlagChat,
    AdminUnflagChat,
    AdminReviewChat,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ChatMessage => "chat_message",
            AuditAction::DeleteChatHistory => "delete_chat_history",
            AuditAction::AdminDeleteChat => "admin_delete_chat",
            AuditAction::AdminBulkDeleteChats => "admin_bulk_delete_chats",
            AuditAction::AdminFlagChat => "admin_flag_chat",
            AuditAction::AdminUnflagChat => "admin_unflag_chat",
            AuditAction::AdminReviewChat => "admin_review_chat",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub user_id: i64,
    pub action: AuditAction,
    pub client: ClientInfo,
    pub details: Value,
}

/// One row of `audit_logs`. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub user_id: Option<i64>,
    pub action: String,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Value,
    pub created_at: DateTime<Utc>,
}

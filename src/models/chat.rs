use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// One persisted user-message / assistant-response pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ChatExchange {
    pub id: i64,
    pub user_id: i64,
    pub message: String,
    pub response: String,
    pub session_id: String,
    pub flagged: bool,
    pub reviewed: bool,
    pub flagged_by: Option<i64>,
    pub reviewed_by: Option<i64>,
    pub flagged_at: Option<DateTime<Utc>>,
    pub reviewed_at: Option<DateTime<Utc>>,
    pub flag_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub struct NewExchange {
    pub user_id: i64,
    pub message: String,
    pub response: String,
    pub session_id: String,
}

/// Per-session rollup for the user's session list.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct SessionSummary {
    pub session_id: String,
    pub last_message: String,
    pub last_message_at: DateTime<Utc>,
    pub message_count: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewAction {
    Approve,
    Reject,
}

/// Filters shared by the user history view and the admin chat list.
#[derive(Debug, Clone, Default)]
pub struct ExchangeFilter {
    pub user_id: Option<i64>,
    pub session_id: Option<String>,
    pub flagged: Option<bool>,
    pub reviewed: Option<bool>,
    pub search: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl ExchangeFilter {
    pub fn for_user(user_id: i64) -> Self {
        Self {
            user_id: Some(user_id),
            ..Default::default()
        }
    }

    /// In-process evaluation of the filter. Mirrors the SQL built by
    /// `PgStore::push_exchange_filter`: search is a case-insensitive substring
    /// match on message or response, and date bounds are inclusive days.
    pub fn matches(&self, ex: &ChatExchange) -> bool {
        if self.user_id.is_some_and(|u| u != ex.user_id) {
            return false;
        }
        if self.session_id.as_deref().is_some_and(|s| s != ex.session_id) {
            return false;
        }
        if self.flagged.is_some_and(|f| f != ex.flagged) {
            return false;
        }
        if self.reviewed.is_some_and(|r| r != ex.reviewed) {
            return false;
        }
        if let Some(search) = self.search.as_deref() {
            let needle = search.to_lowercase();
            if !ex.message.to_lowercase().contains(&needle)
                && !ex.response.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        let day = ex.created_at.date_naive();
        if self.date_from.is_some_and(|from| day < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| day > to) {
            return false;
        }
        true
    }
}

/// Parse the admin `true|false|all` tri-state. Anything else means "no filter".
pub fn parse_tristate(raw: Option<&str>) -> Option<bool> {
    match raw {
        Some("true") | Some("1") => Some(true),
        Some("false") | Some("0") => Some(false),
        _ => None,
    }
}

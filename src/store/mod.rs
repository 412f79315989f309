pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::audit::NewAuditEntry;
use crate::models::chat::{ChatExchange, ExchangeFilter, NewExchange, ReviewAction, SessionSummary};
use crate::models::usage::{ApiUsageRecord, NewUsageRecord, ProviderUsage, UsageFilter};
use crate::models::user::User;

/// The two writes the dispatch chain performs.
#[async_trait]
pub trait DispatchSink: Send + Sync {
    async fn insert_exchange(&self, exchange: &NewExchange) -> anyhow::Result<i64>;

    async fn record_usage(&self, record: &NewUsageRecord) -> anyhow::Result<i64>;
}

/// Abstraction over the persistence backend.
/// Implementations: PgStore (Postgres), MemoryStore (local dev and tests).
#[async_trait]
pub trait Store: DispatchSink {
    /// Liveness check used by `/readyz`.
    async fn ping(&self) -> anyhow::Result<()>;

    // -- Identity --

    /// Resolve a hashed bearer token to its owner.
    async fn find_user_by_token(&self, token_hash: &str) -> anyhow::Result<Option<User>>;

    // -- Chat history --

    /// Newest first.
    async fn list_exchanges(
        &self,
        filter: &ExchangeFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ChatExchange>>;

    async fn count_exchanges(&self, filter: &ExchangeFilter) -> anyhow::Result<i64>;

    async fn get_exchange(&self, id: i64) -> anyhow::Result<Option<ChatExchange>>;

    /// Sessions of one user, most recently active first.
    async fn list_sessions(&self, user_id: i64) -> anyhow::Result<Vec<SessionSummary>>;

    /// Delete one exchange. With `owner`, only deletes when the row belongs to
    /// that user.
    async fn delete_exchange(&self, id: i64, owner: Option<i64>) -> anyhow::Result<bool>;

    async fn delete_session(&self, user_id: i64, session_id: &str) -> anyhow::Result<u64>;

    async fn delete_user_exchanges(&self, user_id: i64) -> anyhow::Result<u64>;

    async fn bulk_delete_exchanges(&self, ids: &[i64]) -> anyhow::Result<u64>;

    // -- Moderation --

    async fn flag_exchange(
        &self,
        id: i64,
        flagged_by: i64,
        reason: Option<&str>,
    ) -> anyhow::Result<Option<ChatExchange>>;

    async fn unflag_exchange(&self, id: i64) -> anyhow::Result<Option<ChatExchange>>;

    async fn review_exchange(
        &self,
        id: i64,
        reviewer: i64,
        action: Option<ReviewAction>,
        notes: Option<&str>,
    ) -> anyhow::Result<Option<ChatExchange>>;

    // -- Usage records --

    /// Newest first.
    async fn list_usage(
        &self,
        filter: &UsageFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ApiUsageRecord>>;

    async fn count_usage(&self, filter: &UsageFilter) -> anyhow::Result<i64>;

    async fn usage_by_provider(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ProviderUsage>>;

    // -- Audit trail --

    async fn record_audit(&self, entry: &NewAuditEntry) -> anyhow::Result<i64>;
}

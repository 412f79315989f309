use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use crate::models::audit::NewAuditEntry;
use crate::models::chat::{ChatExchange, ExchangeFilter, NewExchange, ReviewAction, SessionSummary};
use crate::models::usage::{ApiUsageRecord, NewUsageRecord, ProviderUsage, UsageFilter};
use crate::models::user::User;
use crate::store::{DispatchSink, Store};

const EXCHANGE_COLUMNS: &str = "id, user_id, message, response, session_id, flagged, reviewed, \
     flagged_by, reviewed_by, flagged_at, reviewed_at, flag_reason, created_at, updated_at";

const USAGE_COLUMNS: &str = "id, api_provider, endpoint, user_id, model, input_tokens, \
     output_tokens, total_tokens, response_time_ms, status_code, success, error_message, \
     request_data, response_data, ip_address, user_agent, cost, created_at";

#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPool::connect(database_url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Run pending migrations from the migrations/ directory.
    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    fn push_exchange_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &ExchangeFilter) {
        qb.push(" WHERE TRUE");
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(session_id) = &filter.session_id {
            qb.push(" AND session_id = ").push_bind(session_id.clone());
        }
        if let Some(flagged) = filter.flagged {
            qb.push(" AND flagged = ").push_bind(flagged);
        }
        if let Some(reviewed) = filter.reviewed {
            qb.push(" AND reviewed = ").push_bind(reviewed);
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{}%", escape_like(search));
            qb.push(" AND (message ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR response ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(from) = filter.date_from {
            qb.push(" AND (created_at AT TIME ZONE 'UTC')::date >= ").push_bind(from);
        }
        if let Some(to) = filter.date_to {
            qb.push(" AND (created_at AT TIME ZONE 'UTC')::date <= ").push_bind(to);
        }
    }

    fn push_usage_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &UsageFilter) {
        qb.push(" WHERE TRUE");
        if let Some(provider) = &filter.provider {
            qb.push(" AND api_provider = ").push_bind(provider.clone());
        }
        if let Some(success) = filter.success {
            qb.push(" AND success = ").push_bind(success);
        }
        if let Some(user_id) = filter.user_id {
            qb.push(" AND user_id = ").push_bind(user_id);
        }
        if let Some(search) = &filter.search {
            let pattern = format!("%{}%", escape_like(search));
            qb.push(" AND (endpoint ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR model ILIKE ")
                .push_bind(pattern.clone())
                .push(" OR error_message ILIKE ")
                .push_bind(pattern)
                .push(")");
        }
        if let Some(from) = filter.date_from {
            qb.push(" AND (created_at AT TIME ZONE 'UTC')::date >= ").push_bind(from);
        }
        if let Some(to) = filter.date_to {
            qb.push(" AND (created_at AT TIME ZONE 'UTC')::date <= ").push_bind(to);
        }
    }
}

/// Escape LIKE metacharacters so user search terms match literally.
fn escape_like(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '%' | '_' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[async_trait]
impl DispatchSink for PgStore {
    async fn insert_exchange(&self, exchange: &NewExchange) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO chat_history (user_id, message, response, session_id)
               VALUES ($1, $2, $3, $4)
               RETURNING id"#,
        )
        .bind(exchange.user_id)
        .bind(&exchange.message)
        .bind(&exchange.response)
        .bind(&exchange.session_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }

    async fn record_usage(&self, record: &NewUsageRecord) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO api_usage_logs (
                   api_provider, endpoint, user_id, model, input_tokens, output_tokens,
                   total_tokens, response_time_ms, status_code, success, error_message,
                   request_data, response_data, ip_address, user_agent, cost
               )
               VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
               RETURNING id"#,
        )
        .bind(&record.api_provider)
        .bind(&record.endpoint)
        .bind(record.user_id)
        .bind(&record.model)
        .bind(record.input_tokens)
        .bind(record.output_tokens)
        .bind(record.total_tokens)
        .bind(record.response_time_ms)
        .bind(record.status_code)
        .bind(record.success)
        .bind(&record.error_message)
        .bind(&record.request_data)
        .bind(&record.response_data)
        .bind(&record.ip_address)
        .bind(&record.user_agent)
        .bind(record.cost)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

#[async_trait]
impl Store for PgStore {
    async fn ping(&self) -> anyhow::Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    // -- Identity --

    async fn find_user_by_token(&self, token_hash: &str) -> anyhow::Result<Option<User>> {
        let row = sqlx::query_as::<_, User>(
            r#"WITH t AS (
                   UPDATE personal_access_tokens
                   SET last_used_at = NOW()
                   WHERE token = $1 AND (expires_at IS NULL OR expires_at > NOW())
                   RETURNING user_id
               )
               SELECT u.id, u.name, u.username, u.email, u.role
               FROM users u
               JOIN t ON t.user_id = u.id"#,
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    // -- Chat history --

    async fn list_exchanges(
        &self,
        filter: &ExchangeFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ChatExchange>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {EXCHANGE_COLUMNS} FROM chat_history"));
        Self::push_exchange_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb
            .build_query_as::<ChatExchange>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn count_exchanges(&self, filter: &ExchangeFilter) -> anyhow::Result<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM chat_history");
        Self::push_exchange_filter(&mut qb, filter);
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn get_exchange(&self, id: i64) -> anyhow::Result<Option<ChatExchange>> {
        let sql = format!("SELECT {EXCHANGE_COLUMNS} FROM chat_history WHERE id = $1");
        let row = sqlx::query_as::<_, ChatExchange>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn list_sessions(&self, user_id: i64) -> anyhow::Result<Vec<SessionSummary>> {
        // DISTINCT ON keeps the newest row per session; the window count runs
        // before the de-duplication.
        let rows = sqlx::query_as::<_, SessionSummary>(
            r#"SELECT session_id, last_message, last_message_at, message_count
               FROM (
                   SELECT DISTINCT ON (session_id)
                       session_id,
                       message AS last_message,
                       created_at AS last_message_at,
                       COUNT(*) OVER (PARTITION BY session_id) AS message_count
                   FROM chat_history
                   WHERE user_id = $1
                   ORDER BY session_id, created_at DESC, id DESC
               ) s
               ORDER BY last_message_at DESC"#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn delete_exchange(&self, id: i64, owner: Option<i64>) -> anyhow::Result<bool> {
        let result = match owner {
            Some(user_id) => {
                sqlx::query("DELETE FROM chat_history WHERE id = $1 AND user_id = $2")
                    .bind(id)
                    .bind(user_id)
                    .execute(&self.pool)
                    .await?
            }
            None => {
                sqlx::query("DELETE FROM chat_history WHERE id = $1")
                    .bind(id)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected() > 0)
    }

    async fn delete_session(&self, user_id: i64, session_id: &str) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM chat_history WHERE user_id = $1 AND session_id = $2")
            .bind(user_id)
            .bind(session_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn delete_user_exchanges(&self, user_id: i64) -> anyhow::Result<u64> {
        let result = sqlx::query("DELETE FROM chat_history WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn bulk_delete_exchanges(&self, ids: &[i64]) -> anyhow::Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM chat_history WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    // -- Moderation --

    async fn flag_exchange(
        &self,
        id: i64,
        flagged_by: i64,
        reason: Option<&str>,
    ) -> anyhow::Result<Option<ChatExchange>> {
        let sql = format!(
            r#"UPDATE chat_history
               SET flagged = TRUE, flagged_by = $2, flagged_at = NOW(), flag_reason = $3,
                   updated_at = NOW()
               WHERE id = $1
               RETURNING {EXCHANGE_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, ChatExchange>(&sql)
            .bind(id)
            .bind(flagged_by)
            .bind(reason)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn unflag_exchange(&self, id: i64) -> anyhow::Result<Option<ChatExchange>> {
        let sql = format!(
            r#"UPDATE chat_history
               SET flagged = FALSE, flagged_by = NULL, flagged_at = NULL, flag_reason = NULL,
                   updated_at = NOW()
               WHERE id = $1
               RETURNING {EXCHANGE_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, ChatExchange>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn review_exchange(
        &self,
        id: i64,
        reviewer: i64,
        action: Option<ReviewAction>,
        notes: Option<&str>,
    ) -> anyhow::Result<Option<ChatExchange>> {
        let reject = action == Some(ReviewAction::Reject);
        let sql = format!(
            r#"UPDATE chat_history
               SET reviewed = TRUE, reviewed_by = $2, reviewed_at = NOW(),
                   flagged = CASE WHEN $3 THEN TRUE ELSE flagged END,
                   flagged_by = CASE WHEN $3 THEN $2 ELSE flagged_by END,
                   flagged_at = CASE WHEN $3 THEN NOW() ELSE flagged_at END,
                   flag_reason = CASE WHEN $3 AND $4::TEXT IS NOT NULL THEN $4 ELSE flag_reason END,
                   updated_at = NOW()
               WHERE id = $1
               RETURNING {EXCHANGE_COLUMNS}"#
        );
        let row = sqlx::query_as::<_, ChatExchange>(&sql)
            .bind(id)
            .bind(reviewer)
            .bind(reject)
            .bind(notes)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    // -- Usage records --

    async fn list_usage(
        &self,
        filter: &UsageFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ApiUsageRecord>> {
        let mut qb = QueryBuilder::<Postgres>::new(format!("SELECT {USAGE_COLUMNS} FROM api_usage_logs"));
        Self::push_usage_filter(&mut qb, filter);
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let rows = qb
            .build_query_as::<ApiUsageRecord>()
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    async fn count_usage(&self, filter: &UsageFilter) -> anyhow::Result<i64> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM api_usage_logs");
        Self::push_usage_filter(&mut qb, filter);
        let count = qb
            .build_query_scalar::<i64>()
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    async fn usage_by_provider(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ProviderUsage>> {
        let rows = sqlx::query_as::<_, ProviderUsage>(
            r#"
            SELECT
                api_provider AS provider,
                COUNT(*)::bigint AS calls,
                COUNT(*) FILTER (WHERE NOT success)::bigint AS failed,
                COALESCE(SUM(input_tokens), 0)::bigint AS input_tokens,
                COALESCE(SUM(output_tokens), 0)::bigint AS output_tokens,
                COALESCE(SUM(total_tokens), 0)::bigint AS total_tokens,
                COALESCE(SUM(cost), 0)::numeric AS cost,
                COALESCE(AVG(response_time_ms), 0)::float8 AS avg_response_time_ms
            FROM api_usage_logs
            WHERE created_at >= $1
            GROUP BY api_provider
            ORDER BY calls DESC, api_provider ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    // -- Audit trail --

    async fn record_audit(&self, entry: &NewAuditEntry) -> anyhow::Result<i64> {
        let id = sqlx::query_scalar::<_, i64>(
            r#"INSERT INTO audit_logs (user_id, action, ip_address, user_agent, details)
               VALUES ($1, $2, $3, $4, $5)
               RETURNING id"#,
        )
        .bind(entry.user_id)
        .bind(entry.action.as_str())
        .bind(&entry.client.ip_address)
        .bind(&entry.client.user_agent)
        .bind(&entry.details)
        .fetch_one(&self.pool)
        .await?;
        Ok(id)
    }
}

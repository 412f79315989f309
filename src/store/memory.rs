//! In-process store for local development (`STORE_BACKEND=memory`) and tests.
//!
//! Semantics follow `PgStore`: newest-first ordering by `(created_at, id)`,
//! owner-scoped deletes, and the same moderation field transitions.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::audit::{AuditEntry, NewAuditEntry};
use crate::models::chat::{ChatExchange, ExchangeFilter, NewExchange, ReviewAction, SessionSummary};
use crate::models::usage::{ApiUsageRecord, NewUsageRecord, ProviderUsage, UsageFilter};
use crate::models::user::{hash_token, User};
use crate::store::{DispatchSink, Store};

#[derive(Default)]
struct Inner {
    users: HashMap<String, User>,
    exchanges: Vec<ChatExchange>,
    usage: Vec<ApiUsageRecord>,
    audit: Vec<AuditEntry>,
    next_exchange_id: i64,
    next_usage_id: i64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<MutexGuard<'_, Inner>> {
        self.inner.lock().map_err(|_| anyhow!("memory store lock poisoned"))
    }

    /// Register a user reachable through the given plaintext bearer token.
    pub fn add_user(&self, user: User, bearer: &str) -> anyhow::Result<()> {
        self.lock()?.users.insert(hash_token(bearer), user);
        Ok(())
    }

    /// Snapshot of every stored exchange, oldest first.
    pub fn exchanges(&self) -> Vec<ChatExchange> {
        self.lock().map(|g| g.exchanges.clone()).unwrap_or_default()
    }

    /// Snapshot of every usage record, oldest first.
    pub fn usage_records(&self) -> Vec<ApiUsageRecord> {
        self.lock().map(|g| g.usage.clone()).unwrap_or_default()
    }

    /// Snapshot of the audit trail, oldest first.
    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().map(|g| g.audit.clone()).unwrap_or_default()
    }

    fn update_exchange<F>(&self, id: i64, apply: F) -> anyhow::Result<Option<ChatExchange>>
    where
        F: FnOnce(&mut ChatExchange, DateTime<Utc>),
    {
        let mut inner = self.lock()?;
        let now = Utc::now();
        Ok(inner.exchanges.iter_mut().find(|e| e.id == id).map(|ex| {
            apply(ex, now);
            ex.updated_at = now;
            ex.clone()
        }))
    }
}

fn newest_first<T, K: Ord>(items: &mut [T], key: impl Fn(&T) -> K) {
    items.sort_by(|a, b| key(b).cmp(&key(a)));
}

fn page<T>(items: Vec<T>, limit: i64, offset: i64) -> Vec<T> {
    items
        .into_iter()
        .skip(offset.max(0) as usize)
        .take(limit.max(0) as usize)
        .collect()
}

#[async_trait]
impl DispatchSink for MemoryStore {
    async fn insert_exchange(&self, exchange: &NewExchange) -> anyhow::Result<i64> {
        let mut inner = self.lock()?;
        inner.next_exchange_id += 1;
        let id = inner.next_exchange_id;
        let now = Utc::now();
        inner.exchanges.push(ChatExchange {
            id,
            user_id: exchange.user_id,
            message: exchange.message.clone(),
            response: exchange.response.clone(),
            session_id: exchange.session_id.clone(),
            flagged: false,
            reviewed: false,
            flagged_by: None,
            reviewed_by: None,
            flagged_at: None,
            reviewed_at: None,
            flag_reason: None,
            created_at: now,
            updated_at: now,
        });
        Ok(id)
    }

    async fn record_usage(&self, record: &NewUsageRecord) -> anyhow::Result<i64> {
        let mut inner = self.lock()?;
        inner.next_usage_id += 1;
        let id = inner.next_usage_id;
        inner.usage.push(ApiUsageRecord {
            id,
            api_provider: record.api_provider.clone(),
            endpoint: Some(record.endpoint.clone()),
            user_id: record.user_id,
            model: Some(record.model.clone()),
            input_tokens: record.input_tokens,
            output_tokens: record.output_tokens,
            total_tokens: record.total_tokens,
            response_time_ms: record.response_time_ms,
            status_code: record.status_code,
            success: record.success,
            error_message: record.error_message.clone(),
            request_data: record.request_data.clone(),
            response_data: record.response_data.clone(),
            ip_address: record.ip_address.clone(),
            user_agent: record.user_agent.clone(),
            cost: record.cost,
            created_at: Utc::now(),
        });
        Ok(id)
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn ping(&self) -> anyhow::Result<()> {
        self.lock().map(|_| ())
    }

    async fn find_user_by_token(&self, token_hash: &str) -> anyhow::Result<Option<User>> {
        Ok(self.lock()?.users.get(token_hash).cloned())
    }

    async fn list_exchanges(
        &self,
        filter: &ExchangeFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ChatExchange>> {
        let mut rows: Vec<ChatExchange> = self
            .lock()?
            .exchanges
            .iter()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        newest_first(&mut rows, |e| (e.created_at, e.id));
        Ok(page(rows, limit, offset))
    }

    async fn count_exchanges(&self, filter: &ExchangeFilter) -> anyhow::Result<i64> {
        let inner = self.lock()?;
        Ok(inner.exchanges.iter().filter(|e| filter.matches(e)).count() as i64)
    }

    async fn get_exchange(&self, id: i64) -> anyhow::Result<Option<ChatExchange>> {
        Ok(self.lock()?.exchanges.iter().find(|e| e.id == id).cloned())
    }

    async fn list_sessions(&self, user_id: i64) -> anyhow::Result<Vec<SessionSummary>> {
        let inner = self.lock()?;
        let mut by_session: HashMap<&str, SessionSummary> = HashMap::new();
        for ex in inner.exchanges.iter().filter(|e| e.user_id == user_id) {
            let entry = by_session
                .entry(ex.session_id.as_str())
                .or_insert_with(|| SessionSummary {
                    session_id: ex.session_id.clone(),
                    last_message: ex.message.clone(),
                    last_message_at: ex.created_at,
                    message_count: 0,
                });
            entry.message_count += 1;
            // Insertion order is id order, so ties on created_at go to the later row.
            if ex.created_at >= entry.last_message_at {
                entry.last_message = ex.message.clone();
                entry.last_message_at = ex.created_at;
            }
        }
        let mut sessions: Vec<SessionSummary> = by_session.into_values().collect();
        newest_first(&mut sessions, |s| s.last_message_at);
        Ok(sessions)
    }

    async fn delete_exchange(&self, id: i64, owner: Option<i64>) -> anyhow::Result<bool> {
        let mut inner = self.lock()?;
        let before = inner.exchanges.len();
        inner
            .exchanges
            .retain(|e| !(e.id == id && owner.map_or(true, |u| u == e.user_id)));
        Ok(inner.exchanges.len() < before)
    }

    async fn delete_session(&self, user_id: i64, session_id: &str) -> anyhow::Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.exchanges.len();
        inner
            .exchanges
            .retain(|e| !(e.user_id == user_id && e.session_id == session_id));
        Ok((before - inner.exchanges.len()) as u64)
    }

    async fn delete_user_exchanges(&self, user_id: i64) -> anyhow::Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.exchanges.len();
        inner.exchanges.retain(|e| e.user_id != user_id);
        Ok((before - inner.exchanges.len()) as u64)
    }

    async fn bulk_delete_exchanges(&self, ids: &[i64]) -> anyhow::Result<u64> {
        let mut inner = self.lock()?;
        let before = inner.exchanges.len();
        inner.exchanges.retain(|e| !ids.contains(&e.id));
        Ok((before - inner.exchanges.len()) as u64)
    }

    async fn flag_exchange(
        &self,
        id: i64,
        flagged_by: i64,
        reason: Option<&str>,
    ) -> anyhow::Result<Option<ChatExchange>> {
        self.update_exchange(id, |ex, now| {
            ex.flagged = true;
            ex.flagged_by = Some(flagged_by);
            ex.flagged_at = Some(now);
            ex.flag_reason = reason.map(str::to_string);
        })
    }

    async fn unflag_exchange(&self, id: i64) -> anyhow::Result<Option<ChatExchange>> {
        self.update_exchange(id, |ex, _| {
            ex.flagged = false;
            ex.flagged_by = None;
            ex.flagged_at = None;
            ex.flag_reason = None;
        })
    }

    async fn review_exchange(
        &self,
        id: i64,
        reviewer: i64,
        action: Option<ReviewAction>,
        notes: Option<&str>,
    ) -> anyhow::Result<Option<ChatExchange>> {
        self.update_exchange(id, |ex, now| {
            ex.reviewed = true;
            ex.reviewed_by = Some(reviewer);
            ex.reviewed_at = Some(now);
            if action == Some(ReviewAction::Reject) {
                ex.flagged = true;
                ex.flagged_by = Some(reviewer);
                ex.flagged_at = Some(now);
                if let Some(notes) = notes {
                    ex.flag_reason = Some(notes.to_string());
                }
            }
        })
    }

    async fn list_usage(
        &self,
        filter: &UsageFilter,
        limit: i64,
        offset: i64,
    ) -> anyhow::Result<Vec<ApiUsageRecord>> {
        let mut rows: Vec<ApiUsageRecord> = self
            .lock()?
            .usage
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        newest_first(&mut rows, |r| (r.created_at, r.id));
        Ok(page(rows, limit, offset))
    }

    async fn count_usage(&self, filter: &UsageFilter) -> anyhow::Result<i64> {
        let inner = self.lock()?;
        Ok(inner.usage.iter().filter(|r| filter.matches(r)).count() as i64)
    }

    async fn usage_by_provider(&self, since: DateTime<Utc>) -> anyhow::Result<Vec<ProviderUsage>> {
        let inner = self.lock()?;
        let mut acc: HashMap<&str, (ProviderUsage, i64, i64)> = HashMap::new();
        for rec in inner.usage.iter().filter(|r| r.created_at >= since) {
            let (row, latency_sum, latency_n) = acc.entry(rec.api_provider.as_str()).or_insert_with(|| {
                (
                    ProviderUsage {
                        provider: rec.api_provider.clone(),
                        calls: 0,
                        failed: 0,
                        input_tokens: 0,
                        output_tokens: 0,
                        total_tokens: 0,
                        cost: Decimal::ZERO,
                        avg_response_time_ms: 0.0,
                    },
                    0,
                    0,
                )
            });
            row.calls += 1;
            if !rec.success {
                row.failed += 1;
            }
            row.input_tokens += rec.input_tokens as i64;
            row.output_tokens += rec.output_tokens as i64;
            row.total_tokens += rec.total_tokens as i64;
            row.cost += rec.cost.unwrap_or(Decimal::ZERO);
            if let Some(ms) = rec.response_time_ms {
                *latency_sum += ms as i64;
                *latency_n += 1;
            }
        }

        let mut rows: Vec<ProviderUsage> = acc
            .into_values()
            .map(|(mut row, sum, n)| {
                if n > 0 {
                    row.avg_response_time_ms = sum as f64 / n as f64;
                }
                row
            })
            .collect();
        rows.sort_by(|a, b| b.calls.cmp(&a.calls).then_with(|| a.provider.cmp(&b.provider)));
        Ok(rows)
    }

    async fn record_audit(&self, entry: &NewAuditEntry) -> anyhow::Result<i64> {
        let mut inner = self.lock()?;
        let id = inner.audit.len() as i64 + 1;
        inner.audit.push(AuditEntry {
            id,
            user_id: Some(entry.user_id),
            action: entry.action.as_str().to_string(),
            ip_address: entry.client.ip_address.clone(),
            user_agent: entry.client.user_agent.clone(),
            details: entry.details.clone(),
            created_at: Utc::now(),
        });
        Ok(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_exchange(user_id: i64, session: &str, message: &str) -> NewExchange {
        NewExchange {
            user_id,
            message: message.into(),
            response: format!("re: {message}"),
            session_id: session.into(),
        }
    }

    fn usage(provider: &str, success: bool, input: i32, output: i32, cost: Option<Decimal>) -> NewUsageRecord {
        NewUsageRecord {
            api_provider: provider.into(),
            endpoint: "http://upstream/v1/chat/completions".into(),
            user_id: Some(1),
            model: "m".into(),
            input_tokens: input,
            output_tokens: output,
            total_tokens: input + output,
            response_time_ms: Some(100),
            status_code: Some(if success { 200 } else { 503 }),
            success,
            error_message: None,
            request_data: None,
            response_data: None,
            ip_address: None,
            user_agent: None,
            cost,
        }
    }

    #[tokio::test]
    async fn test_delete_session_is_scoped_to_user() {
        let store = MemoryStore::new();
        store.insert_exchange(&new_exchange(1, "shared", "a")).await.unwrap();
        store.insert_exchange(&new_exchange(1, "shared", "b")).await.unwrap();
        store.insert_exchange(&new_exchange(2, "shared", "c")).await.unwrap();
        store.insert_exchange(&new_exchange(1, "other", "d")).await.unwrap();

        let deleted = store.delete_session(1, "shared").await.unwrap();
        assert_eq!(deleted, 2);

        let left: Vec<String> = store.exchanges().into_iter().map(|e| e.message).collect();
        assert_eq!(left, vec!["c", "d"]);
    }

    #[tokio::test]
    async fn test_delete_exchange_respects_owner() {
        let store = MemoryStore::new();
        let id = store.insert_exchange(&new_exchange(1, "s", "mine")).await.unwrap();
        store.insert_exchange(&new_exchange(1, "s", "keep")).await.unwrap();

        assert!(!store.delete_exchange(id, Some(2)).await.unwrap());
        assert!(store.delete_exchange(id, Some(1)).await.unwrap());
        assert!(!store.delete_exchange(id, None).await.unwrap());
        assert_eq!(store.exchanges().len(), 1);
    }

    #[tokio::test]
    async fn test_list_sessions_counts_and_last_message() {
        let store = MemoryStore::new();
        store.insert_exchange(&new_exchange(1, "s1", "first")).await.unwrap();
        store.insert_exchange(&new_exchange(1, "s1", "second")).await.unwrap();
        store.insert_exchange(&new_exchange(1, "s2", "only")).await.unwrap();
        store.insert_exchange(&new_exchange(9, "s3", "not mine")).await.unwrap();

        let sessions = store.list_sessions(1).await.unwrap();
        assert_eq!(sessions.len(), 2);
        let s1 = sessions.iter().find(|s| s.session_id == "s1").unwrap();
        assert_eq!(s1.message_count, 2);
        assert_eq!(s1.last_message, "second");
    }

    #[tokio::test]
    async fn test_review_reject_flags_with_notes() {
        let store = MemoryStore::new();
        let id = store.insert_exchange(&new_exchange(1, "s", "m")).await.unwrap();

        let ex = store
            .review_exchange(id, 99, Some(ReviewAction::Reject), Some("off-topic"))
            .await
            .unwrap()
            .unwrap();
        assert!(ex.reviewed && ex.flagged);
        assert_eq!(ex.reviewed_by, Some(99));
        assert_eq!(ex.flagged_by, Some(99));
        assert_eq!(ex.flag_reason.as_deref(), Some("off-topic"));

        let ex = store.unflag_exchange(id).await.unwrap().unwrap();
        assert!(!ex.flagged);
        assert!(ex.flagged_by.is_none() && ex.flagged_at.is_none() && ex.flag_reason.is_none());
        assert!(ex.reviewed, "unflag leaves review state alone");
    }

    #[tokio::test]
    async fn test_review_approve_does_not_flag() {
        let store = MemoryStore::new();
        let id = store.insert_exchange(&new_exchange(1, "s", "m")).await.unwrap();
        let ex = store
            .review_exchange(id, 5, Some(ReviewAction::Approve), Some("fine"))
            .await
            .unwrap()
            .unwrap();
        assert!(ex.reviewed);
        assert!(!ex.flagged);
        assert!(ex.flag_reason.is_none());
    }

    #[tokio::test]
    async fn test_usage_by_provider_sums_every_attempt() {
        let store = MemoryStore::new();
        store.record_usage(&usage("huggingface", false, 0, 0, None)).await.unwrap();
        store.record_usage(&usage("huggingface", true, 10, 20, None)).await.unwrap();
        store
            .record_usage(&usage("openai", true, 100, 50, Some(Decimal::new(25, 5))))
            .await
            .unwrap();

        let since = Utc::now() - chrono::Duration::days(1);
        let rows = store.usage_by_provider(since).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].provider, "huggingface");
        assert_eq!(rows[0].calls, 2);
        assert_eq!(rows[0].failed, 1);
        assert_eq!(rows[0].total_tokens, 30);
        assert_eq!(rows[0].cost, Decimal::ZERO);
        assert_eq!(rows[1].cost, Decimal::new(25, 5));
        assert_eq!(rows[1].avg_response_time_ms, 100.0);
    }

    #[tokio::test]
    async fn test_record_audit_appends() {
        use crate::models::audit::{AuditAction, ClientInfo};

        let store = MemoryStore::new();
        let entry = NewAuditEntry {
            user_id: 7,
            action: AuditAction::AdminFlagChat,
            client: ClientInfo {
                ip_address: Some("203.0.113.7".into()),
                user_agent: Some("curl/8.0".into()),
            },
            details: serde_json::json!({"chat_id": 3, "reason": "spam"}),
        };
        assert_eq!(store.record_audit(&entry).await.unwrap(), 1);
        assert_eq!(store.record_audit(&entry).await.unwrap(), 2);

        let rows = store.audit_entries();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].action, "admin_flag_chat");
        assert_eq!(rows[0].user_id, Some(7));
        assert_eq!(rows[0].ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(rows[0].details["reason"], "spam");
    }

    #[tokio::test]
    async fn test_list_usage_search() {
        let store = MemoryStore::new();
        let mut failed = usage("huggingface", false, 0, 0, None);
        failed.error_message = Some("request timed out after 90s".into());
        store.record_usage(&failed).await.unwrap();
        store.record_usage(&usage("openai", true, 1, 1, None)).await.unwrap();

        let filter = UsageFilter {
            search: Some("Timed Out".into()),
            ..Default::default()
        };
        let rows = store.list_usage(&filter, 20, 0).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].api_provider, "huggingface");
        assert_eq!(store.count_usage(&filter).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_list_exchanges_pages_newest_first() {
        let store = MemoryStore::new();
        for i in 0..5 {
            store
                .insert_exchange(&new_exchange(1, "s", &format!("msg{i}")))
                .await
                .unwrap();
        }
        let filter = ExchangeFilter::for_user(1);
        let first = store.list_exchanges(&filter, 2, 0).await.unwrap();
        let second = store.list_exchanges(&filter, 2, 2).await.unwrap();
        assert_eq!(first[0].message, "msg4");
        assert_eq!(first[1].message, "msg3");
        assert_eq!(second[0].message, "msg2");
        assert_eq!(store.count_exchanges(&filter).await.unwrap(), 5);
    }
}

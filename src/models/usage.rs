use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Audit row for one outbound provider attempt. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ApiUsageRecord {
    pub id: i64,
    pub api_provider: String,
    pub endpoint: Option<String>,
    pub user_id: Option<i64>,
    pub model: Option<String>,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub response_time_ms: Option<i32>,
    pub status_code: Option<i32>,
    pub success: bool,
    pub error_message: Option<String>,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub cost: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewUsageRecord {
    pub api_provider: String,
    pub endpoint: String,
    pub user_id: Option<i64>,
    pub model: String,
    pub input_tokens: i32,
    pub output_tokens: i32,
    pub total_tokens: i32,
    pub response_time_ms: Option<i32>,
    pub status_code: Option<i32>,
    pub success: bool,
    pub error_message: Option<String>,
    pub request_data: Option<String>,
    pub response_data: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub cost: Option<Decimal>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageFilter {
    pub provider: Option<String>,
    pub success: Option<bool>,
    pub user_id: Option<i64>,
    /// Case-insensitive substring of endpoint, model or error message.
    pub search: Option<String>,
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
}

impl UsageFilter {
    pub fn matches(&self, rec: &ApiUsageRecord) -> bool {
        if self.provider.as_deref().is_some_and(|p| p != rec.api_provider) {
            return false;
        }
        if self.success.is_some_and(|s| s != rec.success) {
            return false;
        }
        if self.user_id.is_some() && self.user_id != rec.user_id {
            return false;
        }
        if let Some(search) = &self.search {
            let needle = search.to_lowercase();
            let hit = [&rec.endpoint, &rec.model, &rec.error_message]
                .into_iter()
                .flatten()
                .any(|field| field.to_lowercase().contains(&needle));
            if !hit {
                return false;
            }
        }
        let day = rec.created_at.date_naive();
        if self.date_from.is_some_and(|from| day < from) {
            return false;
        }
        if self.date_to.is_some_and(|to| day > to) {
            return false;
        }
        true
    }
}

/// Per-provider aggregate over a window. Every attempt counts, retries and
/// failures included.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct ProviderUsage {
    pub provider: String,
    pub calls: i64,
    pub failed: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub cost: Decimal,
    pub avg_response_time_ms: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(endpoint: &str, model: &str, error: Option<&str>) -> ApiUsageRecord {
        ApiUsageRecord {
            id: 1,
            api_provider: "openai".into(),
            endpoint: Some(endpoint.into()),
            user_id: Some(1),
            model: Some(model.into()),
            input_tokens: 0,
            output_tokens: 0,
            total_tokens: 0,
            response_time_ms: None,
            status_code: None,
            success: error.is_none(),
            error_message: error.map(str::to_string),
            request_data: None,
            response_data: None,
            ip_address: None,
            user_agent: None,
            cost: None,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_search_matches_endpoint_model_or_error() {
        let filter = UsageFilter {
            search: Some("TURBO".into()),
            ..Default::default()
        };
        assert!(filter.matches(&record("https://api.openai.com/v1", "gpt-3.5-turbo", None)));
        assert!(!filter.matches(&record("https://router.hf.co/v1", "deephat", None)));

        let filter = UsageFilter {
            search: Some("timed out".into()),
            ..Default::default()
        };
        assert!(filter.matches(&record("https://router.hf.co/v1", "deephat", Some("request timed out after 90s"))));
        assert!(!filter.matches(&record("https://router.hf.co/v1", "deephat", None)));
    }
}

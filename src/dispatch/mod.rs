//! The chat dispatch chain: each configured provider in order, a bounded
//! fixed-delay retry on transient statuses, then a canned reply.
//!
//! Every outbound attempt writes one usage record and every dispatched
//! message writes exactly one exchange. The only error that escapes is a
//! failure to persist that exchange.

pub mod fallback;
pub mod provider;
pub mod retry;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;
use tracing::{info, warn};

use crate::config::{DispatchConfig, ProviderConfig};
use crate::metrics::DispatchMetrics;
use crate::models::audit::ClientInfo;
use crate::models::chat::NewExchange;
use crate::models::usage::NewUsageRecord;
use crate::store::DispatchSink;

use self::provider::Attempt;
use self::retry::{run_with_retry, RetryPolicy};

/// Which part of the chain produced the reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseSource {
    Provider(String),
    Fallback,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub response: String,
    pub session_id: String,
    pub exchange_id: i64,
    pub source: ResponseSource,
}

pub struct Dispatcher {
    providers: Vec<ProviderConfig>,
    backoff: Duration,
    client: reqwest::Client,
    rng: Mutex<StdRng>,
    metrics: Arc<DispatchMetrics>,
}

/// Token counts are stored in INTEGER columns; larger reports saturate.
fn column_count(n: u64) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

pub fn new_session_id() -> String {
    format!("session_{}", uuid::Uuid::new_v4().simple())
}

impl Dispatcher {
    pub fn new(config: &DispatchConfig, metrics: Arc<DispatchMetrics>) -> anyhow::Result<Self> {
        Self::with_rng(config, metrics, StdRng::from_entropy())
    }

    /// Build with an explicit random source for the canned-reply pick.
    pub fn with_rng(
        config: &DispatchConfig,
        metrics: Arc<DispatchMetrics>,
        rng: StdRng,
    ) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .context("failed to build provider HTTP client")?;

        Ok(Self {
            providers: config.providers.clone(),
            backoff: config.retry_backoff,
            client,
            rng: Mutex::new(rng),
            metrics,
        })
    }

    pub fn providers(&self) -> &[ProviderConfig] {
        &self.providers
    }

    /// Answer `message` for `user_id` and persist the exchange.
    ///
    /// `message` must already be validated as non-empty. `client` is copied
    /// onto every usage record.
    pub async fn dispatch<S>(
        &self,
        sink: &S,
        user_id: i64,
        message: &str,
        session_id: Option<String>,
        client: &ClientInfo,
    ) -> anyhow::Result<DispatchOutcome>
    where
        S: DispatchSink + ?Sized,
    {
        let session_id = session_id.unwrap_or_else(new_session_id);

        let mut reply = None;
        for provider in &self.providers {
            if let Some(text) = self.try_provider(sink, provider, user_id, message, client).await {
                reply = Some((text, ResponseSource::Provider(provider.name.clone())));
                break;
            }
        }

        let (response, source) = match reply {
            Some(found) => found,
            None => {
                self.metrics.record_fallback();
                let text = {
                    let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                    fallback::canned_response(message, &mut *rng)
                };
                info!(
                    user_id,
                    providers = self.providers.len(),
                    "Using fallback response; no provider produced a reply"
                );
                (text, ResponseSource::Fallback)
            }
        };

        let exchange_id = sink
            .insert_exchange(&NewExchange {
                user_id,
                message: message.to_string(),
                response: response.clone(),
                session_id: session_id.clone(),
            })
            .await
            .context("failed to persist chat exchange")?;

        Ok(DispatchOutcome {
            response,
            session_id,
            exchange_id,
            source,
        })
    }

    /// All attempts against one provider. `Some` with the reply text on
    /// success.
    async fn try_provider<S>(
        &self,
        sink: &S,
        provider: &ProviderConfig,
        user_id: i64,
        message: &str,
        client: &ClientInfo,
    ) -> Option<String>
    where
        S: DispatchSink + ?Sized,
    {
        let request = provider::build_request(provider, message);
        let body = match serde_json::to_vec(&request) {
            Ok(b) => Bytes::from(b),
            Err(e) => {
                warn!(provider = %provider.name, "failed to encode request: {}", e);
                return None;
            }
        };
        let request_data = String::from_utf8_lossy(&body).into_owned();
        let policy = RetryPolicy::for_provider(provider, self.backoff);

        let last = run_with_retry(&provider.name, &policy, |attempt_no| {
            let body = body.clone();
            let request_data = request_data.as_str();
            async move {
                let attempt = provider::send(&self.client, provider, body).await;
                self.observe(sink, provider, user_id, client, request_data, attempt_no, &attempt)
                    .await;
                attempt
            }
        })
        .await;

        last.result.ok()
    }

    /// Log, count and persist one attempt. Usage-write failures are logged
    /// and swallowed.
    async fn observe<S>(
        &self,
        sink: &S,
        provider: &ProviderConfig,
        user_id: i64,
        client: &ClientInfo,
        request_data: &str,
        attempt_no: u32,
        attempt: &Attempt,
    ) where
        S: DispatchSink + ?Sized,
    {
        let outcome = match &attempt.result {
            Ok(_) => {
                info!(
                    provider = %provider.name,
                    model = %provider.model,
                    attempt = attempt_no,
                    elapsed_ms = attempt.elapsed.as_millis() as u64,
                    "provider replied"
                );
                "success".to_string()
            }
            Err(e) => {
                warn!(
                    provider = %provider.name,
                    model = %provider.model,
                    attempt = attempt_no,
                    status = ?attempt.status,
                    "provider attempt failed: {}",
                    e
                );
                e.class()
            }
        };

        self.metrics.record_attempt(
            &provider.name,
            &outcome,
            attempt.elapsed.as_secs_f64(),
            attempt.usage.as_ref(),
            attempt.cost,
        );

        let usage = attempt.usage.unwrap_or_default();
        let record = NewUsageRecord {
            api_provider: provider.name.clone(),
            endpoint: provider.endpoint.clone(),
            user_id: Some(user_id),
            model: provider.model.clone(),
            input_tokens: column_count(usage.input),
            output_tokens: column_count(usage.output),
            total_tokens: column_count(usage.total),
            response_time_ms: Some(attempt.elapsed.as_millis().min(i32::MAX as u128) as i32),
            status_code: attempt.status.map(i32::from),
            success: attempt.is_success(),
            error_message: attempt.result.as_ref().err().map(|e| e.to_string()),
            request_data: Some(request_data.to_string()),
            response_data: attempt.response_snapshot.clone(),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            cost: attempt.cost,
        };

        if let Err(e) = sink.record_usage(&record).await {
            warn!(provider = %provider.name, "failed to record API usage: {:#}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::cost::TokenPricing;
    use crate::store::memory::MemoryStore;
    use async_trait::async_trait;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn primary(endpoint: String) -> ProviderConfig {
        ProviderConfig {
            name: "huggingface".into(),
            endpoint,
            api_key: "hf_test".into(),
            model: "org/model".into(),
            timeout: Duration::from_secs(5),
            max_retries: 1,
            retryable_status_codes: vec![429, 503],
            system_prompt: None,
            temperature: 0.7,
            max_tokens: 500,
            pricing: None,
        }
    }

    fn secondary(endpoint: String) -> ProviderConfig {
        ProviderConfig {
            name: "openai".into(),
            endpoint,
            api_key: "sk-test".into(),
            model: "gpt-3.5-turbo".into(),
            timeout: Duration::from_secs(5),
            max_retries: 0,
            retryable_status_codes: vec![],
            system_prompt: Some("be helpful".into()),
            temperature: 0.7,
            max_tokens: 500,
            pricing: Some(TokenPricing::gpt35_turbo()),
        }
    }

    fn dispatcher(providers: Vec<ProviderConfig>) -> Dispatcher {
        dispatcher_with_backoff(providers, Duration::from_millis(10))
    }

    fn dispatcher_with_backoff(providers: Vec<ProviderConfig>, retry_backoff: Duration) -> Dispatcher {
        let config = DispatchConfig {
            providers,
            retry_backoff,
        };
        let metrics = Arc::new(DispatchMetrics::new().unwrap());
        Dispatcher::with_rng(&config, metrics, StdRng::seed_from_u64(7)).unwrap()
    }

    fn completion(content: &str) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{"message": {"role": "assistant", "content": content}}],
            "usage": {"prompt_tokens": 10, "completion_tokens": 5, "total_tokens": 15}
        }))
    }

    #[tokio::test]
    async fn test_primary_success_single_record() {
        let hf = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion("hi from hf"))
            .expect(1)
            .mount(&hf)
            .await;

        let store = MemoryStore::new();
        let d = dispatcher(vec![primary(hf.uri())]);
        let client = ClientInfo {
            ip_address: Some("203.0.113.7".into()),
            user_agent: Some("mdukuzi-test/1.0".into()),
        };
        let out = d.dispatch(&store, 1, "hello", None, &client).await.unwrap();

        assert_eq!(out.response, "hi from hf");
        assert_eq!(out.source, ResponseSource::Provider("huggingface".into()));
        assert!(out.session_id.starts_with("session_"));
        assert_eq!(out.session_id.len(), "session_".len() + 32);

        let usage = store.usage_records();
        assert_eq!(usage.len(), 1);
        assert!(usage[0].success);
        assert_eq!(usage[0].status_code, Some(200));
        assert_eq!(usage[0].total_tokens, 15);
        assert_eq!(usage[0].cost, None, "primary has no published pricing");
        assert_eq!(usage[0].ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(usage[0].user_agent.as_deref(), Some("mdukuzi-test/1.0"));

        let exchanges = store.exchanges();
        assert_eq!(exchanges.len(), 1);
        assert_eq!(exchanges[0].id, out.exchange_id);
        assert_eq!(exchanges[0].response, "hi from hf");
    }

    #[tokio::test]
    async fn test_503_then_retry_success_keeps_both_records() {
        let hf = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("loading"))
            .up_to_n_times(1)
            .expect(1)
            .mount(&hf)
            .await;
        Mock::given(method("POST"))
            .respond_with(completion("second time lucky"))
            .expect(1)
            .mount(&hf)
            .await;

        let store = MemoryStore::new();
        let d = dispatcher(vec![primary(hf.uri())]);
        let out = d.dispatch(&store, 1, "hello", Some("s-1".into()), &ClientInfo::default()).await.unwrap();

        assert_eq!(out.response, "second time lucky");
        assert_eq!(out.session_id, "s-1");

        let usage = store.usage_records();
        assert_eq!(usage.len(), 2);
        assert!(!usage[0].success);
        assert_eq!(usage[0].status_code, Some(503));
        assert!(usage[0].error_message.as_deref().unwrap().contains("503"));
        assert!(usage[1].success);

        assert_eq!(store.exchanges()[0].response, "second time lucky");
    }

    #[tokio::test]
    async fn test_500_is_not_retried_and_secondary_is_used() {
        let hf = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&hf)
            .await;

        let openai = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(completion("from openai"))
            .expect(1)
            .mount(&openai)
            .await;

        let store = MemoryStore::new();
        let d = dispatcher_with_backoff(
            vec![
                primary(hf.uri()),
                secondary(format!("{}/v1/chat/completions", openai.uri())),
            ],
            Duration::from_secs(2),
        );
        let start = std::time::Instant::now();
        let out = d.dispatch(&store, 3, "hello", None, &ClientInfo::default()).await.unwrap();
        assert!(
            start.elapsed() < Duration::from_secs(1),
            "secondary must be tried without the retry backoff, took {:?}",
            start.elapsed()
        );

        assert_eq!(out.response, "from openai");
        assert_eq!(out.source, ResponseSource::Provider("openai".into()));

        let usage = store.usage_records();
        assert_eq!(usage.len(), 2);
        assert_eq!(usage[0].api_provider, "huggingface");
        assert_eq!(usage[0].status_code, Some(500));
        assert_eq!(usage[1].api_provider, "openai");
        assert!(usage[1].cost.is_some());
        assert!(usage[1].request_data.as_deref().unwrap().contains("be helpful"));
    }

    #[tokio::test]
    async fn test_huge_token_counts_saturate() {
        let hf = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_json(json!({
                "usage": {"prompt_tokens": 4294967295u64, "completion_tokens": 1}
            })))
            .mount(&hf)
            .await;

        let openai = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{"message": {"content": "big bill"}}],
                "usage": {"prompt_tokens": 10000000000u64, "completion_tokens": 1, "total_tokens": 10000000001u64}
            })))
            .mount(&openai)
            .await;

        let store = MemoryStore::new();
        let d = dispatcher(vec![primary(hf.uri()), secondary(openai.uri())]);
        let out = d.dispatch(&store, 1, "hello", None, &ClientInfo::default()).await.unwrap();
        assert_eq!(out.response, "big bill");

        let usage = store.usage_records();
        assert_eq!(usage.len(), 3);
        assert_eq!(usage[0].input_tokens, i32::MAX);
        assert_eq!(usage[0].output_tokens, 1);
        assert_eq!(usage[0].total_tokens, i32::MAX);
        assert_eq!(usage[2].input_tokens, i32::MAX);
        assert_eq!(usage[2].total_tokens, i32::MAX);
        assert_eq!(usage[2].cost, None, "cost past the column range is dropped");
        assert!(usage.iter().all(|u| u.input_tokens >= 0 && u.total_tokens >= 0));
        assert_eq!(store.exchanges().len(), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_gives_canned_reply() {
        let hf = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429))
            .expect(2)
            .mount(&hf)
            .await;

        let store = MemoryStore::new();
        let d = dispatcher(vec![
            primary(hf.uri()),
            secondary("http://127.0.0.1:9/v1/chat/completions".into()),
        ]);
        let out = d.dispatch(&store, 1, "short one", None, &ClientInfo::default()).await.unwrap();

        assert_eq!(out.source, ResponseSource::Fallback);
        assert_eq!(
            out.response,
            "You said: \"short one\". The AI service is temporarily unavailable. Please try again later."
        );

        let usage = store.usage_records();
        assert_eq!(usage.len(), 3, "two primary attempts plus one secondary");
        assert!(usage.iter().all(|u| !u.success));
        assert_eq!(usage[2].status_code, None);
        assert_eq!(store.exchanges().len(), 1);
    }

    #[tokio::test]
    async fn test_no_providers_configured() {
        let store = MemoryStore::new();
        let d = dispatcher(vec![]);
        let out = d.dispatch(&store, 1, "hi", None, &ClientInfo::default()).await.unwrap();

        assert_eq!(out.source, ResponseSource::Fallback);
        assert!(store.usage_records().is_empty());
        assert_eq!(store.exchanges().len(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_counts_as_failure() {
        let hf = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>oops</html>"))
            .expect(1)
            .mount(&hf)
            .await;

        let store = MemoryStore::new();
        let d = dispatcher(vec![primary(hf.uri())]);
        let out = d.dispatch(&store, 1, "hi", None, &ClientInfo::default()).await.unwrap();

        assert_eq!(out.source, ResponseSource::Fallback);
        let usage = store.usage_records();
        assert_eq!(usage.len(), 1);
        assert!(!usage[0].success);
        assert_eq!(usage[0].status_code, Some(200));
        assert_eq!(usage[0].response_data.as_deref(), Some("<html>oops</html>"));
    }

    #[tokio::test]
    async fn test_seeded_rng_picks_same_template() {
        let message = "a fairly long message that is well past the fifty character echo limit";
        let a = dispatcher(vec![]);
        let b = dispatcher(vec![]);
        let store = MemoryStore::new();

        let ra = a.dispatch(&store, 1, message, None, &ClientInfo::default()).await.unwrap();
        let rb = b.dispatch(&store, 1, message, None, &ClientInfo::default()).await.unwrap();
        assert_eq!(ra.response, rb.response);
        assert!(!ra.response.starts_with("You said:"));
    }

    /// Sink whose usage writes fail and, optionally, whose exchange writes fail.
    #[derive(Default)]
    struct FlakySink {
        fail_exchange: bool,
        exchanges: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DispatchSink for FlakySink {
        async fn insert_exchange(&self, exchange: &NewExchange) -> anyhow::Result<i64> {
            if self.fail_exchange {
                anyhow::bail!("database is down");
            }
            let mut rows = self.exchanges.lock().unwrap();
            rows.push(exchange.response.clone());
            Ok(rows.len() as i64)
        }

        async fn record_usage(&self, _record: &NewUsageRecord) -> anyhow::Result<i64> {
            anyhow::bail!("usage table missing")
        }
    }

    #[tokio::test]
    async fn test_usage_write_failure_is_swallowed() {
        let hf = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(completion("still fine"))
            .mount(&hf)
            .await;

        let sink = FlakySink::default();
        let d = dispatcher(vec![primary(hf.uri())]);
        let out = d.dispatch(&sink, 1, "hello", None, &ClientInfo::default()).await.unwrap();

        assert_eq!(out.response, "still fine");
        assert_eq!(*sink.exchanges.lock().unwrap(), vec!["still fine".to_string()]);
    }

    #[tokio::test]
    async fn test_exchange_persistence_failure_is_an_error() {
        let sink = FlakySink {
            fail_exchange: true,
            ..Default::default()
        };
        let d = dispatcher(vec![]);
        let err = d.dispatch(&sink, 1, "hello", None, &ClientInfo::default()).await.unwrap_err();
        assert!(format!("{:#}", err).contains("database is down"));
    }
}

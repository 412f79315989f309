//! Prometheus metrics for the dispatch chain.
//!
//! Kept on a dedicated registry (not the global default) so every
//! `AppState` owns its own set and tests can build as many as they like.
//! Served as text at `/metrics`.

use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, IntCounter, IntCounterVec,
    Registry, TextEncoder,
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use crate::models::llm::TokenUsage;

pub struct DispatchMetrics {
    registry: Registry,
    attempts_total: IntCounterVec,
    latency_seconds: HistogramVec,
    tokens_total: IntCounterVec,
    cost_usd_total: CounterVec,
    fallback_total: IntCounter,
}

impl DispatchMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();

        let attempts_total = IntCounterVec::new(
            opts!("mdukuzi_provider_attempts_total", "Outbound provider attempts, retries included"),
            &["provider", "outcome"],
        )?;

        let latency_seconds = HistogramVec::new(
            histogram_opts!(
                "mdukuzi_provider_latency_seconds",
                "Provider attempt latency in seconds",
                // LLM-sized buckets: 100ms to 120s
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["provider"],
        )?;

        let tokens_total = IntCounterVec::new(
            opts!("mdukuzi_provider_tokens_total", "Tokens reported by providers"),
            &["provider", "type"],
        )?;

        let cost_usd_total = CounterVec::new(
            opts!("mdukuzi_provider_cost_usd_total", "Estimated provider cost in USD"),
            &["provider"],
        )?;

        let fallback_total = IntCounter::with_opts(opts!(
            "mdukuzi_fallback_responses_total",
            "Messages answered with a canned response"
        ))?;

        registry.register(Box::new(attempts_total.clone()))?;
        registry.register(Box::new(latency_seconds.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(cost_usd_total.clone()))?;
        registry.register(Box::new(fallback_total.clone()))?;

        Ok(Self {
            registry,
            attempts_total,
            latency_seconds,
            tokens_total,
            cost_usd_total,
            fallback_total,
        })
    }

    /// Record one provider attempt. `outcome` is `success` or a short failure
    /// class such as `http_503` or `timeout`.
    pub fn record_attempt(
        &self,
        provider: &str,
        outcome: &str,
        latency_secs: f64,
        usage: Option<&TokenUsage>,
        cost: Option<Decimal>,
    ) {
        self.attempts_total
            .with_label_values(&[provider, outcome])
            .inc();
        self.latency_seconds
            .with_label_values(&[provider])
            .observe(latency_secs);

        if let Some(usage) = usage {
            self.tokens_total
                .with_label_values(&[provider, "input"])
                .inc_by(usage.input);
            self.tokens_total
                .with_label_values(&[provider, "output"])
                .inc_by(usage.output);
        }

        if let Some(cost_f64) = cost.and_then(|c| c.to_f64()) {
            if cost_f64 > 0.0 {
                self.cost_usd_total
                    .with_label_values(&[provider])
                    .inc_by(cost_f64);
            }
        }
    }

    pub fn record_fallback(&self) {
        self.fallback_total.inc();
    }

    /// Encode everything in this registry as Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder
            .encode(&self.registry.gather(), &mut buffer)
            .unwrap_or_default();
        String::from_utf8(buffer).unwrap_or_default()
    }
}

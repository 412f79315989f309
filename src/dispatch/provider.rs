//! One outbound attempt against an OpenAI-compatible chat-completion API.

use std::time::{Duration, Instant};

use bytes::Bytes;
use reqwest::header::CONTENT_TYPE;
use reqwest::Client;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::config::ProviderConfig;
use crate::models::cost::extract_usage;
use crate::models::llm::{extract_completion_text, ChatMessage, CompletionRequest, TokenUsage};

/// Raw replies are stored in the usage row up to this many characters.
pub const RESPONSE_SNAPSHOT_CHARS: usize = 1000;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum AttemptError {
    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("request failed: {0}")]
    Transport(String),

    #[error("provider returned HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response did not contain choices[0].message.content")]
    Malformed,
}

impl AttemptError {
    /// Short label for metrics.
    pub fn class(&self) -> String {
        match self {
            AttemptError::Timeout(_) => "timeout".into(),
            AttemptError::Transport(_) => "transport".into(),
            AttemptError::Status { status, .. } => format!("http_{}", status),
            AttemptError::Malformed => "malformed".into(),
        }
    }
}

/// Everything observed about a single attempt.
#[derive(Debug, Clone)]
pub struct Attempt {
    pub status: Option<u16>,
    pub elapsed: Duration,
    pub usage: Option<TokenUsage>,
    pub cost: Option<Decimal>,
    pub response_snapshot: Option<String>,
    pub result: Result<String, AttemptError>,
}

impl Attempt {
    fn failed(elapsed: Duration, error: AttemptError) -> Self {
        Self {
            status: None,
            elapsed,
            usage: None,
            cost: None,
            response_snapshot: None,
            result: Err(error),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}

pub fn build_request(provider: &ProviderConfig, message: &str) -> CompletionRequest {
    let mut messages = Vec::with_capacity(2);
    if let Some(prompt) = &provider.system_prompt {
        messages.push(ChatMessage::system(prompt.clone()));
    }
    messages.push(ChatMessage::user(message));

    CompletionRequest {
        model: provider.model.clone(),
        messages,
        stream: false,
        temperature: provider.temperature,
        max_tokens: provider.max_tokens,
    }
}

/// Send `body` once. Never returns an error: every failure mode is folded
/// into `Attempt::result`.
pub async fn send(client: &Client, provider: &ProviderConfig, body: Bytes) -> Attempt {
    let start = Instant::now();

    let resp = match client
        .post(&provider.endpoint)
        .bearer_auth(&provider.api_key)
        .header(CONTENT_TYPE, "application/json")
        .timeout(provider.timeout)
        .body(body)
        .send()
        .await
    {
        Ok(r) => r,
        Err(e) => return Attempt::failed(start.elapsed(), classify(e, provider.timeout)),
    };

    let status = resp.status();
    let text = match resp.text().await {
        Ok(t) => t,
        Err(e) => {
            let mut attempt = Attempt::failed(start.elapsed(), classify(e, provider.timeout));
            attempt.status = Some(status.as_u16());
            return attempt;
        }
    };
    let elapsed = start.elapsed();
    let snapshot = truncate_chars(&text, RESPONSE_SNAPSHOT_CHARS);

    let json: Option<serde_json::Value> = serde_json::from_str(&text).ok();
    let usage = json.as_ref().and_then(extract_usage);
    let cost = match (&provider.pricing, &usage) {
        (Some(pricing), Some(usage)) => pricing.recordable_cost(usage),
        _ => None,
    };

    let result = if !status.is_success() {
        Err(AttemptError::Status {
            status: status.as_u16(),
            body: truncate_chars(&text, 200),
        })
    } else {
        json.as_ref()
            .and_then(extract_completion_text)
            .ok_or(AttemptError::Malformed)
    };

    Attempt {
        status: Some(status.as_u16()),
        elapsed,
        usage,
        cost,
        response_snapshot: Some(snapshot),
        result,
    }
}

fn classify(e: reqwest::Error, timeout: Duration) -> AttemptError {
    if e.is_timeout() {
        AttemptError::Timeout(timeout)
    } else {
        AttemptError::Transport(e.to_string())
    }
}

/// Truncate on a char boundary.
pub fn truncate_chars(s: &str, max: usize) -> String {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s[..idx].to_string(),
        None => s.to_string(),
    }
}

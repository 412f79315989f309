use std::time::Duration;

use anyhow::Context;

use crate::models::cost::TokenPricing;

pub const DEFAULT_HF_MODEL: &str = "DeepHat/DeepHat-V1-7B:featherless-ai";
pub const DEFAULT_HF_API_URL: &str = "https://router.huggingface.co/v1/chat/completions";
pub const DEFAULT_AI_API_URL: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_AI_MODEL: &str = "gpt-3.5-turbo";
pub const SECONDARY_SYSTEM_PROMPT: &str =
    "You are a helpful AI assistant. Provide clear and concise responses.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub database_url: String,
    pub store_backend: StoreBackend,
    /// Include internal error detail in 500 responses. Set via APP_DEBUG.
    pub debug: bool,
    /// Extra CORS origin besides localhost. Set via DASHBOARD_ORIGIN.
    pub dashboard_origin: String,
    pub dispatch: DispatchConfig,
}

/// Immutable provider chain, built once at startup.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Tried in order. Providers without a key are left out entirely.
    pub providers: Vec<ProviderConfig>,
    /// Fixed wait between a retryable failure and the retry.
    pub retry_backoff: Duration,
}

#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub endpoint: String,
    pub api_key: String,
    pub model: String,
    pub timeout: Duration,
    pub max_retries: u32,
    pub retryable_status_codes: Vec<u16>,
    pub system_prompt: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    /// `None` when the provider publishes no per-token pricing; cost stays null.
    pub pricing: Option<TokenPricing>,
}

impl Config {
    /// Load from the process environment, reading `.env` first if present.
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> anyhow::Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let debug = get("APP_DEBUG").is_some_and(|v| parse_bool(&v));
        let app_env = get("APP_ENV").unwrap_or_else(|| "local".into());
        if debug && app_env.eq_ignore_ascii_case("production") {
            anyhow::bail!(
                "APP_DEBUG=true is not allowed with APP_ENV=production; \
                 it would leak internal errors to clients"
            );
        }

        let store_backend = match get("STORE_BACKEND").as_deref() {
            None | Some("postgres") => StoreBackend::Postgres,
            Some("memory") => StoreBackend::Memory,
            Some(other) => anyhow::bail!("unknown STORE_BACKEND '{}' (expected postgres|memory)", other),
        };

        let port = match get("PORT") {
            Some(p) => p.parse().with_context(|| format!("invalid PORT '{}'", p))?,
            None => 8000,
        };

        let mut providers = Vec::new();

        if let Some(api_key) = get("HF_TOKEN") {
            providers.push(ProviderConfig {
                name: "huggingface".into(),
                endpoint: endpoint(get("HF_API_URL"), DEFAULT_HF_API_URL, "HF_API_URL")?,
                api_key,
                model: get("HF_MODEL").unwrap_or_else(|| DEFAULT_HF_MODEL.into()),
                timeout: Duration::from_secs(parse_or(get("HF_TIMEOUT_SECS"), 90, "HF_TIMEOUT_SECS")?),
                max_retries: 1,
                retryable_status_codes: vec![429, 503],
                system_prompt: None,
                temperature: 0.7,
                max_tokens: 500,
                pricing: None,
            });
        }

        if let Some(api_key) = get("OPENAI_API_KEY") {
            providers.push(ProviderConfig {
                name: "openai".into(),
                endpoint: endpoint(get("AI_API_URL"), DEFAULT_AI_API_URL, "AI_API_URL")?,
                api_key,
                model: get("AI_MODEL").unwrap_or_else(|| DEFAULT_AI_MODEL.into()),
                timeout: Duration::from_secs(parse_or(get("AI_TIMEOUT_SECS"), 30, "AI_TIMEOUT_SECS")?),
                max_retries: 0,
                retryable_status_codes: Vec::new(),
                system_prompt: Some(SECONDARY_SYSTEM_PROMPT.into()),
                temperature: 0.7,
                max_tokens: 500,
                pricing: Some(TokenPricing::gpt35_turbo()),
            });
        }

        Ok(Config {
            port,
            database_url: get("DATABASE_URL").unwrap_or_else(|| "postgres://localhost/mdukuzi".into()),
            store_backend,
            debug,
            dashboard_origin: get("DASHBOARD_ORIGIN")
                .unwrap_or_else(|| "http://localhost:3000".into()),
            dispatch: DispatchConfig {
                providers,
                retry_backoff: Duration::from_millis(parse_or(
                    get("CHAT_RETRY_BACKOFF_MS"),
                    3000,
                    "CHAT_RETRY_BACKOFF_MS",
                )?),
            },
        })
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn parse_or(value: Option<String>, default: u64, key: &str) -> anyhow::Result<u64> {
    match value {
        Some(v) => v
            .trim()
            .parse()
            .with_context(|| format!("invalid {} '{}'", key, v)),
        None => Ok(default),
    }
}

fn endpoint(value: Option<String>, default: &str, key: &str) -> anyhow::Result<String> {
    let raw = value.unwrap_or_else(|| default.to_string());
    let parsed = url::Url::parse(&raw).with_context(|| format!("{} is not a valid URL", key))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        anyhow::bail!("{} must be an http(s) URL, got scheme '{}'", key, parsed.scheme());
    }
    Ok(raw)
}

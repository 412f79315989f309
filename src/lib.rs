//! mdukuzi: chat backend that answers user messages through a chain of
//! OpenAI-compatible providers and exposes moderation and usage APIs.

pub mod api;
pub mod cli;
pub mod config;
pub mod dispatch;
pub mod errors;
pub mod metrics;
pub mod middleware;
pub mod models;
pub mod store;

use std::sync::Arc;

use config::Config;
use dispatch::Dispatcher;
use metrics::DispatchMetrics;
use store::Store;

/// Shared application state passed to handlers and extractors.
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub dispatcher: Dispatcher,
    pub config: Config,
    pub metrics: Arc<DispatchMetrics>,
}

impl AppState {
    pub fn new(config: Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        let metrics = Arc::new(DispatchMetrics::new()?);
        let dispatcher = Dispatcher::new(&config.dispatch, metrics.clone())?;
        Ok(Self::from_parts(config, store, dispatcher, metrics))
    }

    /// Assemble from pre-built parts, e.g. a dispatcher with a seeded RNG.
    pub fn from_parts(
        config: Config,
        store: Arc<dyn Store>,
        dispatcher: Dispatcher,
        metrics: Arc<DispatchMetrics>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            config,
            metrics,
        }
    }
}

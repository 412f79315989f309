use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mdukuzi::cli::{self, Commands, UsageCommands};
use mdukuzi::config::{Config, StoreBackend};
use mdukuzi::models::usage::UsageFilter;
use mdukuzi::models::user::User;
use mdukuzi::store::memory::MemoryStore;
use mdukuzi::store::postgres::PgStore;
use mdukuzi::store::Store;
use mdukuzi::{api, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing()?;

    let cfg = Config::from_env()?;
    let args = cli::Cli::parse();

    let result = match args.command {
        Some(Commands::Serve { port }) => {
            let port = port.unwrap_or(cfg.port);
            run_server(cfg, port).await
        }
        Some(Commands::Migrate) => {
            let db = PgStore::connect(&cfg.database_url).await?;
            db.migrate().await?;
            println!("Migrations applied.");
            Ok(())
        }
        Some(Commands::Usage { command }) => {
            let store = open_store(&cfg).await?;
            handle_usage_command(command, store.as_ref()).await
        }
        None => {
            let port = cfg.port;
            run_server(cfg, port).await
        }
    };

    if let Err(ref e) = result {
        eprintln!("Error: {:?}", e);
    }
    result
}

/// Console logging, plus an OTLP exporter when OTEL_EXPORTER_OTLP_ENDPOINT is set.
fn init_tracing() -> anyhow::Result<()> {
    use opentelemetry::KeyValue;
    use opentelemetry_sdk::{trace as sdktrace, Resource};

    let telemetry_layer = if std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT").is_ok() {
        let tracer = opentelemetry_otlp::new_pipeline()
            .tracing()
            .with_exporter(opentelemetry_otlp::new_exporter().tonic())
            .with_trace_config(sdktrace::config().with_resource(Resource::new(vec![
                KeyValue::new("service.name", "mdukuzi"),
            ])))
            .install_batch(opentelemetry_sdk::runtime::Tokio)
            .context("failed to install OpenTelemetry tracer")?;
        Some(tracing_opentelemetry::layer().with_tracer(tracer))
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "mdukuzi=debug,tower_http=debug".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .with(telemetry_layer)
        .init();
    Ok(())
}

async fn open_store(cfg: &Config) -> anyhow::Result<Arc<dyn Store>> {
    match cfg.store_backend {
        StoreBackend::Postgres => {
            tracing::info!("Connecting to database...");
            let db = PgStore::connect(&cfg.database_url).await?;
            tracing::info!("Running migrations...");
            db.migrate().await?;
            Ok(Arc::new(db))
        }
        StoreBackend::Memory => {
            tracing::warn!("Using in-memory store; data is lost on restart");
            let store = MemoryStore::new();
            if let Ok(token) = std::env::var("DEV_ADMIN_TOKEN") {
                store.add_user(
                    User {
                        id: 1,
                        name: "Local Admin".into(),
                        username: "admin".into(),
                        email: "admin@localhost".into(),
                        role: "admin".into(),
                    },
                    &token,
                )?;
                tracing::info!("Seeded local admin from DEV_ADMIN_TOKEN");
            }
            Ok(Arc::new(store))
        }
    }
}

async fn run_server(cfg: Config, port: u16) -> anyhow::Result<()> {
    let store = open_store(&cfg).await?;

    if cfg.dispatch.providers.is_empty() {
        tracing::warn!("No AI provider keys configured; every message gets a canned response");
    }
    for p in &cfg.dispatch.providers {
        tracing::info!(
            provider = %p.name,
            model = %p.model,
            endpoint = %p.endpoint,
            timeout_secs = p.timeout.as_secs(),
            "Provider configured"
        );
    }

    let state = Arc::new(AppState::new(cfg, store)?);
    let app = api::build_app(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("mdukuzi listening on {}", addr);
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

async fn handle_usage_command(cmd: UsageCommands, store: &dyn Store) -> anyhow::Result<()> {
    match cmd {
        UsageCommands::Summary { days } => {
            let days = api::admin::summary_days(days);
            let since = chrono::Utc::now() - chrono::Duration::days(days);
            let rows = store.usage_by_provider(since).await?;
            if rows.is_empty() {
                println!("No usage recorded in the last {} days.", days);
            } else {
                println!(
                    "{:<14} {:>8} {:>8} {:>12} {:>12} {:>10}",
                    "PROVIDER", "CALLS", "FAILED", "TOKENS", "COST_USD", "AVG_MS"
                );
                for r in rows {
                    println!(
                        "{:<14} {:>8} {:>8} {:>12} {:>12} {:>10.0}",
                        r.provider, r.calls, r.failed, r.total_tokens, r.cost, r.avg_response_time_ms
                    );
                }
            }
        }
        UsageCommands::Recent { limit } => {
            let rows = store
                .list_usage(&UsageFilter::default(), limit.clamp(1, 1000), 0)
                .await?;
            if rows.is_empty() {
                println!("No usage records found.");
            } else {
                println!(
                    "{:<25} {:<12} {:<6} {:>7} {:>8} {:<}",
                    "CREATED", "PROVIDER", "STATUS", "TOKENS", "MS", "ERROR"
                );
                for r in rows {
                    println!(
                        "{:<25} {:<12} {:<6} {:>7} {:>8} {:<}",
                        r.created_at.format("%Y-%m-%d %H:%M:%S"),
                        r.api_provider,
                        r.status_code.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
                        r.total_tokens,
                        r.response_time_ms.map(|m| m.to_string()).unwrap_or_else(|| "-".into()),
                        r.error_message.as_deref().unwrap_or(""),
                    );
                }
            }
        }
    }
    Ok(())
}

// tokengate - authenticating gateway for LLM completion APIs
//
// The gateway sits between untrusted clients holding access tokens and a
// trusted upstream provider holding the real API key.
//
// Architecture:
// - Auth middleware (axum): resolves bearer tokens to actors via the
//   aggregated sources, rejects before any handler runs
// - Actor sources: cache-through resolution against the identity service,
//   with a background sync worker keeping the cache warm
// - Proxy handlers: transform and forward completion requests, relay the
//   response verbatim while a capped capture feeds usage accounting
// - Event dispatcher: fire-and-forget usage events on detached tasks

mod actor;
mod auth;
mod cli;
mod config;
mod events;
mod identity;
mod proxy;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use actor::cache::MemoryCache;
use actor::subscriptions::SubscriptionsSource;
use actor::worker::SyncWorker;
use actor::Sources;
use auth::AuthState;
use config::Config;
use events::{EventDispatcher, TracingLogger};
use identity::HttpSubscriptionsClient;
use proxy::ProxyState;

#[tokio::main]
async fn main() -> Result<()> {
    // Handle CLI commands first (config --show, --reset, --path)
    // If a command was handled, exit early
    if cli::handle_cli() {
        return Ok(());
    }

    // Ensure config template exists (helps users discover options)
    Config::ensure_config_exists();

    let config = Config::from_env();

    // Initialize tracing
    // Precedence: RUST_LOG env var > config file > default "info"
    let default_filter = format!("tokengate={},axum=debug", config.logging.level);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    // File logging is optional; the guard must outlive main so buffered
    // log lines flush on exit.
    let _file_guard: Option<tracing_appender::non_blocking::WorkerGuard> =
        if config.logging.file_enabled {
            std::fs::create_dir_all(&config.logging.file_dir).with_context(|| {
                format!("creating log directory {:?}", config.logging.file_dir)
            })?;
            let file_appender =
                tracing_appender::rolling::daily(&config.logging.file_dir, "tokengate.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .with(
                    tracing_subscriber::fmt::layer()
                        .json()
                        .with_writer(non_blocking)
                        .with_ansi(false),
                )
                .init();
            Some(guard)
        } else {
            tracing_subscriber::registry()
                .with(filter)
                .with(tracing_subscriber::fmt::layer())
                .init();
            None
        };

    if config.upstream.api_key.is_empty() {
        tracing::warn!("ANTHROPIC_API_KEY is not set; upstream calls will be rejected");
    }
    if config.identity.token.is_empty() {
        tracing::warn!("TOKENGATE_IDENTITY_TOKEN is not set; token resolution will fail");
    }

    // Pooled HTTP client shared by the identity client and the proxy.
    // The generous timeout covers long streaming completions.
    let client = reqwest::Client::builder()
        .timeout(Duration::from_secs(300))
        .pool_max_idle_per_host(10)
        .build()
        .context("building HTTP client")?;

    // Actor resolution: one subscriptions source over an in-memory cache.
    let identity_client = Arc::new(HttpSubscriptionsClient::new(
        client.clone(),
        config.identity.url.clone(),
        config.identity.token.clone(),
    ));
    let cache = Arc::new(MemoryCache::new());
    let subscriptions = Arc::new(SubscriptionsSource::new(
        identity_client,
        cache,
        config.source_config(),
    ));

    let mut sources = Sources::new();
    sources.add_synced(subscriptions);
    let sources = Arc::new(sources);

    let events = EventDispatcher::new(
        Arc::new(TracingLogger),
        Duration::from_millis(config.event_timeout_ms),
    );

    // Background cache sync; the first pass runs at startup.
    let worker = SyncWorker::new(
        sources.clone(),
        Duration::from_secs(config.sync_interval_secs),
    );
    let worker_handle = worker.start();

    let state = ProxyState {
        client,
        upstream: Arc::new(config.upstream.clone()),
        events: events.clone(),
        sources: sources.clone(),
    };
    let auth_state = AuthState { sources, events };

    // Graceful shutdown on Ctrl+C
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(());
        }
    });

    proxy::start_server(config.bind_addr, state, auth_state, shutdown_rx).await?;

    // Stop ticking; an in-flight sync pass finishes on its own.
    worker.stop();
    worker_handle.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}

// HTTP surface of the gateway: one authenticated completions route per
// provider, plus a health probe. Everything request-scoped the handlers need
// travels in `ProxyState`.

pub mod completions;
pub mod error;
pub mod relay;
pub mod usage;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::{get, post};
use axum::{middleware, Router};
use tokio::sync::oneshot;

use crate::actor::Sources;
use crate::auth::{self, AuthState};
use crate::config::UpstreamSettings;
use crate::events::EventDispatcher;

/// Shared state for the completion handlers.
#[derive(Clone)]
pub struct ProxyState {
    /// Connection-pooled client reused across all upstream calls.
    pub client: reqwest::Client,
    pub upstream: Arc<UpstreamSettings>,
    pub events: EventDispatcher,
    pub sources: Arc<Sources>,
}

/// Assemble the gateway router. Authentication wraps only the completion
/// routes; the health probe stays open.
pub fn router(state: ProxyState, auth_state: AuthState) -> Router {
    let completions = Router::new()
        .route(
            "/v1/completions/anthropic",
            post(completions::anthropic_completions),
        )
        .layer(middleware::from_fn_with_state(
            auth_state,
            auth::require_actor,
        ))
        .with_state(state);

    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .merge(completions)
}

/// Bind and serve until the shutdown signal fires.
pub async fn start_server(
    bind_addr: SocketAddr,
    state: ProxyState,
    auth_state: AuthState,
    shutdown: oneshot::Receiver<()>,
) -> Result<()> {
    let app = router(state, auth_state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("binding gateway listener on {bind_addr}"))?;
    tracing::info!("gateway listening on {bind_addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = shutdown.await;
            tracing::info!("gateway shutting down");
        })
        .await
        .context("gateway server error")?;

    Ok(())
}

//! LLM gateway
//!
//! Transparent reverse proxy between Messages-API clients and a fleet of
//! heterogeneous LLM backends:
//! 1. Authenticates the client (API key and/or bearer passthrough)
//! 2. Routes each request to a (provider, credential) pair
//! 3. Rewrites and signs the request per the provider variant
//! 4. Streams the response back verbatim, sniffing thinking signatures

mod auth;
mod config;
mod error;
mod estimate;
mod handler;
mod metrics;
mod middleware;
mod registry;
mod signature;
mod sse;
mod state;

#[cfg(test)]
mod proxy_tests;

use std::time::Duration;

use anyhow::{Context, Result};
use axum::Router as AxumRouter;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::Config;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and LOG_LEVEL / RUST_LOG support
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting llm-gateway");

    // CLI: simple --config flag parsing
    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    // Startup errors (common::Error) carry their own context: the config
    // path, the offending provider/credential id, or the listen address.
    let config = Config::load(&config_path)?;

    info!(
        listen_addr = %config.server.listen_addr,
        strategy = %config.router.strategy,
        providers = config.providers.len(),
        "configuration loaded"
    );

    let strategy = router::Strategy::from_name(&config.router.strategy)
        .context("unknown routing strategy")?;
    let breaker = health::BreakerConfig {
        failure_threshold: config.breaker.failure_threshold,
        open_duration: Duration::from_secs(config.breaker.open_duration_secs),
        half_open_probes: config.breaker.half_open_probes,
    };
    let probe_interval = Duration::from_secs(config.breaker.probe_interval_secs);
    let reload_poll = Duration::from_secs(config.server.reload_poll_secs);
    let listen_addr = config.server.listen_addr;

    let fleet = registry::build_registry(&config)?;
    let metrics_handle = metrics::install_recorder();
    let state = AppState::new(
        config,
        fleet,
        router::Router::new(strategy),
        health::HealthTracker::new(breaker),
        Some(metrics_handle),
    );

    // Background circuit probing follows the current registry snapshot.
    {
        let probe_state = state.clone();
        health::spawn_probe_task(
            std::sync::Arc::clone(state.tracker()),
            state.http().clone(),
            probe_interval,
            move || registry::probe_targets(&probe_state.registry()),
        );
    }

    // Proactive token refresh keeps Vertex-family OAuth credentials warm so
    // the request path rarely pays the exchange latency.
    let oauth_credentials: Vec<_> = state
        .registry()
        .providers()
        .iter()
        .flat_map(|p| p.credentials.credentials().iter().cloned())
        .filter(|c| {
            matches!(
                c.material,
                credential_pool::CredentialMaterial::OAuthRefresh { .. }
            )
        })
        .collect();
    if !oauth_credentials.is_empty() {
        provider::vertex::spawn_refresh_task(
            oauth_credentials,
            state.http().clone(),
            Duration::from_secs(300),
        );
    }

    registry::spawn_reload_task(state.clone(), config_path, reload_poll);

    let app = app(state);

    let listener = TcpListener::bind(listen_addr)
        .await
        .map_err(|source| common::Error::Listen {
            addr: listen_addr,
            source,
        })?;

    info!(addr = %listen_addr, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    info!("shutdown complete");
    Ok(())
}

/// Build the full route tree: authenticated API surface plus the open
/// health and metrics endpoints, wrapped in the request-id and access-log
/// middleware (outermost last in layering order).
fn app(state: AppState) -> AxumRouter {
    let api = AxumRouter::new()
        .route("/v1/messages", post(handler::messages))
        .route("/v1/models", get(handler::list_models))
        .route("/v1/providers", get(handler::list_providers))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            auth::require_client_auth,
        ));

    AxumRouter::new()
        .route("/health", get(handler::health_endpoint))
        .route("/metrics", get(handler::metrics_endpoint))
        .merge(api)
        .layer(axum::middleware::from_fn(middleware::access_log))
        .layer(axum::middleware::from_fn(middleware::request_id))
        .with_state(state)
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

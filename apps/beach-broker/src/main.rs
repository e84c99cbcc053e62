use std::{net::SocketAddr, sync::Arc};

use anyhow::{Context, Result};
use beach_broker::{
    build_router,
    chat::ChatProxy,
    config::{BrokerConfig, Cli},
    guard::{CsrfGuard, RateLimiter},
    image::ImageProxy,
    store::CredentialStore,
    telemetry::{metrics_router, Telemetry},
    AppState, RouterOptions, SessionBroker,
};
use clap::Parser;
use provisioner_sdk::HyperbeamClient;
use tokio::signal;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let telemetry = Telemetry::init()?;

    let cli = Cli::parse();
    let config = BrokerConfig::try_from(cli)?;
    info!(
        listen_addr = %config.listen_addr,
        hyperbeam_base_url = %config.hyperbeam_base_url,
        csrf_enabled = config.csrf_enabled,
        rate_limit_max = config.rate_limit.max_requests,
        rate_limit_window_ms = config.rate_limit.window.as_millis() as u64,
        "starting beach-broker"
    );

    run(config, telemetry).await
}

async fn run(config: BrokerConfig, telemetry: Telemetry) -> Result<()> {
    let client = HyperbeamClient::new(
        config.hyperbeam_base_url.clone(),
        config.hyperbeam_api_key.clone(),
    );
    if !client.has_api_key() {
        error!("HYPERBEAM_API_KEY is not set; session requests will fail until it is configured");
    }

    let broker = SessionBroker::new(
        Arc::new(CredentialStore::new()),
        Arc::new(client),
        config.broker.clone(),
    );
    let limiter = RateLimiter::new(config.rate_limit);
    let sweeper_handle = limiter.spawn_sweeper();

    if config.openrouter.api_key.is_none() {
        warn!("OPENROUTER_API_KEY is not set; chat and image requests will fail");
    }
    let state = AppState {
        broker: broker.clone(),
        chat: ChatProxy::new(config.openrouter.clone()),
        image: ImageProxy::new(config.openrouter.clone()),
    };
    let router = build_router(
        state,
        RouterOptions {
            rate_limiter: Some(limiter),
            csrf: config
                .csrf_enabled
                .then(|| CsrfGuard::new(config.csrf_secure_cookie)),
            max_body_bytes: config.max_body_bytes,
        },
    )
    .merge(metrics_router(telemetry.metrics_handle()));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    info!("beach-broker listening on {}", config.listen_addr);

    let graceful = axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal());
    graceful.await.context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        pending_expiries = broker.expiry().pending(),
        "shutdown signal received; sleeping for graceful period"
    );
    broker.expiry().abort_all();
    sweeper_handle.abort();
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

mod auth;
mod bootstrap;
mod health;
mod providers;
mod renewal;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use renewdesk_core::config::{AppConfig, LoadOptions};
use renewdesk_core::SessionStore;
use tokio::sync::Notify;
use tracing_subscriber::EnvFilter;

use crate::renewal::ApiState;

const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

fn init_logging(config: &AppConfig) {
    use renewdesk_core::config::LogFormat::*;

    let filter = EnvFilter::try_new(&config.logging.level).unwrap_or_else(|_| EnvFilter::new("info"));

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_env_filter(filter).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be live before bootstrap so its events are captured.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;

    health::spawn(
        &app.config.server.bind_address,
        app.config.server.health_check_port,
        app.store.clone(),
    )
    .await?;

    spawn_expiry_sweep(app.store.clone());

    if app.config.auth.staff_tokens.is_empty() {
        tracing::warn!(
            event_name = "system.server.no_staff_tokens",
            correlation_id = "bootstrap",
            "no staff tokens configured; every workflow request will be rejected"
        );
    }

    let state = ApiState { workflow: app.workflow.clone(), auth: Arc::new(app.config.auth.clone()) };
    let api = renewal::router(state).merge(health::router(app.store.clone()));

    let address = format!("{}:{}", app.config.server.bind_address, app.config.server.port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        bind_address = %address,
        "renewdesk-server started"
    );

    let shutdown = Arc::new(Notify::new());
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, api)
                .with_graceful_shutdown(async move { shutdown.notified().await })
                .await
        }
    });

    wait_for_shutdown().await?;
    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        "renewdesk-server stopping"
    );
    shutdown.notify_one();

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    match tokio::time::timeout(grace, server).await {
        Ok(joined) => joined??,
        Err(_) => tracing::warn!(
            event_name = "system.server.drain_timeout",
            correlation_id = "shutdown",
            grace_secs = grace.as_secs(),
            "in-flight requests did not finish before the shutdown deadline"
        ),
    }

    Ok(())
}

fn spawn_expiry_sweep(store: Arc<dyn SessionStore>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            match store.purge_expired().await {
                Ok(0) => {}
                Ok(removed) => tracing::debug!(
                    event_name = "system.store.expired_purged",
                    removed,
                    "expired workflow sessions purged"
                ),
                Err(error) => tracing::warn!(
                    event_name = "system.store.purge_failed",
                    error = %error,
                    "expired session sweep failed"
                ),
            }
        }
    });
}

async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}

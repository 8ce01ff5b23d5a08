use anyhow::{Context, Result};
use hydrolink_client::{HydroLinkApi, HydroLinkClient};
use sqlx::postgres::PgPoolOptions;
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use usage_service::{
    api,
    config::AppConfig,
    coordinator::{AppState, ConnectionPoller, UsagePoller},
    detector::{DetectorConfig, HistoricalDataDetector},
    merger::StatisticsMerger,
    metrics_server, observability,
    statistics::{PgStatisticsStore, StatisticsStore},
};

const LOGIN_MAX_ATTEMPTS: u32 = 3;
const LOGIN_RETRY_BACKOFF: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    // Load configuration
    let cfg = AppConfig::load()?;

    // Start metrics server if configured
    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr);
    }

    let client = Arc::new(HydroLinkClient::new(cfg.hydrolink.base_url.as_deref())?);
    login_with_retry(
        Arc::clone(&client),
        &cfg.hydrolink.username,
        &cfg.hydrolink.password,
    )
    .await?;
    tracing::info!("authenticated with the HydroLink portal");

    // The statistics store is optional; without one, polling and the API
    // still run but historical data is not persisted.
    let merger = match &cfg.statistics {
        Some(stats_cfg) => {
            let pool = PgPoolOptions::new()
                .max_connections(stats_cfg.max_connections)
                .connect(&stats_cfg.uri)
                .await
                .context("connecting to the statistics database")?;
            let store = PgStatisticsStore::new(
                pool,
                stats_cfg.max_retries,
                Duration::from_millis(stats_cfg.retry_backoff_ms),
            );
            store.ensure_schema().await?;
            tracing::info!("statistics store ready");
            Some(StatisticsMerger::new(
                Arc::new(store) as Arc<dyn StatisticsStore>
            ))
        }
        None => {
            tracing::warn!("no statistics store configured, historical usage will not be persisted");
            None
        }
    };

    let state = AppState::new(
        Arc::clone(&client) as Arc<dyn HydroLinkApi>,
        HistoricalDataDetector::new(DetectorConfig::daily()),
        merger,
    );

    let cancel = CancellationToken::new();
    UsagePoller::new(
        state.clone(),
        Duration::from_secs(cfg.poll.usage_interval_secs),
    )
    .start(cancel.clone());
    ConnectionPoller::new(
        state.clone(),
        Duration::from_secs(cfg.poll.connection_interval_secs),
    )
    .start(cancel.clone());

    let router = api::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.api.bind_addr)
        .await
        .with_context(|| format!("binding API server to {}", cfg.api.bind_addr))?;
    tracing::info!("API server listening on {}", cfg.api.bind_addr);

    let shutdown = {
        let cancel = cancel.clone();
        async move {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install CTRL+C signal handler");
            tracing::info!("shutdown signal received");
            cancel.cancel();
        }
    };
    if let Err(e) = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
    {
        tracing::error!(error = %e, "API server error");
    }

    cancel.cancel();
    let logout_client = Arc::clone(&client);
    if let Err(e) = tokio::task::spawn_blocking(move || logout_client.logout()).await? {
        tracing::warn!(error = %e, "logout failed");
    }
    tracing::info!("shutdown complete");

    Ok(())
}

/// Authenticate at startup. Bad credentials fail immediately; transport
/// errors are retried a few times before giving up.
async fn login_with_retry(
    client: Arc<HydroLinkClient>,
    username: &str,
    password: &str,
) -> Result<()> {
    let mut attempt: u32 = 1;
    loop {
        let task_client = Arc::clone(&client);
        let user = username.to_string();
        let pass = password.to_string();
        let outcome = tokio::task::spawn_blocking(move || task_client.login(&user, &pass)).await?;

        match outcome {
            Ok(true) => {
                if !client.is_logged_in() {
                    anyhow::bail!("authentication verification failed");
                }
                return Ok(());
            }
            Ok(false) => anyhow::bail!("HydroLink rejected the configured credentials"),
            Err(e) if e.is_auth() => {
                return Err(anyhow::Error::new(e).context("HydroLink authentication failed"));
            }
            Err(e) if attempt < LOGIN_MAX_ATTEMPTS => {
                let sleep_for = LOGIN_RETRY_BACKOFF * attempt;
                tracing::warn!(error = %e, attempt, "login attempt failed, retrying");
                attempt += 1;
                tokio::time::sleep(sleep_for).await;
            }
            Err(e) => {
                return Err(anyhow::Error::new(e).context("could not reach the HydroLink portal"));
            }
        }
    }
}

//! Windlass worker - provisions mTLS-secured container hosts and keeps them registered

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use windlass::api::{self, AppState};
use windlass::config::WorkerConfig;
use windlass::driver::build_driver;
use windlass::health::{HealthConfig, HealthRegistry};
use windlass::provision::ProvisioningOrchestrator;
use windlass::registry::{ConsulClient, ConsulConfig};
use windlass::secrets::{VaultConfig, VaultStore};
use windlass::telemetry::{init_telemetry, TelemetryConfig};

/// Pause before retrying a failed bootstrap
const BOOTSTRAP_RETRY_DELAY: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = WorkerConfig::parse();

    init_telemetry(&TelemetryConfig {
        format: config.log_format,
        filter: None,
    })?;

    // Refuse to start on bad settings, before anything listens
    config.validate()?;
    tracing::info!(config = ?config, "Starting windlass worker");

    let driver = build_driver(&config)?;
    let registry = Arc::new(ConsulClient::new(ConsulConfig::from_worker_config(&config)));
    let secrets = Arc::new(VaultStore::new(VaultConfig::from_worker_config(&config)));

    let health = HealthRegistry::new(
        HealthConfig::from_worker_config(&config),
        registry,
        driver.clone(),
        secrets.clone(),
    );
    let orchestrator = ProvisioningOrchestrator::new(
        driver,
        secrets,
        health.clone(),
        config.provision_timeout(),
    )
    .with_failure_policy(config.failure_policy);

    let shutdown = CancellationToken::new();
    let bootstrap = tokio::spawn(run_bootstrap(health.clone(), shutdown.clone()));

    let app = api::router(AppState::new(Arc::new(orchestrator)));
    let address = format!("{}:{}", config.http_address, config.port);
    let listener = tokio::net::TcpListener::bind(&address)
        .await
        .with_context(|| format!("failed to bind {}", address))?;
    tracing::info!(address = %address, worker = %config.worker_id(), "Listening");

    let server_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            wait_for_signal().await;
            server_shutdown.cancel();
        })
        .await
        .context("HTTP server failed")?;

    shutdown.cancel();
    if let Err(e) = bootstrap.await {
        tracing::warn!(error = %e, "Bootstrap task ended abnormally");
    }
    health.shutdown().await;

    tracing::info!("Windlass worker shutting down");
    Ok(())
}

/// Register the worker, adopt stored projects, then read the shared secret
///
/// Retried as a whole until it succeeds or the worker shuts down.
async fn run_bootstrap(health: HealthRegistry, shutdown: CancellationToken) {
    loop {
        let attempt = async {
            let report = health.register().await?;
            tracing::info!(
                adopted = report.adopted,
                failed = report.failed,
                "Resumed stored projects"
            );
            health.get_and_set_shared_secret().await
        };

        let result = tokio::select! {
            _ = shutdown.cancelled() => return,
            result = attempt => result,
        };
        match result {
            Ok(()) => {
                tracing::info!("Worker bootstrap complete");
                return;
            }
            Err(e) => {
                tracing::error!(
                    error = %e,
                    retry_in_secs = BOOTSTRAP_RETRY_DELAY.as_secs(),
                    "Worker bootstrap failed"
                );
            }
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(BOOTSTRAP_RETRY_DELAY) => {}
        }
    }
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Cannot listen for SIGTERM, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

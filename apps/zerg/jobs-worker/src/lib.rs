//! Jobs Worker Service
//!
//! A background worker that processes jobs from a RabbitMQ queue.
//!
//! ## Architecture
//!
//! ```text
//! RabbitMQ queue ($JOBS_QUEUE)
//!   ↓ (manual ack, prefetch = $JOBS_PREFETCH)
//! Consumer worker pool ($JOBS_WORKERS)
//!   ↓ (bounded retry with exponential backoff)
//! JobHandler
//!   ↓
//! RabbitMQ exchange ($JOBS_RESULT_EXCHANGE, $JOBS_RESULT_ROUTING_KEY)
//! ```
//!
//! ## Features
//!
//! - Automatic reconnection after broker outages
//! - Dead-lettering of jobs that exhaust their retries
//! - Graceful shutdown handling
//! - Health check endpoint for Kubernetes probes

mod config;
mod handler;

pub use config::WorkerSettings;
pub use handler::{AmqpResultSink, JobCompleted, JobHandler, JobKind, JobMessage, ResultSink};

use amqp_worker::{
    health_router, CancellationToken, Client, ConnectionConfig, ConsumerConfig, HealthState,
};
use core_config::{app_info, Environment, FromEnv};
use eyre::{Result, WrapErr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

/// Start the health HTTP server
///
/// Provides endpoints for:
/// - Liveness probes: `/health`, `/healthz`
/// - Readiness probes: `/ready`, `/readyz`
/// - Prometheus metrics: `/metrics`
async fn start_health_server(health_state: HealthState, port: u16) -> Result<()> {
    let app = health_router(health_state).layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", port);
    let listener = TcpListener::bind(&addr)
        .await
        .wrap_err_with(|| format!("Failed to bind health server to {}", addr))?;

    info!(port = %port, "Health server listening");

    axum::serve(listener, app)
        .await
        .wrap_err("Health server failed")?;

    Ok(())
}

/// Run the jobs worker
///
/// This is the main entry point for the worker. It:
/// 1. Sets up error reports and structured logging
/// 2. Connects to the broker (fails fast if it is unreachable)
/// 3. Consumes jobs until SIGINT or SIGTERM
/// 4. Closes the client
///
/// # Errors
///
/// Returns an error if:
/// - Configuration is invalid
/// - The initial broker connection fails
/// - The consumer stops for any reason other than shutdown
pub async fn run() -> Result<()> {
    core_config::tracing::install_color_eyre();

    let environment = Environment::from_env();
    core_config::tracing::init_tracing(&environment);

    amqp_worker::init_metrics();

    let app_info = app_info!();

    info!(name = %app_info.name, version = %app_info.version, "Starting jobs worker service");
    info!("Environment: {:?}", environment);

    let settings = WorkerSettings::from_env().wrap_err("Failed to load worker settings")?;
    let mut connection_config =
        ConnectionConfig::from_env().wrap_err("Failed to load AMQP configuration")?;
    if connection_config.app_name.is_none() {
        connection_config = connection_config.with_app_name(app_info.name.clone());
    }
    let consumer_config =
        ConsumerConfig::from_env_prefixed("JOBS").wrap_err("Failed to load consumer configuration")?;

    info!(
        queue = %consumer_config.queue,
        consumer = %consumer_config.name,
        prefetch = consumer_config.prefetch_count,
        workers = consumer_config.workers,
        retry_max = consumer_config.retry_max,
        "Consumer configuration loaded"
    );

    info!(url = %connection_config.redacted_url(), "Connecting to AMQP broker...");
    let client = Client::connect(connection_config)
        .await
        .wrap_err("Failed to connect to AMQP broker")?;
    info!("Connected to AMQP broker successfully");

    let cancel = CancellationToken::new();

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = shutdown_signal().await {
                error!("Error waiting for shutdown signal: {}", e);
            }
            cancel.cancel();
        });
    }

    let health_state = HealthState::new(
        client.manager().clone(),
        app_info.name,
        app_info.version,
    );
    let health_port = settings.health_port;
    tokio::spawn(async move {
        if let Err(e) = start_health_server(health_state, health_port).await {
            error!(error = %e, "Health server failed");
        }
    });

    let sink = AmqpResultSink::new(
        client.publisher().clone(),
        settings.result_exchange,
        settings.result_routing_key,
    );
    let handler = Arc::new(JobHandler::new(sink));

    info!("Starting job consumer...");
    let consumed = client
        .start_consuming(cancel.clone(), consumer_config, handler)
        .await;

    if let Err(e) = client.close().await {
        warn!(error = %e, "Error while closing AMQP client");
    }

    consumed.wrap_err("Job consumer stopped")?;

    info!("Jobs worker service stopped");
    Ok(())
}

/// Wait for a shutdown signal (SIGINT or SIGTERM)
async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.wrap_err("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .wrap_err("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok::<(), eyre::Report>(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => {
            result?;
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        result = terminate => {
            result?;
            info!("Received SIGTERM, initiating graceful shutdown...");
        }
    }

    Ok(())
}

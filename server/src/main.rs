//! Courier service.
//!
//! Run with: `cargo run --bin courier`
//!
//! - Request: `GET http://localhost:8181/request?value=7`
//! - Backend: `GET http://localhost:8181/backend?value=1`
//! - Health: `GET http://localhost:8181/health`, `/health/ready`
//! - Metrics: `GET http://localhost:8181/metrics`

use anyhow::Context;
use courier_core::bus::MessageBus;
use courier_redpanda::RedpandaBus;
use courier_runtime::metrics::MetricsExporter;
use courier_runtime::{Backend, Correlator, PartitionPinner, ReplyHandler, WorkerPool};
use courier_server::{HttpBackend, ServiceConfig};
use courier_web::AppState;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file (if present)
    let _ = dotenvy::dotenv();

    init_tracing();

    let config = ServiceConfig::from_env().context("Invalid configuration")?;
    info!(
        brokers = %config.brokers,
        request_topic = %config.request_topic,
        reply_topic = %config.reply_topic,
        consumer_group = %config.consumer_group,
        repin_policy = %config.repin_policy,
        backend = config.backend_url.as_deref().unwrap_or("in-process"),
        "Configuration loaded"
    );

    let mut exporter = MetricsExporter::new();
    exporter
        .install()
        .context("Failed to install metrics exporter")?;

    let bus: Arc<dyn MessageBus> = Arc::new(
        RedpandaBus::builder()
            .brokers(&config.brokers)
            .producer_acks("all")
            .consumer_group(&config.consumer_group)
            .auto_offset_reset("latest")
            .build()
            .context("Failed to create Redpanda bus")?,
    );

    let pool = WorkerPool::new("backend", config.pool_config());
    let backend: Arc<dyn Backend> = match &config.backend_url {
        Some(url) => Arc::new(
            HttpBackend::new(url, config.reply_timeout).context("Failed to build HTTP backend")?,
        ),
        None => Arc::new(pool.clone()),
    };

    // Replier side: answer everything on the request topic
    let requests = bus
        .subscribe(&[config.request_topic.as_str()])
        .await
        .context("Failed to subscribe to request topic")?;
    let replier = ReplyHandler::new(Arc::clone(&bus), backend).spawn(requests.records);

    // Requester side: pin a reply partition before serving traffic
    let pinner = Arc::new(PartitionPinner::new(&config.reply_topic, config.repin_policy));
    let correlator = Correlator::new(Arc::clone(&bus), Arc::clone(&pinner));
    let listener = correlator.attach(
        bus.subscribe(&[config.reply_topic.as_str()])
            .await
            .context("Failed to subscribe to reply topic")?,
    );

    match tokio::time::timeout(config.ready_timeout, pinner.ready()).await {
        Ok(pinned) => info!(partition = %pinned, "Reply partition pinned"),
        Err(_) => warn!(
            timeout_ms = u64::try_from(config.ready_timeout.as_millis()).unwrap_or(u64::MAX),
            "No reply partition yet; /request answers 503 until one is assigned"
        ),
    }

    let state = AppState::new(correlator, pool, config.request_topic.as_str())
        .with_reply_timeout(config.reply_timeout)
        .with_metrics(Arc::new(exporter));
    let app = courier_web::router(state);

    let tcp = tokio::net::TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.http_addr))?;
    info!(addr = %config.http_addr, "HTTP server listening");

    axum::serve(tcp, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("HTTP server error")?;

    listener.abort();
    replier.abort();
    info!("Shutdown complete");
    Ok(())
}

/// Initialize tracing from `RUST_LOG`.
fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "courier=info,courier_server=info,courier_runtime=info,courier_redpanda=info,tower_http=info"
                    .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            error!("Unable to listen for shutdown signal: {}", err);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                error!("Unable to listen for SIGTERM: {}", err);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, draining HTTP connections");
}

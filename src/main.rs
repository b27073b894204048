//! Hookline webhook processing service.
//!
//! Reads verified webhook requests as newline-delimited JSON from stdin,
//! dispatches them to handlers and retries failures until the input ends or
//! the process is interrupted.

use std::sync::Arc;

use anyhow::{Context, Result};
use hookline::{intake, AuditHandler, Config};
use hookline_core::{MemoryStore, RealClock};
use hookline_delivery::WebhookEngine;
use tokio::io::BufReader;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.log_filter)?;

    info!(
        max_retries = config.max_retries,
        handler_timeout_ms = config.handler_timeout_ms,
        audit_topics = config.audit_topics.len(),
        merchants = config.merchants.len(),
        "Configuration loaded"
    );

    let mut engine = WebhookEngine::new(
        Arc::new(MemoryStore::new()),
        Arc::new(RealClock::new()),
        Arc::new(config.merchant_directory()?),
        config.to_engine_config(),
    )
    .context("failed to build engine")?;

    let audit_topics = config.audit_topics()?;
    if !audit_topics.is_empty() {
        engine.register(Arc::new(AuditHandler::new(audit_topics)));
    }

    // Retry checkpoints live in the in-memory store and die with the
    // process, so a fresh start has nothing for `engine.recover()` to re-arm.
    engine.start().context("failed to start engine")?;
    info!("Hookline is ready to receive webhooks");

    let token = CancellationToken::new();
    tokio::spawn({
        let token = token.clone();
        async move {
            shutdown_signal().await;
            token.cancel();
        }
    });

    let summary = intake::run(&engine, BufReader::new(tokio::io::stdin()), &token).await?;
    info!(dispatched = summary.dispatched, rejected = summary.rejected, "Input closed, shutting down");

    match engine.metrics_report().await {
        Ok(report) => match serde_json::to_string(&report) {
            Ok(report) => info!(report = %report, "Final metrics"),
            Err(error) => warn!(error = %error, "Failed to encode metrics report"),
        },
        Err(error) => warn!(error = %error, "Failed to read metrics report"),
    }

    engine.shutdown().await.context("engine shutdown failed")?;
    info!("Hookline shutdown complete");
    Ok(())
}

/// Initializes tracing, preferring `RUST_LOG` over the configured filter.
fn init_tracing(default_filter: &str) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_filter))
        .context("invalid log filter")?;

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt_layer)
        .try_init()
        .context("failed to install tracing subscriber")
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            warn!(error = %error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(error) => {
                warn!(error = %error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C signal");
        },
        () = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}

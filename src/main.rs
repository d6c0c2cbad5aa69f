// src/main.rs
use crate::config::AppConfig;
use crate::connectors::broker::RestBroker;
use crate::connectors::feed::{FeedConfig, FeedConnection};
use crate::core::engine::ExecutionEngine;
use crate::core::ledger::PositionLedger;
use anyhow::{Context, Result};
use chrono::Utc;
use dotenvy::dotenv;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};
use tracing_subscriber::fmt::writer::{BoxMakeWriter, MakeWriterExt};
use tracing_subscriber::EnvFilter;
use url::Url;

mod config;
mod connectors;
mod core;
mod error;
mod types;
mod utils;

/// How long the in-flight signal may take to finish after Ctrl+C before we
/// give up and abort it.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();

    // 1. Load and validate configuration
    let config = AppConfig::new().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;
    Url::parse(&config.broadcaster.url).context("invalid broadcaster url")?;

    let _log_guard = init_tracing(&config.logging);

    println!("========================================");
    println!("       SIGNAL RUNNER - v0.1.0");
    println!("========================================");
    println!("Feed:   {}", config.broadcaster.url);
    println!(
        "Mode:   {}",
        if config.trading.auto_execute {
            "🚨 AUTO-EXECUTE"
        } else {
            "📝 LOG ONLY"
        }
    );
    println!("========================================");

    // 2. Initialize components
    let params = config.params();
    let call_timeout = Duration::from_secs(config.broker.request_timeout_secs);

    let broker = Arc::new(RestBroker::new(
        config.broker.base_url.clone(),
        config.broker.api_secret.clone(),
        call_timeout,
    ));

    // 3. Create channels
    let (event_tx, event_rx) = mpsc::channel(100);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // 4. Spawn the connection task
    let feed_config = FeedConfig::new(
        config.broadcaster.url.clone(),
        config.broadcaster.auth_secret.clone(),
        config.broadcaster.client_id(),
    );
    let mut feed = FeedConnection::new(feed_config, event_tx, shutdown_rx.clone());
    let mut feed_task = tokio::spawn(async move { feed.run().await });

    // 5. Run the engine
    let mut engine = ExecutionEngine::new(
        params,
        broker,
        PositionLedger::new(Utc::now().date_naive()),
        event_rx,
        shutdown_rx,
        call_timeout,
    );
    let mut engine_task = tokio::spawn(async move { engine.run().await });

    // The feed task ends on its own only on fatal errors (bad auth secret);
    // otherwise we run until Ctrl+C.
    let feed_outcome = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C received, shutting down");
            None
        }
        result = &mut feed_task => Some(result),
    };

    // Ask both tasks to stop. The engine finishes its in-flight signal
    // before honoring the request; it is never aborted mid-order.
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(SHUTDOWN_GRACE, &mut engine_task).await {
        Ok(Ok(result)) => {
            if let Err(e) = result {
                error!("Fatal engine error: {e:#}");
            }
        }
        Ok(Err(e)) => error!("engine task panicked: {e}"),
        Err(_) => {
            warn!("engine did not finish within the grace period, aborting in-flight work");
            engine_task.abort();
        }
    }

    let feed_result = match feed_outcome {
        Some(result) => Some(result),
        None => tokio::time::timeout(Duration::from_secs(5), &mut feed_task)
            .await
            .ok(),
    };
    if !feed_task.is_finished() {
        feed_task.abort();
    }
    match feed_result {
        Some(Ok(Err(e))) => {
            error!("Fatal feed error: {e}");
            return Err(e.into());
        }
        Some(Err(e)) => return Err(anyhow::anyhow!("feed task panicked: {e}")),
        _ => {}
    }

    info!("shutdown complete");
    Ok(())
}

/// Console + non-blocking rotating log file.
/// The returned guard must stay alive or buffered lines are lost on exit.
fn init_tracing(config: &config::LoggingConfig) -> tracing_appender::non_blocking::WorkerGuard {
    let file_appender = tracing_appender::rolling::daily(".", &config.file);
    let (file_writer, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    let writer = if config.console {
        BoxMakeWriter::new(file_writer.and(std::io::stdout))
    } else {
        BoxMakeWriter::new(file_writer)
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .init();

    guard
}

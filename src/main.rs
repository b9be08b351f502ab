use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

use ara_work_queue::config::Settings;
use ara_work_queue::queue::{
    register_redis_backend, BackendRegistry, HandlerFn, Queue, QueueFactory,
};
use ara_work_queue::shutdown::{GracefulShutdown, Lifecycle};
use ara_work_queue::telemetry::init_telemetry;
use ara_work_queue::QueueError;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing
    let _telemetry = init_telemetry(&settings.logging, &settings.otel)?;
    tracing::info!("Configuration loaded");

    let registry = BackendRegistry::<Value>::with_defaults();
    register_redis_backend(&registry);
    let factory = QueueFactory::new(Arc::new(registry));

    let handler: HandlerFn<Value> = Arc::new(|item: Value| {
        tracing::info!(item = %item, "Work item handled");
    });
    let queue = factory
        .new_queue(handler, settings.queue_config(), settings.exemplar.clone())
        .await
        .context("Failed to create queue")?;
    tracing::info!(queue = %queue.name(), "Queue created");

    // Consume in the background
    let lifecycle = Lifecycle::new();
    let mut runner = {
        let queue = queue.clone();
        let lifecycle = lifecycle.clone();
        tokio::spawn(async move {
            queue
                .run(&lifecycle.at_shutdown, &lifecycle.at_terminate)
                .await
        })
    };

    // Feed JSON lines from stdin
    let feeder = tokio::spawn(feed_stdin(queue.clone()));

    tokio::select! {
        _ = shutdown_signal() => {}
        result = &mut runner => {
            feeder.abort();
            result
                .context("Queue task panicked")?
                .context("Queue stopped unexpectedly")?;
            return Ok(());
        }
    }
    feeder.abort();

    let shutdown = GracefulShutdown::with_config(
        lifecycle,
        factory.manager().clone(),
        settings.shutdown_config(),
    );
    shutdown.execute("signal").await;

    match runner.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::warn!(error = %e, "Queue stopped with error"),
        Err(e) => tracing::error!(error = %e, "Queue task failed"),
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn feed_stdin(queue: Arc<dyn Queue<Value>>) -> Result<()> {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let item: Value = match serde_json::from_str(line) {
            Ok(item) => item,
            Err(e) => {
                tracing::warn!(error = %e, "Skipping malformed input line");
                continue;
            }
        };

        match queue.push(item).await {
            Ok(()) => {}
            Err(QueueError::Closed(_)) => break,
            Err(e) => tracing::warn!(error = %e, "Rejected work item"),
        }
    }

    tracing::debug!("Input closed");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }
}

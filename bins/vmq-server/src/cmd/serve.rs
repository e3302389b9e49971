use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use vmq_api::{StorageBackend, StorageFactory, SystemClock};
use vmq_engine::{Broker, BrokerCounters, spawn_retention, spawn_sweeper};
use vmq_storage_file::FileStorageFactory;
use vmq_storage_memory::MemoryStorageFactory;

use crate::config::{ServeArgs, ServerConfig, StorageKind, StorageSection};
use crate::error::ServerError;

fn open_backend(section: &StorageSection) -> Result<Arc<dyn StorageBackend>, ServerError> {
    let config_json = section.config_json()?;
    let backend = match section.kind {
        StorageKind::File => FileStorageFactory.create(&config_json)?,
        StorageKind::Memory => MemoryStorageFactory.create(&config_json)?,
    };
    Ok(backend)
}

pub async fn run(args: ServeArgs) -> Result<(), ServerError> {
    tracing::info!("vmq-server starting");

    // --- Load config ---
    let config = ServerConfig::load(&args.config)?;
    tracing::info!(config = %args.config, "loaded config");

    // --- CancellationToken for graceful shutdown ---
    let token = CancellationToken::new();

    // --- Storage ---
    let backend = open_backend(&config.storage)?;
    tracing::info!(backend = backend.name(), "opened storage");

    // --- Broker ---
    let counters = Arc::new(BrokerCounters::default());
    let broker = Arc::new(Broker::open(
        config.engine.clone(),
        backend,
        Arc::new(SystemClock),
        counters.clone(),
    )?);

    // --- Background tasks ---
    let mut handles: Vec<JoinHandle<()>> = vec![spawn_sweeper(broker.clone(), token.clone())];
    handles.extend(spawn_retention(broker.clone(), token.clone()));

    // --- API server (HTTP + WS) ---
    let api_broker = broker.clone();
    let listen = config.listen.clone();
    let api_token = token.clone();
    handles.push(tokio::spawn(async move {
        if let Err(e) = vmq_api_server::run(&listen, api_broker, api_token.clone()).await {
            tracing::error!(error = %e, "api server error");
            api_token.cancel();
        }
    }));

    tracing::info!(listen = %config.listen, "server ready");

    // --- Wait for Ctrl+C or a fatal api error ---
    tokio::select! {
        res = tokio::signal::ctrl_c() => {
            res?;
            tracing::info!("shutting down...");
        }
        _ = token.cancelled() => tracing::warn!("api server stopped, shutting down"),
    }

    // Signal all tasks to stop cooperatively
    token.cancel();

    // Drain, then abort whatever is still running
    let drain = Duration::from_millis(config.shutdown_drain_ms);
    let deadline = tokio::time::Instant::now() + drain;
    while handles.iter().any(|h| !h.is_finished()) && tokio::time::Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    for h in &handles {
        if !h.is_finished() {
            tracing::warn!("task did not stop in time, aborting");
            h.abort();
        }
    }
    for h in handles {
        let _ = h.await;
    }

    // Flush logs and cursors
    if let Err(e) = broker.flush() {
        tracing::error!(error = %e, "flush error");
    }

    let stats = counters.snapshot();
    tracing::info!(
        appended = stats.appended,
        delivered = stats.delivered,
        redelivered = stats.redelivered,
        acked = stats.acked,
        nacked = stats.nacked,
        expired = stats.expired,
        dead_lettered = stats.dead_lettered,
        rebalances = stats.rebalances,
        "shutdown complete"
    );
    Ok(())
}

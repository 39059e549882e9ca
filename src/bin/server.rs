//! mediatrace-server: chunked media ingest and analysis orchestration.

use anyhow::{Context, Result};
use clap::Parser;
use mediatrace::api::{create_router, AppState};
use mediatrace::chunk::{ChunkRegistry, UploadStore};
use mediatrace::collector::ResultCollector;
use mediatrace::config::ServiceConfig;
use mediatrace::coordinator::TaskOrchestrator;
use mediatrace::db;
use mediatrace::dispatch::MessageBus;
use mediatrace::materializer::FileMaterializer;
use mediatrace::metrics;
use mediatrace::progress::{MemoryProgressStore, ProgressAggregator};
use mediatrace::storage::{LocalObjectStore, ObjectStore};
use mediatrace::task::TaskStore;
use mediatrace::worker::{MetadataEngine, WorkerPool};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Command-line arguments; each overrides the matching config-file key
#[derive(Parser, Debug)]
#[command(name = "mediatrace-server")]
#[command(about = "Chunked media ingest and forensic analysis orchestration")]
#[command(version)]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "MEDIATRACE_CONFIG")]
    config: Option<PathBuf>,

    /// Address to listen on
    #[arg(short, long, env = "MEDIATRACE_LISTEN")]
    listen: Option<SocketAddr>,

    /// SQLite database URL
    #[arg(long, env = "MEDIATRACE_DATABASE_URL")]
    database_url: Option<String>,

    /// Root directory for object storage
    #[arg(long, env = "MEDIATRACE_STORAGE_ROOT")]
    storage_root: Option<PathBuf>,
}

impl Args {
    fn load_config(&self) -> Result<ServiceConfig> {
        let mut config = match &self.config {
            Some(path) => ServiceConfig::from_file(path)
                .with_context(|| format!("Failed to load config from {}", path.display()))?,
            None => ServiceConfig::default(),
        };

        if let Some(listen) = self.listen {
            config.server.listen_addr = listen;
        }
        if let Some(url) = &self.database_url {
            config.database.url = url.clone();
        }
        if let Some(root) = &self.storage_root {
            config.storage.root = root.clone();
        }

        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mediatrace=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();
    let config = args.load_config()?;

    info!(
        listen = %config.server.listen_addr,
        database = %config.database.url,
        storage = %config.storage.root.display(),
        "Starting mediatrace-server"
    );

    if config.metrics.enabled {
        metrics::install_recorder().context("Failed to install metrics recorder")?;
    }

    // Persistence
    let pool = db::connect(&config.database.url)
        .await
        .context("Failed to open database")?;
    let uploads = Arc::new(
        UploadStore::new(pool.clone())
            .await
            .context("Failed to initialize upload store")?,
    );
    let tasks = Arc::new(
        TaskStore::new(pool)
            .await
            .context("Failed to initialize task store")?,
    );
    let objects: Arc<dyn ObjectStore> = Arc::new(
        LocalObjectStore::new(
            config.storage.root.clone(),
            config.storage.bucket.clone(),
            config.storage.public_base_url.clone(),
        )
        .await
        .context("Failed to initialize object storage")?,
    );

    // Ingest
    let materializer = Arc::new(FileMaterializer::new(
        uploads.clone(),
        objects.clone(),
        config.upload.checksum,
        config.upload.chunk_retention,
    ));
    match materializer.recover_pending_merges().await {
        Ok(recovered) if !recovered.is_empty() => {
            info!(count = recovered.len(), "Recovered interrupted merges")
        }
        Ok(_) => {}
        Err(e) => warn!(error = %e, "Merge recovery failed"),
    }
    let registry = Arc::new(ChunkRegistry::new(
        uploads.clone(),
        objects.clone(),
        materializer,
        config.upload.clone(),
    ));

    // Analysis
    let bus = Arc::new(MessageBus::from_config(&config.dispatch));
    let progress = ProgressAggregator::new(
        Arc::new(MemoryProgressStore::new()),
        config.progress.ttl(),
        config.progress.grace(),
    );
    let orchestrator = TaskOrchestrator::new(
        uploads.clone(),
        tasks.clone(),
        bus.clone(),
        objects.clone(),
        config.dispatch.topics.clone(),
        progress.clone(),
    );

    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    let collector = ResultCollector::new(tasks.clone(), progress.clone());
    background.extend(
        collector
            .spawn(&bus, &config.dispatch.topics.results, shutdown.clone())
            .context("Failed to start result collector")?,
    );

    let workers = Arc::new(
        WorkerPool::new(
            tasks,
            uploads,
            objects.clone(),
            progress.clone(),
            bus.clone(),
            config.dispatch.topics.results.clone(),
            config.workers.max_concurrency,
        )
        .with_engine(Arc::new(MetadataEngine)),
    );
    background.extend(
        workers
            .spawn(&bus, &config.dispatch.topics, shutdown.clone())
            .context("Failed to start worker pool")?,
    );
    background.push(progress.spawn_gc(config.progress.gc_interval(), shutdown.clone()));

    let app = create_router(
        AppState {
            registry,
            orchestrator,
            objects,
        },
        config.server.max_body_bytes,
    );

    let listener = tokio::net::TcpListener::bind(config.server.listen_addr)
        .await
        .with_context(|| format!("Failed to bind to {}", config.server.listen_addr))?;
    info!(addr = %config.server.listen_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    for handle in background {
        if let Err(e) = handle.await {
            warn!(error = %e, "Background task ended abnormally");
        }
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Resolves on Ctrl+C or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
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
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}

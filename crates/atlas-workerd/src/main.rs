//! Worker daemon: one process, one leased worker per enabled pipeline.
//!
//! Wiring: config → store → RAG runtime (engine built lazily on its
//! dedicated thread) → index/parse workers. SIGINT/SIGTERM flip a
//! watch channel; workers drain their current batch and exit 0.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use atlas_core::AtlasConfig;
use atlas_llm::embedding::EmbeddingClient;
use atlas_llm::rerank::RerankClient;
use atlas_rag::engine::{engine_builder, EngineError, EngineInit};
use atlas_rag::runtime::EngineFactory;
use atlas_rag::{Indexer, RagRuntime};
use atlas_store::Store;
use atlas_worker::parser::PlainTextParser;
use atlas_worker::storage::FsObjectStore;
use atlas_worker::{IndexWorker, ParseWorker, WorkerConfig};

#[derive(Parser)]
#[command(name = "atlas-workerd", about = "MindAtlas background worker daemon")]
struct Args {
    /// Path to atlas.toml (default: ~/.mindatlas/atlas.toml).
    #[arg(long)]
    config: Option<String>,
}

/// Build the lazy engine factory: environment wiring (Neo4j, OpenAI
/// endpoints), the embedding function, and an optional rerank function
/// are handed to whichever backend is registered.
fn engine_factory(config: &AtlasConfig) -> EngineFactory {
    let rag = config.rag.clone();
    Box::new(move || {
        let Some(builder) = engine_builder() else {
            return Err(EngineError::Dependency(
                "no KG engine backend registered".to_string(),
            ));
        };
        let embedder = if !rag.embedding_model.trim().is_empty() {
            Some(Arc::new(EmbeddingClient::new(
                rag.embedding_key.clone(),
                rag.embedding_host.clone(),
                rag.embedding_model.clone(),
            )))
        } else {
            None
        };
        let rerank = if rag.rerank.configured() {
            Some(Arc::new(RerankClient::new(rag.rerank.clone())))
        } else {
            None
        };
        builder(&EngineInit {
            config: rag.clone(),
            embedder,
            rerank,
        })
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = AtlasConfig::load(args.config.as_deref()).context("loading configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new(config.app.log_level.clone())),
        )
        .init();

    let store = Store::open(&config.database.path).context("opening database")?;
    atlas_assistant::registry::seed_system_tools(&store).context("seeding system tools")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut handles = Vec::new();

    if config.rag.worker.enabled {
        let runtime = RagRuntime::start(engine_factory(&config));
        let indexer = Arc::new(Indexer::new(
            runtime,
            config.rag.enabled,
            Duration::from_secs_f64(config.rag.init_timeout_sec.max(1.0)),
        ));
        let worker_cfg = WorkerConfig::from_tuning(&config.rag.worker);
        info!(worker_id = %worker_cfg.worker_id, "starting index worker");
        let worker = IndexWorker::new(store.clone(), indexer, worker_cfg);
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    } else {
        info!("index worker disabled");
    }

    if config.parse.worker.enabled {
        let objects = Arc::new(FsObjectStore::new(config.storage.upload_dir.clone()));
        let worker_cfg = WorkerConfig::from_tuning(&config.parse.worker);
        info!(worker_id = %worker_cfg.worker_id, "starting parse worker");
        let worker = ParseWorker::new(store.clone(), objects, Arc::new(PlainTextParser), worker_cfg);
        handles.push(tokio::spawn(worker.run(shutdown_rx.clone())));
    } else {
        info!("parse worker disabled");
    }

    if handles.is_empty() {
        warn!("no pipelines enabled, exiting");
        return Ok(());
    }

    wait_for_shutdown_signal().await;
    info!("signal received, initiating shutdown");
    let _ = shutdown_tx.send(true);

    for handle in handles {
        let _ = handle.await;
    }
    info!("all workers drained, exiting");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

//! The RAG runtime: one long-lived thread owning one event loop.
//!
//! The engine keeps per-connection state bound to the loop it was
//! created on; crossing loops corrupts its futures. Every call is
//! therefore submitted as a job to the dedicated thread and awaited
//! with a hard timeout. The engine itself is built lazily, once, on
//! that thread — the single consumer loop doubles as the init lock.

use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::LocalBoxFuture;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::engine::{EngineError, KgEngine};
use crate::error::RagError;

/// Factory that builds the engine on the runtime thread. Runs at most
/// once; the produced engine never leaves that thread.
pub type EngineFactory =
    Box<dyn FnOnce() -> Result<Arc<dyn KgEngine>, EngineError> + Send + 'static>;

type Job = Box<
    dyn FnOnce(Result<Arc<dyn KgEngine>, EngineError>) -> LocalBoxFuture<'static, ()>
        + Send
        + 'static,
>;

/// Handle to the dedicated engine thread. Cloneable; all clones feed
/// the same job queue.
#[derive(Clone)]
pub struct RagRuntime {
    jobs: std_mpsc::Sender<Job>,
}

impl RagRuntime {
    /// Spawn the runtime thread. The factory is invoked lazily on the
    /// first job, inside the thread.
    pub fn start(factory: EngineFactory) -> Self {
        let (tx, rx) = std_mpsc::channel::<Job>();

        std::thread::Builder::new()
            .name("rag-runtime".to_string())
            .spawn(move || run_loop(rx, factory))
            .expect("failed to spawn rag-runtime thread");

        Self { jobs: tx }
    }

    /// Submit a job and wait for its result with a hard timeout.
    ///
    /// The closure receives the (lazily built) engine, or the build
    /// error if initialisation failed; either way it runs on the
    /// runtime thread's event loop.
    pub async fn call<T, F>(&self, timeout: Duration, f: F) -> Result<T, RagError>
    where
        T: Send + 'static,
        F: FnOnce(Result<Arc<dyn KgEngine>, EngineError>) -> LocalBoxFuture<'static, Result<T, RagError>>
            + Send
            + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel::<Result<T, RagError>>();
        let job: Job = Box::new(move |engine| {
            Box::pin(async move {
                let out = f(engine).await;
                let _ = reply_tx.send(out);
            })
        });

        self.jobs
            .send(job)
            .map_err(|_| RagError::Internal("rag runtime is gone".into()))?;

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RagError::Internal("rag runtime dropped the job".into())),
            Err(_) => Err(RagError::Timeout),
        }
    }

    /// Convenience wrapper for jobs that need a working engine.
    pub async fn with_engine<T, F>(&self, timeout: Duration, f: F) -> Result<T, RagError>
    where
        T: Send + 'static,
        F: FnOnce(Arc<dyn KgEngine>) -> LocalBoxFuture<'static, Result<T, RagError>>
            + Send
            + 'static,
    {
        self.call(timeout, move |engine| match engine {
            Ok(engine) => f(engine),
            Err(e) => Box::pin(async move { Err(RagError::from(e)) }),
        })
        .await
    }
}

fn run_loop(rx: std_mpsc::Receiver<Job>, factory: EngineFactory) {
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .expect("failed to build rag runtime event loop");

    info!("rag runtime loop ready");

    // Lazily built on first job; the error (if any) is replayed to
    // every subsequent job so callers see a stable failure mode.
    let mut factory = Some(factory);
    let mut engine: Option<Result<Arc<dyn KgEngine>, String>> = None;

    while let Ok(job) = rx.recv() {
        if engine.is_none() {
            let build = (factory.take().expect("engine factory consumed twice"))();
            match &build {
                Ok(_) => info!("kg engine initialised"),
                Err(e) => error!("kg engine init failed: {e}"),
            }
            engine = Some(build.map_err(|e| e.to_string()));
        }
        let handed = match engine.as_ref().expect("engine state set above") {
            Ok(arc) => Ok(arc.clone()),
            Err(msg) => Err(EngineError::Dependency(msg.clone())),
        };
        rt.block_on(job(handed));
    }

    info!("rag runtime loop stopped");
}

/// Fake engines shared by tests across the workspace.
#[doc(hidden)]
pub mod test_engines {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;

    use crate::engine::*;

    /// Shared doc map so tests can observe engine state from the test
    /// thread while the engine lives on the runtime thread.
    pub type DocMap = Arc<Mutex<HashMap<String, (String, String)>>>;

    /// In-memory engine recording inserted docs; used across the crate's
    /// tests.
    #[derive(Default)]
    pub struct FakeEngine {
        pub docs: DocMap,
        pub answer: String,
        pub chunks: Vec<ChunkHit>,
        pub entities: Vec<GraphEntity>,
        pub relationships: Vec<GraphRelationship>,
        pub graph: KnowledgeGraph,
    }

    #[async_trait(?Send)]
    impl KgEngine for FakeEngine {
        async fn ainsert(
            &self,
            text: &str,
            ids: &[String],
            file_paths: &[String],
        ) -> Result<String, EngineError> {
            let id = ids.first().cloned().unwrap_or_default();
            let file_path = file_paths.first().cloned().unwrap_or_default();
            self.docs
                .lock()
                .unwrap()
                .insert(id.clone(), (text.to_string(), file_path));
            Ok(format!("track-{id}"))
        }

        async fn adelete_by_doc_id(&self, doc_id: &str) -> Result<(), EngineError> {
            self.docs.lock().unwrap().remove(doc_id);
            Ok(())
        }

        async fn query_llm(
            &self,
            _query: &str,
            _param: &QueryParam,
        ) -> Result<QueryOutput, EngineError> {
            Ok(QueryOutput {
                llm_response: self.answer.clone(),
                chunks: self.chunks.clone(),
                entities: self.entities.clone(),
                relationships: self.relationships.clone(),
            })
        }

        async fn get_knowledge_graph(
            &self,
            _node_label: &str,
            _max_depth: usize,
            _max_nodes: usize,
        ) -> Result<KnowledgeGraph, EngineError> {
            Ok(self.graph.clone())
        }

        async fn chunks_query(
            &self,
            _query: &str,
            _top_k: usize,
        ) -> Result<Vec<ChunkHit>, EngineError> {
            Ok(self.chunks.clone())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::test_engines::FakeEngine;
    use super::*;

    #[tokio::test]
    async fn jobs_run_on_the_runtime_thread() {
        let runtime = RagRuntime::start(Box::new(|| Ok(Arc::new(FakeEngine::default()) as _)));
        let track = runtime
            .with_engine(Duration::from_secs(5), |engine| {
                Box::pin(async move {
                    engine
                        .ainsert("text", &["doc-1".into()], &["doc-1".into()])
                        .await
                        .map_err(RagError::from)
                })
            })
            .await
            .unwrap();
        assert_eq!(track, "track-doc-1");
    }

    #[tokio::test]
    async fn init_failure_is_replayed_to_every_job() {
        let runtime =
            RagRuntime::start(Box::new(|| Err(EngineError::Dependency("no backend".into()))));
        for _ in 0..2 {
            let err = runtime
                .with_engine(Duration::from_secs(5), |_| {
                    Box::pin(async { Ok::<_, RagError>(()) })
                })
                .await
                .unwrap_err();
            assert!(matches!(err, RagError::DependencyMissing(_)));
        }
    }

    #[tokio::test]
    async fn slow_jobs_hit_the_hard_timeout() {
        let runtime = RagRuntime::start(Box::new(|| Ok(Arc::new(FakeEngine::default()) as _)));
        let err = runtime
            .call(Duration::from_millis(20), |_| {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok::<_, RagError>(())
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Timeout));
    }
}

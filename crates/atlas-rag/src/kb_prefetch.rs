//! Best-effort runtime for knowledge-base prefetch.
//!
//! KB retrieval can hang (engine, graph store, network). Run inline it
//! would stall the whole chat SSE stream. This runtime executes
//! prefetch jobs on a disposable worker thread; callers wait with a
//! hard timeout and fail open. On timeout the runtime is rotated — the
//! wedged thread is abandoned and a fresh one serves the next call.

use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::future::BoxFuture;
use tokio::sync::oneshot;
use tracing::{info, warn};

use crate::error::RagError;

type Job = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send + 'static>;

struct Inner {
    jobs: std_mpsc::Sender<Job>,
}

impl Inner {
    fn spawn() -> Arc<Inner> {
        let (tx, rx) = std_mpsc::channel::<Job>();
        std::thread::Builder::new()
            .name("kb-prefetch".to_string())
            .spawn(move || {
                let rt = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("failed to build kb prefetch event loop");
                info!("kb prefetch runtime ready");
                while let Ok(job) = rx.recv() {
                    rt.block_on(job());
                }
            })
            .expect("failed to spawn kb-prefetch thread");
        Arc::new(Inner { jobs: tx })
    }
}

/// Timeout-isolated executor for best-effort KB calls.
#[derive(Clone)]
pub struct KbPrefetchRuntime {
    inner: Arc<Mutex<Arc<Inner>>>,
}

impl Default for KbPrefetchRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl KbPrefetchRuntime {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::spawn())),
        }
    }

    /// Run a prefetch job with a hard timeout. On timeout the backing
    /// thread is replaced so the next call starts clean; the old thread
    /// may stay wedged but is abandoned.
    pub async fn call<T, F>(&self, timeout: Duration, f: F) -> Result<T, RagError>
    where
        T: Send + 'static,
        F: FnOnce() -> BoxFuture<'static, T> + Send + 'static,
    {
        let worker = self.inner.lock().unwrap().clone();
        let (reply_tx, reply_rx) = oneshot::channel::<T>();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let out = f().await;
                let _ = reply_tx.send(out);
            })
        });

        if worker.jobs.send(job).is_err() {
            // Worker thread died; rotate and report.
            self.rotate();
            return Err(RagError::Internal("kb prefetch runtime is gone".into()));
        }

        match tokio::time::timeout(timeout, reply_rx).await {
            Ok(Ok(v)) => Ok(v),
            Ok(Err(_)) => Err(RagError::Internal("kb prefetch job dropped".into())),
            Err(_) => {
                warn!("kb prefetch timed out, rotating runtime");
                self.rotate();
                Err(RagError::Timeout)
            }
        }
    }

    fn rotate(&self) {
        let mut guard = self.inner.lock().unwrap();
        *guard = Inner::spawn();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fast_jobs_return_their_value() {
        let runtime = KbPrefetchRuntime::new();
        let out = runtime
            .call(Duration::from_secs(1), || Box::pin(async { 41 + 1 }))
            .await
            .unwrap();
        assert_eq!(out, 42);
    }

    #[tokio::test]
    async fn timeout_rotates_and_next_call_works() {
        let runtime = KbPrefetchRuntime::new();

        // Wedge the worker well past the caller timeout.
        let err = runtime
            .call(Duration::from_millis(10), || {
                Box::pin(async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    "late"
                })
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RagError::Timeout));

        // The rotated runtime serves the next call normally.
        let ok = runtime
            .call(Duration::from_secs(1), || Box::pin(async { "fresh" }))
            .await
            .unwrap();
        assert_eq!(ok, "fresh");
    }
}

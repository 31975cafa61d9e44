//! Indexer adapter: outbox events in, engine calls out.
//!
//! The worker builds payloads and decides upsert-vs-delete; the indexer
//! is DB-free and only talks to the engine through the runtime. Upsert
//! is executed as delete-then-insert of the same doc_id so a retry
//! converges even when a previous attempt partially succeeded.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::debug;

use atlas_core::types::OutboxOp;

use crate::documents::DocumentPayload;
use crate::engine::EngineError;
use crate::error::RagError;
use crate::runtime::RagRuntime;
use crate::source_ids::{build_attachment_doc_id, build_attachment_file_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Payload,
    Dependency,
    Config,
    Transient,
    Unknown,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::Payload => "payload",
            ErrorKind::Dependency => "dependency",
            ErrorKind::Config => "config",
            ErrorKind::Transient => "transient",
            ErrorKind::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub op: OutboxOp,
    pub entry_id: String,
    pub entry_updated_at: Option<DateTime<Utc>>,
    pub payload: Option<DocumentPayload>,
}

/// Outcome handed back to the worker's ack logic.
#[derive(Debug, Clone)]
pub struct IndexResult {
    pub ok: bool,
    pub retryable: bool,
    pub error_kind: Option<ErrorKind>,
    pub detail: String,
}

impl IndexResult {
    fn ok(detail: impl Into<String>) -> Self {
        Self {
            ok: true,
            retryable: false,
            error_kind: None,
            detail: detail.into(),
        }
    }

    fn fail(kind: ErrorKind, detail: impl Into<String>) -> Self {
        let retryable = matches!(kind, ErrorKind::Transient | ErrorKind::Unknown);
        Self {
            ok: false,
            retryable,
            error_kind: Some(kind),
            detail: detail.into(),
        }
    }

    fn from_rag_error(e: &RagError) -> Self {
        match e {
            RagError::DependencyMissing(m) => Self::fail(ErrorKind::Dependency, m.clone()),
            RagError::ConfigError(m) => Self::fail(ErrorKind::Config, m.clone()),
            RagError::Timeout => Self::fail(ErrorKind::Transient, "engine call timed out"),
            other => Self::fail(ErrorKind::Transient, other.to_string()),
        }
    }
}

pub struct Indexer {
    runtime: RagRuntime,
    enabled: bool,
    call_timeout: Duration,
}

impl Indexer {
    pub fn new(runtime: RagRuntime, enabled: bool, call_timeout: Duration) -> Self {
        Self {
            runtime,
            enabled,
            call_timeout,
        }
    }

    /// Handle an entry index event.
    ///
    /// - feature disabled: fast skip (ok) so the outbox never backlogs
    /// - delete: idempotent `adelete_by_doc_id`
    /// - upsert: requires a payload; delete-then-insert under the entry
    ///   UUID for both doc_id and file_path
    pub async fn handle(&self, req: &IndexRequest) -> IndexResult {
        if !self.enabled {
            return IndexResult::ok("skipped: rag disabled");
        }

        match req.op {
            OutboxOp::Delete => self.delete_doc(req.entry_id.clone()).await,
            OutboxOp::Upsert => {
                let Some(payload) = &req.payload else {
                    return IndexResult::fail(ErrorKind::Payload, "missing payload for upsert");
                };
                self.upsert_doc(
                    req.entry_id.clone(),
                    req.entry_id.clone(),
                    payload.text.clone(),
                )
                .await
            }
        }
    }

    /// Attachment doc upsert under the composite id convention.
    pub async fn upsert_attachment(
        &self,
        attachment_id: &str,
        entry_id: &str,
        text: String,
    ) -> IndexResult {
        if !self.enabled {
            return IndexResult::ok("skipped: rag disabled");
        }
        self.upsert_doc(
            build_attachment_doc_id(attachment_id),
            build_attachment_file_path(entry_id, attachment_id),
            text,
        )
        .await
    }

    pub async fn delete_attachment(&self, attachment_id: &str) -> IndexResult {
        if !self.enabled {
            return IndexResult::ok("skipped: rag disabled");
        }
        self.delete_doc(build_attachment_doc_id(attachment_id)).await
    }

    async fn upsert_doc(&self, doc_id: String, file_path: String, text: String) -> IndexResult {
        debug!(%doc_id, "indexer upsert");
        let result = self
            .runtime
            .with_engine(self.call_timeout, move |engine| {
                Box::pin(async move {
                    // Idempotent upsert: clear any partial prior state first.
                    engine
                        .adelete_by_doc_id(&doc_id)
                        .await
                        .map_err(engine_to_rag)?;
                    let track_id = engine
                        .ainsert(&text, &[doc_id.clone()], &[file_path.clone()])
                        .await
                        .map_err(engine_to_rag)?;
                    Ok(track_id)
                })
            })
            .await;

        match result {
            Ok(track_id) => IndexResult::ok(format!("indexed: track_id={track_id}")),
            Err(e) => IndexResult::from_rag_error(&e),
        }
    }

    async fn delete_doc(&self, doc_id: String) -> IndexResult {
        debug!(%doc_id, "indexer delete");
        let detail = format!("deleted: doc_id={doc_id}");
        let result = self
            .runtime
            .with_engine(self.call_timeout, move |engine| {
                Box::pin(async move { engine.adelete_by_doc_id(&doc_id).await.map_err(engine_to_rag) })
            })
            .await;

        match result {
            Ok(()) => IndexResult::ok(detail),
            Err(e) => IndexResult::from_rag_error(&e),
        }
    }
}

fn engine_to_rag(e: EngineError) -> RagError {
    RagError::from(e)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::runtime::test_engines::{DocMap, FakeEngine};

    fn indexer_with_docs(enabled: bool) -> (Indexer, DocMap) {
        let docs: DocMap = Default::default();
        let docs_for_engine = docs.clone();
        let runtime = RagRuntime::start(Box::new(move || {
            Ok(Arc::new(FakeEngine {
                docs: docs_for_engine,
                ..Default::default()
            }) as _)
        }));
        (
            Indexer::new(runtime, enabled, Duration::from_secs(5)),
            docs,
        )
    }

    fn upsert_request(entry_id: &str, text: &str) -> IndexRequest {
        IndexRequest {
            op: OutboxOp::Upsert,
            entry_id: entry_id.to_string(),
            entry_updated_at: None,
            payload: Some(DocumentPayload {
                entry_id: entry_id.to_string(),
                entry_updated_at: None,
                type_id: "t".into(),
                type_code: None,
                type_name: None,
                type_enabled: true,
                graph_enabled: true,
                ai_enabled: true,
                tags: vec![],
                text: text.to_string(),
            }),
        }
    }

    #[tokio::test]
    async fn upsert_uses_entry_uuid_for_doc_id_and_file_path() {
        let (indexer, docs) = indexer_with_docs(true);
        let result = indexer.handle(&upsert_request("entry-1", "Title: A")).await;
        assert!(result.ok, "{}", result.detail);

        let stored = docs.lock().unwrap();
        let (text, file_path) = stored.get("entry-1").unwrap();
        assert_eq!(text, "Title: A");
        assert_eq!(file_path, "entry-1");
    }

    #[tokio::test]
    async fn repeated_upserts_converge_and_delete_is_idempotent() {
        let (indexer, docs) = indexer_with_docs(true);
        indexer.handle(&upsert_request("e", "v1")).await;
        indexer.handle(&upsert_request("e", "v2")).await;
        assert_eq!(docs.lock().unwrap().get("e").unwrap().0, "v2");

        let del = IndexRequest {
            op: OutboxOp::Delete,
            entry_id: "e".into(),
            entry_updated_at: None,
            payload: None,
        };
        assert!(indexer.handle(&del).await.ok);
        assert!(docs.lock().unwrap().is_empty());
        // Second delete is a no-op success.
        assert!(indexer.handle(&del).await.ok);
    }

    #[tokio::test]
    async fn missing_payload_is_a_dead_letter() {
        let (indexer, _) = indexer_with_docs(true);
        let req = IndexRequest {
            op: OutboxOp::Upsert,
            entry_id: "e".into(),
            entry_updated_at: None,
            payload: None,
        };
        let result = indexer.handle(&req).await;
        assert!(!result.ok);
        assert!(!result.retryable);
        assert_eq!(result.error_kind, Some(ErrorKind::Payload));
    }

    #[tokio::test]
    async fn disabled_feature_fast_skips() {
        let (indexer, docs) = indexer_with_docs(false);
        let result = indexer.handle(&upsert_request("e", "v")).await;
        assert!(result.ok);
        assert!(result.detail.contains("skipped"));
        assert!(docs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_backend_is_non_retryable_dependency() {
        let runtime = RagRuntime::start(Box::new(|| {
            Err(crate::engine::EngineError::Dependency(
                "no KG engine backend registered".into(),
            ))
        }));
        let indexer = Indexer::new(runtime, true, Duration::from_secs(5));
        let result = indexer.handle(&upsert_request("e", "v")).await;
        assert!(!result.ok);
        assert!(!result.retryable);
        assert_eq!(result.error_kind, Some(ErrorKind::Dependency));
    }

    #[tokio::test]
    async fn attachment_ids_follow_the_composite_convention() {
        let (indexer, docs) = indexer_with_docs(true);
        indexer
            .upsert_attachment("att-1", "entry-1", "parsed text".into())
            .await;
        let stored = docs.lock().unwrap();
        let (_, file_path) = stored.get("attachment:att-1").unwrap();
        assert_eq!(file_path, "entry-1/attachments/att-1");
    }
}

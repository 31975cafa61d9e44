//! The index worker: drains the entry and attachment index outboxes.
//!
//! Per claimed row it re-reads current business state, applies the
//! staleness guard and indexability translation, dispatches to the
//! indexer, and acks. Failures of a single row never abort the batch.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use atlas_core::types::{AttachmentOutbox, EntryIndexOutbox, OutboxOp, ParseStatus};
use atlas_core::utc_now;
use atlas_rag::documents::{build_document_payload, render_attachment_text, should_index};
use atlas_rag::indexer::{IndexRequest, Indexer};
use atlas_store::outbox::{AttachmentPipeline, BackoffPolicy, ClaimParams};
use atlas_store::{Store, StoreError};

use crate::config::WorkerConfig;

pub struct IndexWorker {
    store: Store,
    indexer: Arc<Indexer>,
    cfg: WorkerConfig,
}

impl IndexWorker {
    pub fn new(store: Store, indexer: Arc<Indexer>, cfg: WorkerConfig) -> Self {
        Self {
            store,
            indexer,
            cfg,
        }
    }

    /// Poll loop. Exits when `shutdown` flips to true; the in-flight
    /// batch always drains first.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            worker_id = %self.cfg.worker_id,
            batch_size = self.cfg.batch_size,
            max_attempts = self.cfg.max_attempts,
            lock_ttl_sec = self.cfg.lock_ttl_sec,
            "index worker starting"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!("index worker iteration failed: {e}");
                    0
                }
            };
            if processed == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.cfg.poll_interval) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }

        info!(worker_id = %self.cfg.worker_id, "index worker stopped");
    }

    fn claim_params(&self) -> ClaimParams {
        ClaimParams {
            now: utc_now(),
            batch_size: self.cfg.batch_size,
            worker_id: self.cfg.worker_id.clone(),
            lock_ttl_sec: self.cfg.lock_ttl_sec,
            max_attempts: self.cfg.max_attempts,
        }
    }

    /// One iteration: claim and process both index pipelines.
    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let mut processed = 0usize;

        let entry_batch = self.store.claim_entry_index_batch(&self.claim_params())?;
        if !entry_batch.is_empty() {
            info!(
                worker_id = %self.cfg.worker_id,
                count = entry_batch.len(),
                "claimed entry batch"
            );
        }
        for outbox in entry_batch {
            self.process_entry_event(outbox).await;
            processed += 1;
        }

        let attachment_batch = self
            .store
            .claim_attachment_batch(AttachmentPipeline::Index, &self.claim_params())?;
        if !attachment_batch.is_empty() {
            info!(
                worker_id = %self.cfg.worker_id,
                count = attachment_batch.len(),
                "claimed attachment batch"
            );
        }
        for outbox in attachment_batch {
            self.process_attachment_event(outbox).await;
            processed += 1;
        }

        Ok(processed)
    }

    async fn process_entry_event(&self, outbox: EntryIndexOutbox) {
        let outbox_id = outbox.id.clone();
        let entry_id = outbox.entry_id.clone();
        info!(
            outbox_id = %outbox_id,
            entry_id = %entry_id,
            op = %outbox.op,
            attempts = outbox.attempts,
            "processing entry outbox"
        );

        let mut effective_op = outbox.op;
        let mut payload = None;
        let mut sig_before = None;

        if outbox.op == OutboxOp::Upsert {
            let entry = match self.store.find_entry(&entry_id) {
                Ok(e) => e,
                Err(e) => {
                    self.fail_entry(&outbox, &e.to_string(), true).await;
                    return;
                }
            };

            match entry {
                None => {
                    // Entry deleted: clean up any index residue.
                    info!(outbox_id = %outbox_id, entry_id = %entry_id, "entry deleted, cleaning up index");
                    effective_op = OutboxOp::Delete;
                }
                Some(entry) => {
                    // Staleness guard: if a newer active upsert exists,
                    // drop this one; otherwise process against current
                    // state (coalesced mode).
                    if let Some(event_ts) = outbox.entry_updated_at {
                        if entry.updated_at > event_ts {
                            match self.store.newer_active_upsert_exists(
                                &entry_id,
                                &outbox_id,
                                outbox.created_at,
                            ) {
                                Ok(true) => {
                                    info!(
                                        outbox_id = %outbox_id,
                                        entry_id = %entry_id,
                                        "skipping stale upsert (newer outbox exists)"
                                    );
                                    let _ = self
                                        .store
                                        .mark_entry_outbox_succeeded(&outbox_id, &self.cfg.worker_id);
                                    return;
                                }
                                Ok(false) => {}
                                Err(e) => {
                                    self.fail_entry(&outbox, &e.to_string(), true).await;
                                    return;
                                }
                            }
                        }
                    }

                    let entry_type = self.store.find_entry_type(&entry.type_id).ok().flatten();
                    let doc = build_document_payload(
                        &entry,
                        entry_type.as_ref(),
                        Some(entry.updated_at),
                    );
                    if should_index(&doc) {
                        sig_before = Some(entry.index_signature());
                        payload = Some(doc);
                    } else {
                        // Type flags disable indexing: rewrite to delete.
                        info!(
                            outbox_id = %outbox_id,
                            entry_id = %entry_id,
                            type_id = %doc.type_id,
                            "entry type disables indexing, cleaning up index"
                        );
                        effective_op = OutboxOp::Delete;
                    }
                }
            }
        }

        let req = IndexRequest {
            op: effective_op,
            entry_id: entry_id.clone(),
            entry_updated_at: outbox.entry_updated_at,
            payload,
        };
        let result = self.indexer.handle(&req).await;

        if result.ok {
            // Coalescing re-queue: if the signature changed while we
            // were indexing, requeue the same row instead of enqueuing
            // another.
            if effective_op == OutboxOp::Upsert {
                if let Some(before) = sig_before {
                    let changed = matches!(
                        self.store.find_entry(&entry_id),
                        Ok(Some(current)) if current.index_signature() != before
                    );
                    if changed {
                        let _ = self.store.mark_entry_outbox_pending(
                            &outbox_id,
                            &self.cfg.worker_id,
                            utc_now(),
                        );
                        info!(outbox_id = %outbox_id, entry_id = %entry_id, "requeued after concurrent update");
                        return;
                    }
                }
            }
            let _ = self
                .store
                .mark_entry_outbox_succeeded(&outbox_id, &self.cfg.worker_id);
            info!(outbox_id = %outbox_id, entry_id = %entry_id, op = %effective_op, "index succeeded");
        } else {
            self.fail_entry(&outbox, &result.detail, result.retryable)
                .await;
        }
    }

    async fn fail_entry(&self, outbox: &EntryIndexOutbox, error_message: &str, retryable: bool) {
        if !retryable {
            let _ = self
                .store
                .mark_entry_outbox_dead(&outbox.id, &self.cfg.worker_id, error_message);
            warn!(
                outbox_id = %outbox.id,
                entry_id = %outbox.entry_id,
                attempts = outbox.attempts,
                "index dead (non-retryable): {error_message}"
            );
            return;
        }
        if outbox.attempts >= self.cfg.max_attempts {
            let _ = self
                .store
                .mark_entry_outbox_dead(&outbox.id, &self.cfg.worker_id, error_message);
            warn!(
                outbox_id = %outbox.id,
                entry_id = %outbox.entry_id,
                attempts = outbox.attempts,
                "index dead (max attempts exceeded): {error_message}"
            );
            return;
        }
        let next = utc_now()
            + chrono::Duration::from_std(BackoffPolicy::ENTRY_INDEX.delay(outbox.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(60));
        let _ = self.store.mark_entry_outbox_retry(
            &outbox.id,
            &self.cfg.worker_id,
            next,
            error_message,
        );
        info!(
            outbox_id = %outbox.id,
            entry_id = %outbox.entry_id,
            attempts = outbox.attempts,
            "index retry scheduled"
        );
    }

    async fn process_attachment_event(&self, outbox: AttachmentOutbox) {
        let outbox_id = outbox.id.clone();
        info!(
            outbox_id = %outbox_id,
            attachment_id = %outbox.attachment_id,
            entry_id = %outbox.entry_id,
            op = %outbox.op,
            attempts = outbox.attempts,
            "processing attachment outbox"
        );

        let attachment = self.store.find_attachment(&outbox.attachment_id).ok().flatten();

        // Missing, not opted into indexing, or not yet parsed: all
        // translate to delete so the KG never holds stale blobs.
        let mut effective_op = outbox.op;
        if effective_op == OutboxOp::Upsert {
            let indexable = attachment
                .as_ref()
                .map(|a| a.index_to_knowledge_graph && a.parse_status == ParseStatus::Completed)
                .unwrap_or(false);
            if !indexable {
                effective_op = OutboxOp::Delete;
            }
        }

        let result = match effective_op {
            OutboxOp::Delete => self.indexer.delete_attachment(&outbox.attachment_id).await,
            OutboxOp::Upsert => {
                let attachment = attachment.expect("upsert implies attachment present");
                let entry_title = self
                    .store
                    .find_entry(&outbox.entry_id)
                    .ok()
                    .flatten()
                    .map(|e| e.title);
                let text = render_attachment_text(
                    &outbox.entry_id,
                    entry_title.as_deref(),
                    &attachment.original_filename,
                    &attachment.content_type,
                    attachment.parsed_text.as_deref().unwrap_or(""),
                );
                self.indexer
                    .upsert_attachment(&outbox.attachment_id, &outbox.entry_id, text)
                    .await
            }
        };

        if result.ok {
            let _ = self.store.mark_attachment_outbox_succeeded(
                AttachmentPipeline::Index,
                &outbox_id,
                &self.cfg.worker_id,
            );
            info!(
                outbox_id = %outbox_id,
                attachment_id = %outbox.attachment_id,
                op = %effective_op,
                "attachment index succeeded"
            );
        } else {
            self.fail_attachment(&outbox, &result.detail, result.retryable)
                .await;
        }
    }

    async fn fail_attachment(
        &self,
        outbox: &AttachmentOutbox,
        error_message: &str,
        retryable: bool,
    ) {
        if !retryable || outbox.attempts >= self.cfg.max_attempts {
            let _ = self.store.mark_attachment_outbox_dead(
                AttachmentPipeline::Index,
                &outbox.id,
                &self.cfg.worker_id,
                error_message,
            );
            warn!(
                outbox_id = %outbox.id,
                attachment_id = %outbox.attachment_id,
                attempts = outbox.attempts,
                "attachment index dead: {error_message}"
            );
            return;
        }
        let next = utc_now()
            + chrono::Duration::from_std(BackoffPolicy::ATTACHMENT.delay(outbox.attempts))
                .unwrap_or_else(|_| chrono::Duration::seconds(300));
        let _ = self.store.mark_attachment_outbox_retry(
            AttachmentPipeline::Index,
            &outbox.id,
            &self.cfg.worker_id,
            next,
            error_message,
        );
        info!(
            outbox_id = %outbox.id,
            attachment_id = %outbox.attachment_id,
            attempts = outbox.attempts,
            "attachment index retry scheduled"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc as StdArc, Mutex};
    use std::time::Duration;

    use super::*;
    use atlas_core::types::OutboxStatus;
    use atlas_rag::engine::{EngineError, KgEngine};
    use atlas_rag::runtime::test_engines::{DocMap, FakeEngine};
    use atlas_rag::runtime::RagRuntime;
    use atlas_store::entry::test_support::{entry_input, seed_type};

    fn worker_cfg() -> WorkerConfig {
        WorkerConfig {
            enabled: true,
            poll_interval: Duration::from_millis(200),
            batch_size: 10,
            max_attempts: 6,
            lock_ttl_sec: 300,
            worker_id: "test:1".to_string(),
        }
    }

    fn worker_with_fake_engine(store: &Store) -> (IndexWorker, DocMap) {
        let docs: DocMap = Default::default();
        let docs_for_engine = docs.clone();
        let runtime = RagRuntime::start(Box::new(move || {
            Ok(StdArc::new(FakeEngine {
                docs: docs_for_engine,
                ..Default::default()
            }) as _)
        }));
        let indexer = StdArc::new(Indexer::new(runtime, true, Duration::from_secs(5)));
        (
            IndexWorker::new(store.clone(), indexer, worker_cfg()),
            docs,
        )
    }

    #[tokio::test]
    async fn create_claim_process_succeeds_and_indexes() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "A", "x")).unwrap();
        let (worker, docs) = worker_with_fake_engine(&store);

        let processed = worker.run_once().await.unwrap();
        assert_eq!(processed, 1);

        let status = store.entry_index_status(&entry.id).unwrap().unwrap();
        assert_eq!(status.status, OutboxStatus::Succeeded);
        let stored = docs.lock().unwrap();
        assert!(stored.get(&entry.id).unwrap().0.contains("Title: A"));
    }

    #[tokio::test]
    async fn non_indexable_type_rewrites_upsert_to_delete() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "A", "x")).unwrap();
        let (worker, docs) = worker_with_fake_engine(&store);
        worker.run_once().await.unwrap();
        assert!(docs.lock().unwrap().contains_key(&entry.id));

        // Flip the type off, then touch content to trigger an upsert.
        seed_type(&store, "t1", false);
        store
            .update_entry(&entry.id, &entry_input("t1", "A", "z"))
            .unwrap();
        worker.run_once().await.unwrap();

        assert!(!docs.lock().unwrap().contains_key(&entry.id));
        let status = store.entry_index_status(&entry.id).unwrap().unwrap();
        assert_eq!(status.status, OutboxStatus::Succeeded);
    }

    #[tokio::test]
    async fn deleted_entry_cleans_up_residue() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "A", "x")).unwrap();
        let (worker, docs) = worker_with_fake_engine(&store);
        worker.run_once().await.unwrap();
        assert!(docs.lock().unwrap().contains_key(&entry.id));

        store.delete_entry(&entry.id).unwrap();
        worker.run_once().await.unwrap();
        assert!(!docs.lock().unwrap().contains_key(&entry.id));
    }

    #[tokio::test]
    async fn signature_change_during_processing_requeues_same_row() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "A", "x")).unwrap();
        let row = store.entry_index_status(&entry.id).unwrap().unwrap();

        // An engine that mutates the entry mid-flight, simulating a
        // concurrent edit between payload build and ack.
        struct MutatingEngine {
            store: Store,
            entry_id: String,
            docs: DocMap,
        }

        #[async_trait::async_trait(?Send)]
        impl KgEngine for MutatingEngine {
            async fn ainsert(
                &self,
                text: &str,
                ids: &[String],
                file_paths: &[String],
            ) -> Result<String, EngineError> {
                // First call edits the entry under the worker's feet.
                let input = entry_input("t1", "A", "CONCURRENT");
                let _ = self.store.update_entry(&self.entry_id, &input);
                self.docs.lock().unwrap().insert(
                    ids[0].clone(),
                    (text.to_string(), file_paths[0].clone()),
                );
                Ok("track".into())
            }
            async fn adelete_by_doc_id(&self, doc_id: &str) -> Result<(), EngineError> {
                self.docs.lock().unwrap().remove(doc_id);
                Ok(())
            }
            async fn query_llm(
                &self,
                _q: &str,
                _p: &atlas_rag::engine::QueryParam,
            ) -> Result<atlas_rag::engine::QueryOutput, EngineError> {
                Ok(Default::default())
            }
            async fn get_knowledge_graph(
                &self,
                _l: &str,
                _d: usize,
                _n: usize,
            ) -> Result<atlas_rag::engine::KnowledgeGraph, EngineError> {
                Ok(Default::default())
            }
            async fn chunks_query(
                &self,
                _q: &str,
                _k: usize,
            ) -> Result<Vec<atlas_rag::engine::ChunkHit>, EngineError> {
                Ok(Vec::new())
            }
        }

        let docs: DocMap = Default::default();
        let engine_slot = Mutex::new(Some(MutatingEngine {
            store: store.clone(),
            entry_id: entry.id.clone(),
            docs: docs.clone(),
        }));
        let runtime = RagRuntime::start(Box::new(move || {
            Ok(StdArc::new(engine_slot.lock().unwrap().take().unwrap()) as _)
        }));
        let indexer = StdArc::new(Indexer::new(runtime, true, Duration::from_secs(5)));
        let worker = IndexWorker::new(store.clone(), indexer, worker_cfg());

        worker.run_once().await.unwrap();

        // Same row back to pending with attempts reset, not a new row.
        let requeued = store.find_entry_outbox(&row.id).unwrap().unwrap();
        assert_eq!(requeued.status, OutboxStatus::Pending);
        assert_eq!(requeued.attempts, 0);
    }

    #[tokio::test]
    async fn transient_failures_retry_then_die_at_max_attempts() {
        struct FailingEngine;

        #[async_trait::async_trait(?Send)]
        impl KgEngine for FailingEngine {
            async fn ainsert(
                &self,
                _t: &str,
                _i: &[String],
                _f: &[String],
            ) -> Result<String, EngineError> {
                Err(EngineError::Transient("connection reset".into()))
            }
            async fn adelete_by_doc_id(&self, _d: &str) -> Result<(), EngineError> {
                Err(EngineError::Transient("connection reset".into()))
            }
            async fn query_llm(
                &self,
                _q: &str,
                _p: &atlas_rag::engine::QueryParam,
            ) -> Result<atlas_rag::engine::QueryOutput, EngineError> {
                Ok(Default::default())
            }
            async fn get_knowledge_graph(
                &self,
                _l: &str,
                _d: usize,
                _n: usize,
            ) -> Result<atlas_rag::engine::KnowledgeGraph, EngineError> {
                Ok(Default::default())
            }
            async fn chunks_query(
                &self,
                _q: &str,
                _k: usize,
            ) -> Result<Vec<atlas_rag::engine::ChunkHit>, EngineError> {
                Ok(Vec::new())
            }
        }

        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "A", "x")).unwrap();
        let runtime = RagRuntime::start(Box::new(|| Ok(StdArc::new(FailingEngine) as _)));
        let indexer = StdArc::new(Indexer::new(runtime, true, Duration::from_secs(5)));
        let mut cfg = worker_cfg();
        cfg.max_attempts = 2;
        let worker = IndexWorker::new(store.clone(), indexer, cfg);

        // Attempt 1: retry scheduled in the future.
        worker.run_once().await.unwrap();
        let after_first = store.entry_index_status(&entry.id).unwrap().unwrap();
        assert_eq!(after_first.status, OutboxStatus::Pending);
        assert_eq!(after_first.attempts, 1);
        assert!(after_first.available_at > utc_now());
        assert!(after_first.last_error.is_some());

        // Make it claimable again and exhaust attempts.
        {
            let p = ClaimParams {
                now: utc_now() + chrono::Duration::seconds(600),
                batch_size: 10,
                worker_id: "test:1".into(),
                lock_ttl_sec: 300,
                max_attempts: 2,
            };
            let claimed = store.claim_entry_index_batch(&p).unwrap();
            assert_eq!(claimed.len(), 1);
            worker.process_entry_event(claimed.into_iter().next().unwrap()).await;
        }
        let after_second = store.entry_index_status(&entry.id).unwrap().unwrap();
        assert_eq!(after_second.status, OutboxStatus::Dead);
        assert_eq!(after_second.attempts, 2);
    }

    #[tokio::test]
    async fn completed_attachment_is_indexed_with_composite_ids() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "Host", "x")).unwrap();
        let att = store
            .create_attachment(&entry.id, "p/doc.pdf", "doc.pdf", "application/pdf", 5, true)
            .unwrap();
        store.store_parsed_text(&att.id, "parsed body").unwrap();
        store
            .enqueue_attachment_index_upsert(&att.id, &entry.id)
            .unwrap();

        let (worker, docs) = worker_with_fake_engine(&store);
        // Drain the entry event first, then the attachment event.
        worker.run_once().await.unwrap();
        worker.run_once().await.unwrap();

        let stored = docs.lock().unwrap();
        let (text, file_path) = stored.get(&format!("attachment:{}", att.id)).unwrap();
        assert!(text.contains("doc.pdf"));
        assert!(text.contains(&entry.title));
        assert_eq!(file_path, &format!("{}/attachments/{}", entry.id, att.id));
    }

    #[tokio::test]
    async fn unparsed_attachment_upsert_translates_to_delete() {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "Host", "x")).unwrap();
        let att = store
            .create_attachment(&entry.id, "p/doc.pdf", "doc.pdf", "application/pdf", 5, true)
            .unwrap();
        // parse_status is still pending.
        store
            .enqueue_attachment_index_upsert(&att.id, &entry.id)
            .unwrap();

        let (worker, docs) = worker_with_fake_engine(&store);
        worker.run_once().await.unwrap();
        worker.run_once().await.unwrap();

        assert!(!docs
            .lock()
            .unwrap()
            .contains_key(&format!("attachment:{}", att.id)));
    }
}

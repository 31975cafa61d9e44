//! The attachment parse worker: object store → parser → parsed_text,
//! then hand-off into the index pipeline.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{error, info, warn};

use atlas_core::types::{AttachmentOutbox, ParseStatus};
use atlas_core::utc_now;
use atlas_store::outbox::{AttachmentPipeline, BackoffPolicy, ClaimParams};
use atlas_store::{Store, StoreError};

use crate::config::WorkerConfig;
use crate::parser::DocumentParser;
use crate::storage::ObjectStore;

pub struct ParseWorker {
    store: Store,
    objects: Arc<dyn ObjectStore>,
    parser: Arc<dyn DocumentParser>,
    cfg: WorkerConfig,
}

impl ParseWorker {
    pub fn new(
        store: Store,
        objects: Arc<dyn ObjectStore>,
        parser: Arc<dyn DocumentParser>,
        cfg: WorkerConfig,
    ) -> Self {
        Self {
            store,
            objects,
            parser,
            cfg,
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(worker_id = %self.cfg.worker_id, "parse worker starting");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let processed = match self.run_once().await {
                Ok(n) => n,
                Err(e) => {
                    error!("parse worker iteration failed: {e}");
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

        info!(worker_id = %self.cfg.worker_id, "parse worker stopped");
    }

    pub async fn run_once(&self) -> Result<usize, StoreError> {
        let params = ClaimParams {
            now: utc_now(),
            batch_size: self.cfg.batch_size,
            worker_id: self.cfg.worker_id.clone(),
            lock_ttl_sec: self.cfg.lock_ttl_sec,
            max_attempts: self.cfg.max_attempts,
        };
        let batch = self
            .store
            .claim_attachment_batch(AttachmentPipeline::Parse, &params)?;
        let count = batch.len();
        for outbox in batch {
            self.process_one(outbox).await;
        }
        Ok(count)
    }

    async fn process_one(&self, outbox: AttachmentOutbox) {
        let attachment = match self.store.find_attachment(&outbox.attachment_id) {
            Ok(Some(a)) => a,
            Ok(None) => {
                // Attachment gone; nothing to parse.
                let _ = self.store.mark_attachment_outbox_succeeded(
                    AttachmentPipeline::Parse,
                    &outbox.id,
                    &self.cfg.worker_id,
                );
                return;
            }
            Err(e) => {
                self.fail(&outbox, &e.to_string(), true).await;
                return;
            }
        };

        // Visible in the UI while we hold the row.
        let _ = self
            .store
            .set_attachment_parse_status(&attachment.id, ParseStatus::Processing);

        let suffix = std::path::Path::new(&attachment.original_filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let tmp = match tempfile::Builder::new().suffix(&suffix).tempfile() {
            Ok(f) => f,
            Err(e) => {
                self.fail(&outbox, &format!("temp file failed: {e}"), true)
                    .await;
                return;
            }
        };

        if let Err(e) = self
            .objects
            .get_to_file(&attachment.file_path, tmp.path())
            .await
        {
            self.fail(&outbox, &e.to_string(), true).await;
            return;
        }

        match self.parser.parse(tmp.path(), &attachment.content_type).await {
            Ok(text) => {
                let _ = self.store.store_parsed_text(&attachment.id, &text);
                let _ = self.store.mark_attachment_outbox_succeeded(
                    AttachmentPipeline::Parse,
                    &outbox.id,
                    &self.cfg.worker_id,
                );
                // Feed the freshly parsed text into the KG pipeline.
                let _ = self
                    .store
                    .enqueue_attachment_index_upsert(&attachment.id, &outbox.entry_id);
                info!(attachment_id = %attachment.id, "parse succeeded");
            }
            Err(e) => {
                self.fail(&outbox, &e.message, e.retryable).await;
            }
        }
    }

    async fn fail(&self, outbox: &AttachmentOutbox, error_message: &str, retryable: bool) {
        let permanent = !retryable || outbox.attempts >= self.cfg.max_attempts;
        let _ = self
            .store
            .record_parse_error(&outbox.attachment_id, error_message, permanent);

        if permanent {
            let _ = self.store.mark_attachment_outbox_dead(
                AttachmentPipeline::Parse,
                &outbox.id,
                &self.cfg.worker_id,
                error_message,
            );
            warn!(
                attachment_id = %outbox.attachment_id,
                attempts = outbox.attempts,
                "parse failed permanently: {error_message}"
            );
        } else {
            let next = utc_now()
                + chrono::Duration::from_std(BackoffPolicy::ATTACHMENT.delay(outbox.attempts))
                    .unwrap_or_else(|_| chrono::Duration::seconds(300));
            let _ = self.store.mark_attachment_outbox_retry(
                AttachmentPipeline::Parse,
                &outbox.id,
                &self.cfg.worker_id,
                next,
                error_message,
            );
            info!(
                attachment_id = %outbox.attachment_id,
                attempts = outbox.attempts,
                "parse retry scheduled"
            );
        }
    }
}

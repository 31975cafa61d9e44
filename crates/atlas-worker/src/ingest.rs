//! Attachment ingest: the upload/delete orchestration between the
//! object store and the database.
//!
//! Upload order is validate → put → insert. The object goes out first
//! so the row never points at a blob that does not exist; when the
//! metadata write fails afterwards, the freshly uploaded object is
//! removed best-effort and the caller sees a storage error.
//! Deletes clean the blob up too: a single attachment delete requires
//! the object removal to succeed before the row goes away, while the
//! entry-delete cascade removes objects best-effort — an unreachable
//! store must not block deleting the entry.

use std::path::Path;
use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use atlas_core::types::Attachment;
use atlas_core::AtlasError;
use atlas_store::Store;

use crate::storage::{validate_upload, ObjectStore};

pub struct AttachmentIngest {
    store: Store,
    objects: Arc<dyn ObjectStore>,
    max_file_size_mb: u64,
}

impl AttachmentIngest {
    pub fn new(store: Store, objects: Arc<dyn ObjectStore>, max_file_size_mb: u64) -> Self {
        Self {
            store,
            objects,
            max_file_size_mb,
        }
    }

    /// Store the blob, then the row (which enqueues the parse event in
    /// the same transaction). A failed metadata write deletes the
    /// just-uploaded object before surfacing the error.
    pub async fn upload(
        &self,
        entry_id: &str,
        original_filename: &str,
        content_type: &str,
        data: &[u8],
        index_to_knowledge_graph: bool,
    ) -> Result<Attachment, AtlasError> {
        validate_upload(
            content_type,
            data.len() as u64,
            self.max_file_size_mb,
            index_to_knowledge_graph,
        )?;

        let original_filename = if original_filename.trim().is_empty() {
            "file"
        } else {
            original_filename.trim()
        };
        let ext = Path::new(original_filename)
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_default();
        let object_key = format!("attachments/{entry_id}/{}{ext}", Uuid::new_v4());

        self.objects
            .put(&object_key, data, content_type)
            .await
            .map_err(|e| AtlasError::Storage(format!("failed to upload attachment: {e}")))?;

        match self.store.create_attachment(
            entry_id,
            &object_key,
            original_filename,
            content_type,
            data.len() as u64,
            index_to_knowledge_graph,
        ) {
            Ok(attachment) => {
                info!(
                    attachment_id = %attachment.id,
                    entry_id = %entry_id,
                    object_key = %object_key,
                    "attachment uploaded"
                );
                Ok(attachment)
            }
            Err(e) => {
                // The row never landed; don't leave the blob orphaned.
                if let Err(cleanup) = self.objects.delete(&object_key).await {
                    warn!(object_key = %object_key, "upload rollback cleanup failed: {cleanup}");
                }
                Err(AtlasError::Storage(format!(
                    "failed to save attachment metadata: {e}"
                )))
            }
        }
    }

    /// Delete one attachment: object first (a failure here keeps the
    /// row so the blob stays reachable), then the row, which enqueues
    /// KG cleanup.
    pub async fn delete(&self, attachment_id: &str) -> Result<(), AtlasError> {
        let attachment = self
            .store
            .find_attachment(attachment_id)
            .map_err(AtlasError::from)?
            .ok_or_else(|| AtlasError::NotFound(format!("attachment not found: {attachment_id}")))?;

        self.objects
            .delete(&attachment.file_path)
            .await
            .map_err(|e| {
                AtlasError::Storage(format!("failed to delete attachment from storage: {e}"))
            })?;

        self.store
            .delete_attachment(attachment_id)
            .map_err(AtlasError::from)
    }

    /// Delete an entry and everything under it. Object removal is
    /// best-effort per attachment: with storage unavailable the entry
    /// still goes away and the blobs are merely orphaned.
    pub async fn delete_entry(&self, entry_id: &str) -> Result<(), AtlasError> {
        let attachments = self
            .store
            .list_attachments_by_entry(entry_id)
            .map_err(AtlasError::from)?;
        for attachment in &attachments {
            if let Err(e) = self.objects.delete(&attachment.file_path).await {
                warn!(
                    attachment_id = %attachment.id,
                    object_key = %attachment.file_path,
                    "entry delete: object cleanup failed, continuing: {e}"
                );
            }
        }
        self.store.delete_entry(entry_id).map_err(AtlasError::from)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc as StdArc;

    use super::*;
    use crate::storage::test_support::MemoryObjectStore;
    use crate::storage::StorageError;
    use async_trait::async_trait;
    use atlas_core::types::{OutboxOp, ParseStatus};
    use atlas_core::utc_now;
    use atlas_store::outbox::{AttachmentPipeline, ClaimParams};
    use atlas_store::entry::test_support::{entry_input, seed_type};

    fn claim_params() -> ClaimParams {
        ClaimParams {
            now: utc_now(),
            batch_size: 10,
            worker_id: "w".to_string(),
            lock_ttl_sec: 600,
            max_attempts: 3,
        }
    }

    fn seeded() -> (Store, String) {
        let store = Store::open_in_memory().unwrap();
        seed_type(&store, "t1", true);
        let entry = store.create_entry(&entry_input("t1", "Host", "x")).unwrap();
        (store, entry.id)
    }

    #[tokio::test]
    async fn upload_stores_object_row_and_parse_event() {
        let (store, entry_id) = seeded();
        let objects = StdArc::new(MemoryObjectStore::default());
        let ingest = AttachmentIngest::new(store.clone(), objects.clone(), 100);

        let attachment = ingest
            .upload(&entry_id, "notes.txt", "text/plain", b"hello", true)
            .await
            .unwrap();

        assert_eq!(attachment.parse_status, ParseStatus::Pending);
        assert!(attachment.file_path.starts_with(&format!("attachments/{entry_id}/")));
        assert!(attachment.file_path.ends_with(".txt"));
        assert_eq!(objects.object_count(), 1);
        assert_eq!(
            objects.stat(&attachment.file_path).await.unwrap().size,
            5
        );

        let claimed = store
            .claim_attachment_batch(AttachmentPipeline::Parse, &claim_params())
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].attachment_id, attachment.id);
    }

    #[tokio::test]
    async fn validation_rejects_before_any_object_is_written() {
        let (store, entry_id) = seeded();
        let objects = StdArc::new(MemoryObjectStore::default());
        let ingest = AttachmentIngest::new(store.clone(), objects.clone(), 100);

        // Unsupported type with indexing requested.
        let err = ingest
            .upload(&entry_id, "photo.png", "image/png", b"...", true)
            .await
            .unwrap_err();
        assert!(matches!(err, AtlasError::Validation(_)));
        assert_eq!(objects.object_count(), 0);

        // Oversized file.
        let ingest_small = AttachmentIngest::new(store, objects.clone(), 0);
        let err = ingest_small
            .upload(&entry_id, "notes.txt", "text/plain", b"hello", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AtlasError::PayloadTooLarge(_)));
        assert_eq!(objects.object_count(), 0);
    }

    #[tokio::test]
    async fn db_failure_rolls_back_the_uploaded_object() {
        let store = Store::open_in_memory().unwrap();
        let objects = StdArc::new(MemoryObjectStore::default());
        let ingest = AttachmentIngest::new(store.clone(), objects.clone(), 100);

        // No such entry: the metadata insert fails on the foreign key
        // after the object has already been stored.
        let err = ingest
            .upload("no-such-entry", "notes.txt", "text/plain", b"hello", false)
            .await
            .unwrap_err();
        assert!(matches!(err, AtlasError::Storage(_)));
        assert_eq!(err.http_status(), 500);
        assert_eq!(objects.object_count(), 0);
    }

    #[tokio::test]
    async fn delete_removes_object_then_row_and_enqueues_kg_cleanup() {
        let (store, entry_id) = seeded();
        let objects = StdArc::new(MemoryObjectStore::default());
        let ingest = AttachmentIngest::new(store.clone(), objects.clone(), 100);
        let attachment = ingest
            .upload(&entry_id, "notes.txt", "text/plain", b"hello", true)
            .await
            .unwrap();

        ingest.delete(&attachment.id).await.unwrap();
        assert_eq!(objects.object_count(), 0);
        assert!(store.find_attachment(&attachment.id).unwrap().is_none());

        let claimed = store
            .claim_attachment_batch(AttachmentPipeline::Index, &claim_params())
            .unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].op, OutboxOp::Delete);
        assert_eq!(claimed[0].attachment_id, attachment.id);
    }

    #[tokio::test]
    async fn delete_keeps_the_row_when_object_removal_fails() {
        struct BrokenStore;

        #[async_trait]
        impl ObjectStore for BrokenStore {
            async fn put(
                &self,
                _key: &str,
                _data: &[u8],
                _content_type: &str,
            ) -> Result<(), StorageError> {
                Ok(())
            }
            async fn get_to_file(
                &self,
                _key: &str,
                _dest: &std::path::Path,
            ) -> Result<(), StorageError> {
                Err(StorageError::Io("offline".into()))
            }
            async fn delete(&self, _key: &str) -> Result<(), StorageError> {
                Err(StorageError::Io("offline".into()))
            }
            async fn stat(&self, _key: &str) -> Result<crate::storage::ObjectStat, StorageError> {
                Err(StorageError::Io("offline".into()))
            }
        }

        let (store, entry_id) = seeded();
        let working = StdArc::new(MemoryObjectStore::default());
        let attachment = AttachmentIngest::new(store.clone(), working, 100)
            .upload(&entry_id, "notes.txt", "text/plain", b"hello", false)
            .await
            .unwrap();

        let broken = AttachmentIngest::new(store.clone(), StdArc::new(BrokenStore), 100);
        let err = broken.delete(&attachment.id).await.unwrap_err();
        assert!(matches!(err, AtlasError::Storage(_)));
        // The row survives so the blob stays reachable.
        assert!(store.find_attachment(&attachment.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn entry_delete_cascade_removes_objects_best_effort() {
        let (store, entry_id) = seeded();
        let objects = StdArc::new(MemoryObjectStore::default());
        let ingest = AttachmentIngest::new(store.clone(), objects.clone(), 100);
        let first = ingest
            .upload(&entry_id, "a.txt", "text/plain", b"a", true)
            .await
            .unwrap();
        ingest
            .upload(&entry_id, "b.md", "text/markdown", b"b", false)
            .await
            .unwrap();
        assert_eq!(objects.object_count(), 2);

        ingest.delete_entry(&entry_id).await.unwrap();

        assert_eq!(objects.object_count(), 0);
        assert!(store.find_entry(&entry_id).unwrap().is_none());
        assert!(store.find_attachment(&first.id).unwrap().is_none());
        // KG cleanup still enqueued for the entry's attachments.
        let claimed = store
            .claim_attachment_batch(AttachmentPipeline::Index, &claim_params())
            .unwrap();
        assert!(claimed.iter().all(|row| row.op == OutboxOp::Delete));
        assert_eq!(claimed.len(), 2);
    }
}

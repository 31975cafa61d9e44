//! Object store contract (S3-compatible) plus upload validation.

use std::path::Path;

use async_trait::async_trait;
use thiserror::Error;

use atlas_core::AtlasError;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("storage failure: {0}")]
    Io(String),
}

impl From<StorageError> for AtlasError {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::NotFound(k) => AtlasError::NotFound(format!("object not found: {k}")),
            StorageError::Io(m) => AtlasError::Storage(m),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ObjectStat {
    pub size: u64,
    pub content_type: Option<String>,
}

/// The four calls the pipelines need from the blob store.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, data: &[u8], content_type: &str) -> Result<(), StorageError>;
    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), StorageError>;
    async fn delete(&self, key: &str) -> Result<(), StorageError>;
    async fn stat(&self, key: &str) -> Result<ObjectStat, StorageError>;
}

/// Content types the parse pipeline can extract text from.
const PARSEABLE_CONTENT_TYPES: &[&str] = &[
    "application/pdf",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/vnd.openxmlformats-officedocument.presentationml.presentation",
    "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet",
    "text/plain",
    "text/markdown",
    "text/html",
];

pub fn is_parseable_content_type(content_type: &str) -> bool {
    let ct = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    PARSEABLE_CONTENT_TYPES.contains(&ct.as_str())
}

/// Pre-upload validation. Size overruns are always rejected;
/// unsupported content types only when KG indexing was requested.
pub fn validate_upload(
    content_type: &str,
    size: u64,
    max_file_size_mb: u64,
    index_requested: bool,
) -> Result<(), AtlasError> {
    let max_bytes = max_file_size_mb * 1024 * 1024;
    if size > max_bytes {
        return Err(AtlasError::PayloadTooLarge(format!(
            "file too large: {size} bytes (max {max_file_size_mb} MB)"
        )));
    }
    if index_requested && !is_parseable_content_type(content_type) {
        return Err(AtlasError::Validation(format!(
            "unsupported file type for indexing: {content_type}"
        )));
    }
    Ok(())
}

/// Filesystem-backed store: keys map to paths under a root directory.
/// Default backend when no remote object store is wired in.
pub struct FsObjectStore {
    root: std::path::PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<std::path::PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, key: &str) -> Result<std::path::PathBuf, StorageError> {
        // Keys must stay inside the root.
        let relative = std::path::Path::new(key);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| matches!(c, std::path::Component::ParentDir))
        {
            return Err(StorageError::Io(format!("invalid object key: {key}")));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, data: &[u8], _content_type: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StorageError::Io(e.to_string()))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    async fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        if !path.exists() {
            return Err(StorageError::NotFound(key.to_string()));
        }
        tokio::fs::copy(&path, dest)
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Io(e.to_string()))
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let path = self.resolve(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::Io(e.to_string())),
        }
    }

    async fn stat(&self, key: &str) -> Result<ObjectStat, StorageError> {
        let path = self.resolve(key)?;
        let meta = tokio::fs::metadata(&path)
            .await
            .map_err(|_| StorageError::NotFound(key.to_string()))?;
        Ok(ObjectStat {
            size: meta.len(),
            content_type: None,
        })
    }
}

/// In-memory store for tests.
#[doc(hidden)]
pub mod test_support {
    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MemoryObjectStore {
        objects: Mutex<HashMap<String, Vec<u8>>>,
    }

    impl MemoryObjectStore {
        pub fn with_object(key: &str, data: &[u8]) -> Self {
            let store = Self::default();
            store
                .objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            store
        }

        pub fn object_count(&self) -> usize {
            self.objects.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryObjectStore {
        async fn put(
            &self,
            key: &str,
            data: &[u8],
            _content_type: &str,
        ) -> Result<(), StorageError> {
            self.objects
                .lock()
                .unwrap()
                .insert(key.to_string(), data.to_vec());
            Ok(())
        }

        async fn get_to_file(&self, key: &str, dest: &Path) -> Result<(), StorageError> {
            let data = self
                .objects
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            std::fs::write(dest, data).map_err(|e| StorageError::Io(e.to_string()))
        }

        async fn delete(&self, key: &str) -> Result<(), StorageError> {
            self.objects.lock().unwrap().remove(key);
            Ok(())
        }

        async fn stat(&self, key: &str) -> Result<ObjectStat, StorageError> {
            let objects = self.objects.lock().unwrap();
            let data = objects
                .get(key)
                .ok_or_else(|| StorageError::NotFound(key.to_string()))?;
            Ok(ObjectStat {
                size: data.len() as u64,
                content_type: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_uploads_are_rejected_as_413() {
        let err = validate_upload("application/pdf", 200 * 1024 * 1024, 100, false).unwrap_err();
        assert!(matches!(err, AtlasError::PayloadTooLarge(_)));
        assert_eq!(err.http_status(), 413);
    }

    #[test]
    fn unsupported_type_rejected_only_when_indexing() {
        assert!(validate_upload("image/png", 10, 100, false).is_ok());
        assert!(validate_upload("image/png", 10, 100, true).is_err());
        assert!(validate_upload("application/pdf; charset=binary", 10, 100, true).is_ok());
    }
}

//! Durable storage backends.
//!
//! A backend stores one object per page, addressed by the page's chained
//! [`BlockKey`]. Implementations must tolerate concurrent operations on
//! distinct keys; writes to the same key are serialized by the caller.
//!
//! - `file`: sharded directory tree on a local or shared filesystem
//! - `memory`: process-local map, for tests and single-process setups

pub mod compressor;
pub mod file;

use std::collections::HashMap;
use std::fmt::Debug;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use thiserror::Error;

use crate::cache::block::BlockKey;
use crate::config::StorageBackendKind;
use compressor::{CompressionConfig, CompressionError};
use file::FileBackend;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt object for key {key}: {reason}")]
    Corrupt { key: BlockKey, reason: String },

    #[error("Compression error: {0}")]
    Compression(#[from] CompressionError),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// A durable page store.
#[async_trait]
pub trait StorageBackend: Send + Sync + Debug {
    fn name(&self) -> &'static str;

    /// Fetch the object for `key`, or `None` if it was never written.
    async fn get(&self, key: BlockKey) -> Result<Option<Bytes>, StorageError>;

    /// Store `payload` under `key`. Once this returns, a `get` of the same key
    /// observes the complete payload.
    async fn put(&self, key: BlockKey, payload: Bytes) -> Result<(), StorageError>;

    async fn exists(&self, key: BlockKey) -> Result<bool, StorageError>;
}

pub type SharedBackend = Arc<dyn StorageBackend>;

/// Open the configured backend.
pub async fn open_backend(
    kind: StorageBackendKind,
    root: Option<&Path>,
    compression: CompressionConfig,
) -> Result<SharedBackend, StorageError> {
    match kind {
        StorageBackendKind::File => {
            let root = root.ok_or_else(|| {
                StorageError::Unavailable("file backend requires a storage directory".into())
            })?;
            Ok(Arc::new(FileBackend::new(root, compression).await?))
        }
        StorageBackendKind::Memory => Ok(Arc::new(MemoryBackend::new())),
    }
}

/// In-memory backend.
///
/// Can be told to fail a number of upcoming writes, which exercises the
/// retry and flush-failure paths.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    objects: Mutex<HashMap<BlockKey, Bytes>>,
    fail_next_puts: AtomicUsize,
    puts: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `put` fail.
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_next_puts.store(n, Ordering::SeqCst);
    }

    /// Number of successful writes so far.
    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Delete an object behind the cache's back.
    pub fn remove(&self, key: BlockKey) -> bool {
        self.objects.lock().remove(&key).is_some()
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: BlockKey) -> Result<Option<Bytes>, StorageError> {
        Ok(self.objects.lock().get(&key).cloned())
    }

    async fn put(&self, key: BlockKey, payload: Bytes) -> Result<(), StorageError> {
        let injected = self
            .fail_next_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(StorageError::Unavailable(format!("injected write failure for {key}")));
        }
        self.objects.lock().insert(key, payload);
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn exists(&self, key: BlockKey) -> Result<bool, StorageError> {
        Ok(self.objects.lock().contains_key(&key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_roundtrip() {
        let backend = MemoryBackend::new();
        assert!(backend.get(BlockKey(1)).await.unwrap().is_none());

        backend.put(BlockKey(1), Bytes::from_static(b"page")).await.unwrap();
        assert!(backend.exists(BlockKey(1)).await.unwrap());
        assert_eq!(backend.get(BlockKey(1)).await.unwrap().unwrap(), "page");
    }

    #[tokio::test]
    async fn test_memory_backend_injected_failures() {
        let backend = MemoryBackend::new();
        backend.fail_next_puts(2);
        assert!(backend.put(BlockKey(1), Bytes::new()).await.is_err());
        assert!(backend.put(BlockKey(1), Bytes::new()).await.is_err());
        assert!(backend.put(BlockKey(1), Bytes::new()).await.is_ok());
        assert_eq!(backend.put_count(), 1);
    }

    #[tokio::test]
    async fn test_open_file_backend_requires_root() {
        let err = open_backend(StorageBackendKind::File, None, CompressionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Unavailable(_)));
    }
}

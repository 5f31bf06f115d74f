//! Durability pipeline: replicates blocks to the durable backend.
//!
//! Writes to one key are serialized through a per-key async mutex; distinct
//! keys proceed concurrently. A failed write is retried with exponential
//! backoff up to `max_retries` times before the error is returned. A key the
//! backend already holds is not written again, so write-through racing a
//! flush of the same content costs one upload. The backend is the only record
//! of what is durable; nothing here remembers keys past their write.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::cache::block::{BlockId, BlockKey};
use crate::cache::pager::PendingWrite;
use crate::storage::{SharedBackend, StorageError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FlushError {
    #[error("{failed} of {attempted} dirty blocks could not be made durable")]
    Incomplete { failed: usize, attempted: usize },
}

/// Retry tuning for durable writes.
#[derive(Debug, Clone)]
pub struct DurabilityConfig {
    pub max_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for DurabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_backoff: Duration::from_millis(20),
        }
    }
}

/// Outcome of writing a batch of blocks.
#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub written: Vec<BlockId>,
    pub failed: Vec<(BlockId, String)>,
}

#[derive(Debug)]
pub struct DurabilityPipeline {
    backend: SharedBackend,
    config: DurabilityConfig,
    key_locks: Mutex<HashMap<BlockKey, Arc<tokio::sync::Mutex<()>>>>,
}

impl DurabilityPipeline {
    pub fn new(backend: SharedBackend, config: DurabilityConfig) -> Self {
        Self {
            backend,
            config,
            key_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    fn key_lock(&self, key: BlockKey) -> Arc<tokio::sync::Mutex<()>> {
        self.key_locks.lock().entry(key).or_default().clone()
    }

    fn release_key_lock(&self, key: BlockKey, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.key_locks.lock();
        // One reference in the map, one held here: nobody else is queued.
        if Arc::strong_count(&lock) == 2 {
            locks.remove(&key);
        }
        drop(lock);
    }

    /// Write one page durably, retrying transient failures.
    pub async fn persist(&self, key: BlockKey, payload: Bytes) -> Result<(), StorageError> {
        let lock = self.key_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.persist_locked(key, payload).await
        };
        self.release_key_lock(key, lock);
        result
    }

    async fn persist_locked(&self, key: BlockKey, payload: Bytes) -> Result<(), StorageError> {
        match self.backend.exists(key).await {
            Ok(true) => {
                debug!(key = %key, "Page already durable");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!(key = %key, error = %e, "Existence check failed, writing anyway"),
        }

        let mut attempt = 0;
        loop {
            match self.backend.put(key, payload.clone()).await {
                Ok(()) => {
                    debug!(key = %key, attempt, "Persisted page");
                    return Ok(());
                }
                Err(e) if attempt < self.config.max_retries => {
                    let backoff = self.config.retry_backoff * 2u32.saturating_pow(attempt);
                    warn!(key = %key, attempt, error = %e, ?backoff, "Durable write failed, retrying");
                    tokio::time::sleep(backoff).await;
                    attempt += 1;
                }
                Err(e) => {
                    warn!(key = %key, attempts = attempt + 1, error = %e, "Durable write failed");
                    return Err(e);
                }
            }
        }
    }

    /// Write a batch concurrently.
    pub async fn persist_all(&self, writes: Vec<PendingWrite>) -> BatchOutcome {
        let results = join_all(writes.into_iter().map(|w| async move {
            let result = self.persist(w.key, w.payload).await;
            (w.block_id, result)
        }))
        .await;

        let mut outcome = BatchOutcome::default();
        for (id, result) in results {
            match result {
                Ok(()) => outcome.written.push(id),
                Err(e) => outcome.failed.push((id, e.to_string())),
            }
        }
        outcome
    }

    /// Read a page back from the backend.
    pub async fn fetch(&self, key: BlockKey) -> Result<Option<Bytes>, StorageError> {
        self.backend.get(key).await
    }

    pub async fn exists(&self, key: BlockKey) -> Result<bool, StorageError> {
        self.backend.exists(key).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{MemoryBackend, StorageBackend};

    fn pipeline(backend: Arc<MemoryBackend>, retries: u32) -> DurabilityPipeline {
        DurabilityPipeline::new(
            backend,
            DurabilityConfig {
                max_retries: retries,
                retry_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_persist_then_fetch() {
        let backend = Arc::new(MemoryBackend::new());
        let durability = pipeline(backend.clone(), 0);

        durability.persist(BlockKey(1), Bytes::from_static(b"abc")).await.unwrap();
        assert!(durability.exists(BlockKey(1)).await.unwrap());
        assert_eq!(durability.fetch(BlockKey(1)).await.unwrap().unwrap(), "abc");
        assert!(backend.exists(BlockKey(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_puts(2);
        let durability = pipeline(backend.clone(), 3);

        durability.persist(BlockKey(9), Bytes::from_static(b"x")).await.unwrap();
        assert_eq!(backend.put_count(), 1);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_puts(10);
        let durability = pipeline(backend.clone(), 2);

        assert!(durability.persist(BlockKey(9), Bytes::from_static(b"x")).await.is_err());
        assert!(!durability.exists(BlockKey(9)).await.unwrap());
    }

    #[tokio::test]
    async fn test_removed_object_is_written_again() {
        let backend = Arc::new(MemoryBackend::new());
        let durability = pipeline(backend.clone(), 0);

        durability.persist(BlockKey(4), Bytes::from_static(b"q")).await.unwrap();
        durability.persist(BlockKey(4), Bytes::from_static(b"q")).await.unwrap();
        assert_eq!(backend.put_count(), 1);

        assert!(backend.remove(BlockKey(4)));
        assert!(!durability.exists(BlockKey(4)).await.unwrap());
        assert!(durability.fetch(BlockKey(4)).await.unwrap().is_none());

        durability.persist(BlockKey(4), Bytes::from_static(b"q")).await.unwrap();
        assert_eq!(backend.put_count(), 2);
        assert!(durability.exists(BlockKey(4)).await.unwrap());
    }

    #[tokio::test]
    async fn test_same_key_written_once() {
        let backend = Arc::new(MemoryBackend::new());
        let durability = Arc::new(pipeline(backend.clone(), 0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let d = durability.clone();
                tokio::spawn(async move { d.persist(BlockKey(3), Bytes::from_static(b"p")).await })
            })
            .collect();
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        assert_eq!(backend.put_count(), 1);
        assert!(durability.key_locks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_batch_reports_failures() {
        let backend = Arc::new(MemoryBackend::new());
        backend.fail_next_puts(1);
        let durability = pipeline(backend, 0);

        let writes = vec![PendingWrite {
            block_id: 7,
            key: BlockKey(7),
            payload: Bytes::from_static(b"z"),
        }];
        let outcome = durability.persist_all(writes).await;
        assert!(outcome.written.is_empty());
        assert_eq!(outcome.failed.len(), 1);
        assert_eq!(outcome.failed[0].0, 7);
    }
}

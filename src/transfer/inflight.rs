//! Coalescing table for in-flight work.
//!
//! The first caller for a key spawns the work as a task; later callers for the
//! same key join it and receive a clone of its result. Each entry counts its
//! waiters. A waiter dropped before the result arrives decrements the count,
//! and only when the last waiter leaves is the task aborted, so a cancelled
//! request never tears down work other requests still depend on.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::trace;

struct Entry<V> {
    rx: watch::Receiver<Option<V>>,
    waiters: usize,
    abort: AbortHandle,
    generation: u64,
}

type Entries<K, V> = Arc<Mutex<HashMap<K, Entry<V>>>>;

pub struct InflightTable<K, V> {
    entries: Entries<K, V>,
    generations: AtomicU64,
}

impl<K, V> Default for InflightTable<K, V> {
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            generations: AtomicU64::new(0),
        }
    }
}

impl<K, V> Debug for InflightTable<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InflightTable")
            .field("entries", &self.entries.lock().len())
            .finish()
    }
}

/// A handle on shared in-flight work.
pub struct Waiter<V> {
    rx: watch::Receiver<Option<V>>,
    leader: bool,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl<K, V> InflightTable<K, V>
where
    K: Eq + Hash + Clone + Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of keys with work in flight.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Join the work for `key`, starting it with `make` if nothing is in flight.
    pub fn join<F, Fut>(&self, key: K, make: F) -> Waiter<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V> + Send + 'static,
    {
        let mut entries = self.entries.lock();

        if let Some(entry) = entries.get_mut(&key) {
            entry.waiters += 1;
            trace!(key = ?key, waiters = entry.waiters, "Joined in-flight work");
            let release = self.releaser(key, entry.generation);
            return Waiter {
                rx: entry.rx.clone(),
                leader: false,
                release: Some(release),
            };
        }

        let generation = self.generations.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(None);
        let work = make();
        let table = Arc::clone(&self.entries);
        let task_key = key.clone();
        let handle = tokio::spawn(async move {
            let value = work.await;
            {
                let mut entries = table.lock();
                if entries
                    .get(&task_key)
                    .is_some_and(|e| e.generation == generation)
                {
                    entries.remove(&task_key);
                }
            }
            let _ = tx.send(Some(value));
        });

        entries.insert(
            key.clone(),
            Entry {
                rx: rx.clone(),
                waiters: 1,
                abort: handle.abort_handle(),
                generation,
            },
        );
        Waiter {
            rx,
            leader: true,
            release: Some(self.releaser(key, generation)),
        }
    }

    fn releaser(&self, key: K, generation: u64) -> Box<dyn FnOnce() + Send + Sync> {
        let table = Arc::clone(&self.entries);
        Box::new(move || {
            let mut entries = table.lock();
            let Some(entry) = entries.get_mut(&key) else {
                return;
            };
            if entry.generation != generation {
                return;
            }
            entry.waiters -= 1;
            if entry.waiters == 0 {
                entry.abort.abort();
                entries.remove(&key);
                trace!(key = ?key, "Aborted in-flight work with no waiters");
            }
        })
    }
}

impl<V: Clone> Waiter<V> {
    /// Whether this waiter started the work.
    pub fn is_leader(&self) -> bool {
        self.leader
    }

    /// Wait for the result. `None` means the work was aborted.
    pub async fn wait(mut self) -> Option<V> {
        loop {
            let current = self.rx.borrow_and_update().clone();
            if let Some(value) = current {
                // The task removed its entry before publishing.
                self.release = None;
                return Some(value);
            }
            if self.rx.changed().await.is_err() {
                let value = self.rx.borrow().clone();
                if value.is_some() {
                    self.release = None;
                }
                return value;
            }
        }
    }
}

impl<V> Drop for Waiter<V> {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

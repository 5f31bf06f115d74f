//! The cache space: one node's prefix index, tier manager and durability
//! pipeline behind a single lock.
//!
//! A `CacheSpace` is built once at startup and shared by every request task as
//! an `Arc`. The index and the pager sit under one `parking_lot::RwLock` that
//! is never held across an `.await`; storage reads and durable writes run
//! outside the lock and re-enter it only to install their results.
//!
//! Requests resolve a prefix with [`CacheSpace::lookup`], which returns a
//! [`Lease`] pinning the Device-resident chain. Dropping the lease, including
//! on cancellation, releases the pins.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::accounting;
use crate::cache::block::{page_keys, Block, BlockId, BlockKey, Tier, TokenId};
use crate::cache::durability::{DurabilityPipeline, FlushError};
use crate::cache::pager::{EvictionReport, Pager, PagerConfig, PendingWrite, TierStats};
use crate::cache::radix::PrefixIndex;
use crate::config::{CacheConfig, PrefetchPolicy, WritePolicy};
use crate::metrics::CacheMetrics;
use crate::storage::{SharedBackend, StorageError};
use crate::transfer::inflight::InflightTable;

#[derive(Debug)]
struct CacheState {
    index: PrefixIndex,
    pager: Pager,
}

/// Result of a read-only prefix match.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheMatch {
    pub matched_len: usize,
    /// Blocks backing the matched whole pages with their current tier.
    pub blocks: Vec<(BlockId, Option<Tier>)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TierSummary {
    pub tier: Tier,
    #[serde(flatten)]
    pub stats: TierStats,
    pub utilization: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SpaceStats {
    pub page_size: usize,
    pub hierarchical: bool,
    pub tiers: Vec<TierSummary>,
    pub blocks: usize,
    pub radix_nodes: usize,
    pub indexed_tokens: usize,
    pub pending_writes: usize,
    pub backend: Option<&'static str>,
}

/// Pages of a lookup that must come up from the durable backend.
#[derive(Debug, Default)]
struct LoadPlan {
    /// Matched blocks resident only in the Remote tier.
    remote: Vec<(BlockId, BlockKey)>,
    /// Page index of the first key past the match.
    extra_start: usize,
    /// Consecutive keys past the match that exist in the backend.
    extra: Vec<BlockKey>,
}

impl LoadPlan {
    fn is_empty(&self) -> bool {
        self.remote.is_empty() && self.extra.is_empty()
    }
}

pub struct CacheSpace {
    config: CacheConfig,
    state: RwLock<CacheState>,
    durability: Option<Arc<DurabilityPipeline>>,
    reads: InflightTable<BlockKey, Option<Bytes>>,
    pending_writes: AtomicUsize,
    writes_idle: Notify,
    metrics: CacheMetrics,
}

impl std::fmt::Debug for CacheSpace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheSpace")
            .field("page_size", &self.config.page_size)
            .field("hierarchical", &self.config.hierarchical)
            .field("pending_writes", &self.pending_writes.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl CacheSpace {
    pub fn new(config: CacheConfig, backend: Option<SharedBackend>, metrics: CacheMetrics) -> Self {
        let pager = Pager::new(PagerConfig {
            device_capacity: config.device_capacity,
            host_capacity: config.host_capacity,
            hierarchical: config.hierarchical,
            has_backend: backend.is_some(),
            low_watermark: config.low_watermark,
        });
        let durability = backend
            .map(|backend| Arc::new(DurabilityPipeline::new(backend, config.durability.clone())));

        info!(
            page_size = config.page_size,
            hierarchical = config.hierarchical,
            device_capacity = config.device_capacity,
            host_capacity = config.host_capacity,
            write_policy = ?config.write_policy,
            prefetch_policy = ?config.prefetch_policy,
            backend = durability.as_ref().map(|d| d.backend_name()),
            "Cache space initialized"
        );

        Self {
            state: RwLock::new(CacheState {
                index: PrefixIndex::new(config.page_size),
                pager,
            }),
            config,
            durability,
            reads: InflightTable::new(),
            pending_writes: AtomicUsize::new(0),
            writes_idle: Notify::new(),
            metrics,
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    pub fn metrics(&self) -> &CacheMetrics {
        &self.metrics
    }

    pub fn has_backend(&self) -> bool {
        self.durability.is_some()
    }

    /// Longest cached prefix of `tokens`, without touching residency.
    pub fn match_prefix(&self, tokens: &[TokenId]) -> CacheMatch {
        let state = self.state.read();
        let m = state.index.match_prefix(tokens);
        let blocks = m
            .blocks
            .iter()
            .map(|&id| (id, state.pager.block(id).and_then(|b| b.tier())))
            .collect();
        CacheMatch {
            matched_len: m.matched_len,
            blocks,
        }
    }

    /// Resolve the cached prefix of `tokens` and make it compute-ready.
    ///
    /// Host blocks are promoted in place. Blocks held only by the durable
    /// backend, and further pages the backend has under the same chained
    /// keys, are loaded according to the prefetch policy. The returned lease
    /// pins exactly the leading pages that are on Device.
    pub async fn lookup(self: &Arc<Self>, tokens: &[TokenId]) -> Lease {
        let keys = page_keys(tokens, self.config.page_size);

        let (mut plan, pinned, matched_len, writebacks) = {
            let mut state = self.state.write();
            let m = state.index.match_prefix(tokens);
            let mut plan = LoadPlan::default();
            let mut chain = Vec::with_capacity(m.blocks.len());

            for &id in &m.blocks {
                let Some((tier, key)) = state.pager.block(id).map(|b| (b.tier(), b.key)) else {
                    break;
                };
                match tier {
                    Some(Tier::Device) => {}
                    Some(Tier::Host) => {
                        state.pager.promote_from_host(id);
                    }
                    Some(Tier::Remote) if self.durability.is_some() => plan.remote.push((id, key)),
                    _ => break,
                }
                chain.push(id);
            }
            state.pager.pin(&chain);
            plan.extra_start = chain.len();

            let report = state.pager.enforce_capacity();
            let writebacks = self.apply_eviction(&mut state, report);
            (plan, chain, m.matched_len, writebacks)
        };
        self.spawn_writes(writebacks);

        let mut lease = Lease {
            space: Arc::clone(self),
            pinned,
            matched_len,
            payloads: Vec::new(),
        };

        if let Some(durability) = &self.durability {
            for key in &keys[plan.extra_start.min(keys.len())..] {
                match durability.exists(*key).await {
                    Ok(true) => plan.extra.push(*key),
                    Ok(false) => break,
                    Err(e) => {
                        warn!(key = %key, error = %e, "Storage probe failed");
                        break;
                    }
                }
            }
        }

        if !plan.is_empty() {
            debug!(
                remote = plan.remote.len(),
                extra = plan.extra.len(),
                policy = ?self.config.prefetch_policy,
                "Loading pages from storage"
            );
            let load = Arc::clone(self).load(Arc::from(tokens), plan);
            match self.config.prefetch_policy {
                PrefetchPolicy::WaitComplete => load.await,
                PrefetchPolicy::Timeout => {
                    let handle = tokio::spawn(load);
                    if tokio::time::timeout(self.config.prefetch_timeout, handle)
                        .await
                        .is_err()
                    {
                        debug!(timeout = ?self.config.prefetch_timeout, "Prefetch timed out, continuing with ready pages");
                    }
                }
                PrefetchPolicy::BestEffort => {
                    tokio::spawn(load);
                }
            }
        }

        self.finalize(tokens, &mut lease);
        lease
    }

    /// Read the planned pages from the backend and install them.
    async fn load(self: Arc<Self>, tokens: Arc<[TokenId]>, plan: LoadPlan) {
        let remote_keys: Vec<BlockKey> = plan.remote.iter().map(|(_, k)| *k).collect();
        let (remote, extra) = futures::join!(self.read_pages(remote_keys), self.read_pages(plan.extra.clone()));

        let installed = {
            let mut state = self.state.write();
            let mut installed: usize = 0;

            for ((id, _), payload) in plan.remote.iter().zip(remote) {
                if let Some(payload) = payload {
                    if state.pager.install_device(*id, payload) {
                        installed += 1;
                    }
                }
            }

            let ps = self.config.page_size;
            let mut offers: Vec<Option<BlockId>> = vec![None; plan.extra_start];
            for (i, (key, payload)) in plan.extra.iter().zip(extra).enumerate() {
                let Some(payload) = payload else { break };
                let page = plan.extra_start + i;
                let block = Block::new_device(
                    *key,
                    page,
                    Arc::from(&tokens[page * ps..(page + 1) * ps]),
                    payload,
                    0,
                );
                let id = state.pager.admit(block);
                state.pager.mark_durable(id);
                offers.push(Some(id));
                installed += 1;
            }
            if offers.len() > plan.extra_start {
                let outcome = state.index.insert(&tokens[..offers.len() * ps], &offers);
                if !outcome.duplicates.is_empty() {
                    warn!(duplicates = outcome.duplicates.len(), "Loaded pages already backed by other blocks");
                    let dropped = drop_duplicates(&mut state, &outcome.duplicates);
                    installed = installed.saturating_sub(dropped);
                }
            }
            installed
        };

        self.metrics.storage_hits.inc_by(installed as u64);
        debug!(installed, "Installed pages from storage");
    }

    async fn read_pages(&self, keys: Vec<BlockKey>) -> Vec<Option<Bytes>> {
        let Some(durability) = &self.durability else {
            return vec![None; keys.len()];
        };
        let waiters: Vec<_> = keys
            .into_iter()
            .map(|key| {
                let durability = Arc::clone(durability);
                let waiter = self.reads.join(key, move || async move {
                    match durability.fetch(key).await {
                        Ok(payload) => payload,
                        Err(e) => {
                            warn!(key = %key, error = %e, "Storage read failed");
                            None
                        }
                    }
                });
                if !waiter.is_leader() {
                    self.metrics.record_coalesced("storage");
                }
                waiter
            })
            .collect();
        join_all(waiters.into_iter().map(|w| w.wait()))
            .await
            .into_iter()
            .map(Option::flatten)
            .collect()
    }

    /// Re-match and pin the leading Device-resident pages.
    fn finalize(self: &Arc<Self>, tokens: &[TokenId], lease: &mut Lease) {
        let writebacks = {
            let mut state = self.state.write();
            let m = state.index.match_prefix(tokens);
            let mut ready = Vec::with_capacity(m.blocks.len());
            let mut payloads = Vec::with_capacity(m.blocks.len());
            for &id in &m.blocks {
                match state.pager.block(id).and_then(|b| b.device_payload().cloned()) {
                    Some(payload) => {
                        ready.push(id);
                        payloads.push(payload);
                    }
                    None => break,
                }
            }
            state.pager.pin(&ready);
            state.pager.unpin(&lease.pinned);
            lease.pinned = ready;
            lease.payloads = payloads;
            lease.matched_len = m.matched_len;

            let report = state.pager.enforce_capacity();
            self.apply_eviction(&mut state, report)
        };
        self.spawn_writes(writebacks);
    }

    /// Register computed pages `first_page..` of `tokens` as Device blocks.
    ///
    /// `tokens` is the whole sequence, partial tail included, so the index
    /// tracks the full path. Pages that already exist are deduplicated by
    /// key. Returns the block ids of the admitted pages.
    pub fn admit_pages(
        self: &Arc<Self>,
        tokens: &[TokenId],
        first_page: usize,
        payloads: Vec<Bytes>,
    ) -> Vec<BlockId> {
        let ps = self.config.page_size;
        let keys = page_keys(tokens, ps);
        let last = (first_page + payloads.len()).min(keys.len());

        let (admitted, writes, writebacks) = {
            let mut state = self.state.write();
            let mut offers: Vec<Option<BlockId>> = keys[..first_page.min(keys.len())]
                .iter()
                .map(|k| state.pager.id_for_key(*k))
                .collect();

            let mut admitted = Vec::with_capacity(last.saturating_sub(first_page));
            for (page, payload) in (first_page..last).zip(payloads) {
                let block = Block::new_device(
                    keys[page],
                    page,
                    Arc::from(&tokens[page * ps..(page + 1) * ps]),
                    payload,
                    0,
                );
                let id = state.pager.admit(block);
                admitted.push(id);
                offers.push(Some(id));
            }

            let outcome = state.index.insert(tokens, &offers);
            if !outcome.duplicates.is_empty() {
                warn!(duplicates = outcome.duplicates.len(), "Pages already backed by other blocks");
                drop_duplicates(&mut state, &outcome.duplicates);
                let backing = state.index.match_prefix(tokens).blocks;
                for (page, id) in (first_page..).zip(admitted.iter_mut()) {
                    if let Some(&existing) = backing.get(page) {
                        *id = existing;
                    }
                }
            }

            let writes = match (&self.durability, self.config.write_policy) {
                (Some(_), WritePolicy::WriteThrough) => state.pager.dirty_snapshot(&admitted),
                _ => Vec::new(),
            };

            let report = state.pager.enforce_capacity();
            let writebacks = self.apply_eviction(&mut state, report);
            (admitted, writes, writebacks)
        };

        self.spawn_writes(writes);
        self.spawn_writes(writebacks);
        admitted
    }

    /// Clear index associations of discarded blocks and publish the round.
    fn apply_eviction(&self, state: &mut CacheState, report: EvictionReport) -> Vec<PendingWrite> {
        for id in &report.discarded {
            state.index.clear_block(*id);
        }
        self.metrics
            .record_evictions(Tier::Device, report.evicted_from(Tier::Device));
        self.metrics
            .record_evictions(Tier::Host, report.evicted_from(Tier::Host));
        self.metrics.set_tier_stats(&state.pager.tier_stats());
        report.writeback
    }

    fn spawn_writes(self: &Arc<Self>, writes: Vec<PendingWrite>) {
        let Some(durability) = &self.durability else {
            return;
        };
        for write in writes {
            self.pending_writes.fetch_add(1, Ordering::SeqCst);
            let durability = Arc::clone(durability);
            let space = Arc::clone(self);
            tokio::spawn(async move {
                let result = durability.persist(write.key, write.payload).await;
                space.finish_write(write.block_id, result);
            });
        }
    }

    fn finish_write(&self, id: BlockId, result: Result<(), StorageError>) {
        {
            let mut state = self.state.write();
            match result {
                Ok(()) => {
                    state.pager.mark_durable(id);
                    self.metrics.durable_writes.inc();
                }
                Err(e) => {
                    self.metrics.durable_write_failures.inc();
                    warn!(block_id = id, error = %e, "Block stays dirty after failed durable write");
                    if state.pager.abandon_writeback(id) {
                        state.index.clear_block(id);
                    }
                }
            }
        }
        if self.pending_writes.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.writes_idle.notify_waiters();
        }
    }

    /// Wait until every background durable write has finished.
    pub async fn drain(&self) {
        loop {
            let idle = self.writes_idle.notified();
            if self.pending_writes.load(Ordering::SeqCst) == 0 {
                return;
            }
            idle.await;
        }
    }

    /// Make every dirty block reachable from the index durable.
    ///
    /// Works on a snapshot taken at entry: blocks admitted afterwards are not
    /// waited for. Returns the number of blocks written.
    pub async fn flush(&self) -> Result<usize, FlushError> {
        let Some(durability) = &self.durability else {
            return Ok(0);
        };

        let writes = {
            let state = self.state.read();
            state.pager.dirty_snapshot(&state.index.reachable_blocks())
        };
        let attempted = writes.len();
        let outcome = durability.persist_all(writes).await;

        {
            let mut state = self.state.write();
            for id in &outcome.written {
                state.pager.mark_durable(*id);
            }
            self.metrics.set_tier_stats(&state.pager.tier_stats());
        }
        self.metrics.durable_writes.inc_by(outcome.written.len() as u64);

        if outcome.failed.is_empty() {
            info!(written = outcome.written.len(), "Flush complete");
            return Ok(outcome.written.len());
        }
        self.metrics
            .durable_write_failures
            .inc_by(outcome.failed.len() as u64);
        for (id, error) in &outcome.failed {
            warn!(block_id = id, error = %error, "Flush could not persist block");
        }
        Err(FlushError::Incomplete {
            failed: outcome.failed.len(),
            attempted,
        })
    }

    /// Drop in-memory copies of every unpinned durable block.
    pub fn release_memory(&self) -> usize {
        let mut state = self.state.write();
        let released = state.pager.release_memory();
        self.metrics.set_tier_stats(&state.pager.tier_stats());
        released
    }

    /// Validate the index, invalidating every subtree that violates an
    /// invariant. Returns the number of subtrees dropped.
    pub fn validate_or_rebuild(&self) -> usize {
        let mut state = self.state.write();
        self.rebuild_locked(&mut state)
    }

    fn rebuild_locked(&self, state: &mut CacheState) -> usize {
        let mut dropped = 0;
        while let Err(e) = state.index.validate() {
            warn!(error = %e, node = e.node(), "Index inconsistency, invalidating subtree");
            for id in state.index.invalidate_subtree(e.node()) {
                if state.pager.block(id).is_some_and(|b| b.ref_count == 0) {
                    state.pager.remove_block(id);
                }
            }
            dropped += 1;
        }
        dropped
    }

    pub fn stats(&self) -> SpaceStats {
        let state = self.state.read();
        let tiers = state
            .pager
            .tier_stats()
            .into_iter()
            .map(|(tier, stats)| TierSummary {
                tier,
                utilization: stats.usage_fraction(),
                stats,
            })
            .collect();
        SpaceStats {
            page_size: self.config.page_size,
            hierarchical: self.config.hierarchical,
            tiers,
            blocks: state.pager.total_blocks(),
            radix_nodes: state.index.node_count(),
            indexed_tokens: state.index.total_tokens(),
            pending_writes: self.pending_writes.load(Ordering::SeqCst),
            backend: self.durability.as_ref().map(|d| d.backend_name()),
        }
    }

    /// Reference count of a block, if it exists.
    pub fn ref_count(&self, id: BlockId) -> Option<usize> {
        self.state.read().pager.block(id).map(|b| b.ref_count)
    }

    #[cfg(test)]
    pub(crate) fn corrupt_index_for_test(&self, block: BlockId) -> bool {
        self.state.write().index.corrupt_depth_for_test(block).is_some()
    }
}

/// Remove offered blocks the index rejected because their page already has a
/// block. Returns how many were removed.
fn drop_duplicates(state: &mut CacheState, duplicates: &[BlockId]) -> usize {
    let mut dropped = 0;
    for &id in duplicates {
        let unused = state.pager.block(id).is_some_and(|b| b.ref_count == 0);
        if unused && !state.index.is_attached(id) && state.pager.remove_block(id).is_some() {
            debug!(block_id = id, "Dropped duplicate block");
            dropped += 1;
        }
    }
    dropped
}

/// Pins on the compute-ready prefix of one request.
#[derive(Debug)]
pub struct Lease {
    space: Arc<CacheSpace>,
    pinned: Vec<BlockId>,
    matched_len: usize,
    payloads: Vec<Bytes>,
}

impl Lease {
    /// Whole pages on Device, in order.
    pub fn ready_pages(&self) -> usize {
        self.pinned.len()
    }

    pub fn blocks(&self) -> &[BlockId] {
        &self.pinned
    }

    /// Device payloads of the ready pages.
    pub fn payloads(&self) -> &[Bytes] {
        &self.payloads
    }

    /// Longest matched prefix, possibly mid-page.
    pub fn matched_len(&self) -> usize {
        self.matched_len
    }

    pub fn cached_tokens(&self) -> usize {
        accounting::cached_tokens(self.pinned.len(), self.space.page_size(), self.matched_len)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.pinned.is_empty() {
            self.space.state.write().pager.unpin(&self.pinned);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use async_trait::async_trait;

    use super::*;
    use crate::storage::{MemoryBackend, StorageBackend};

    const PS: usize = 4;

    fn payload(page: usize) -> Bytes {
        Bytes::from(vec![page as u8 + 1; 8])
    }

    fn pages(tokens: &[TokenId]) -> Vec<Bytes> {
        (0..tokens.len() / PS).map(payload).collect()
    }

    fn space(config: CacheConfig, backend: Option<SharedBackend>) -> Arc<CacheSpace> {
        Arc::new(CacheSpace::new(config, backend, CacheMetrics::new().unwrap()))
    }

    /// Memory backend whose reads take `read_delay`.
    #[derive(Debug, Default)]
    struct SlowBackend {
        inner: MemoryBackend,
        read_delay: Duration,
    }

    #[async_trait]
    impl StorageBackend for SlowBackend {
        fn name(&self) -> &'static str {
            "slow"
        }

        async fn get(&self, key: BlockKey) -> Result<Option<Bytes>, StorageError> {
            tokio::time::sleep(self.read_delay).await;
            self.inner.get(key).await
        }

        async fn put(&self, key: BlockKey, payload: Bytes) -> Result<(), StorageError> {
            self.inner.put(key, payload).await
        }

        async fn exists(&self, key: BlockKey) -> Result<bool, StorageError> {
            self.inner.exists(key).await
        }
    }

    async fn persisted_backend(tokens: &[TokenId], read_delay: Duration) -> Arc<SlowBackend> {
        let backend = Arc::new(SlowBackend {
            inner: MemoryBackend::new(),
            read_delay,
        });
        let writer = space(CacheConfig::hierarchical(PS, 1 << 20, 1 << 21), Some(backend.clone()));
        writer.admit_pages(tokens, 0, pages(tokens));
        writer.flush().await.unwrap();
        writer.drain().await;
        backend
    }

    fn reader(backend: Arc<SlowBackend>, policy: PrefetchPolicy, timeout: Duration) -> Arc<CacheSpace> {
        let mut config = CacheConfig::hierarchical(PS, 1 << 20, 1 << 21);
        config.prefetch_policy = policy;
        config.prefetch_timeout = timeout;
        space(config, Some(backend))
    }

    async fn wait_for_pages(space: &CacheSpace, tokens: &[TokenId], want: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while space.match_prefix(tokens).blocks.len() < want {
            assert!(Instant::now() < deadline, "background load never landed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn test_lookup_serves_whole_pages_only() {
        let space = space(CacheConfig::device_only(PS, 1 << 20), None);
        let tokens: Vec<TokenId> = (0..10).collect();

        let cold = space.lookup(&tokens).await;
        assert_eq!(cold.cached_tokens(), 0);
        drop(cold);

        space.admit_pages(&tokens, 0, pages(&tokens));
        let warm = space.lookup(&tokens).await;
        assert_eq!(warm.matched_len(), 10);
        assert_eq!(warm.ready_pages(), 2);
        assert_eq!(warm.cached_tokens(), 8);
        assert_eq!(warm.payloads()[1], payload(1));
    }

    #[tokio::test]
    async fn test_lease_pins_until_dropped() {
        let space = space(CacheConfig::device_only(PS, 1 << 20), None);
        let tokens: Vec<TokenId> = (0..8).collect();
        let ids = space.admit_pages(&tokens, 0, pages(&tokens));

        let a = space.lookup(&tokens).await;
        let b = space.lookup(&tokens).await;
        assert_eq!(space.ref_count(ids[0]), Some(2));
        drop(a);
        assert_eq!(space.ref_count(ids[0]), Some(1));
        drop(b);
        assert_eq!(space.ref_count(ids[0]), Some(0));
    }

    #[tokio::test]
    async fn test_host_blocks_are_promoted() {
        // Room for two 8-byte pages on Device.
        let space = space(CacheConfig::hierarchical(PS, 16, 1024), None);
        let first: Vec<TokenId> = (0..8).collect();
        let second: Vec<TokenId> = (100..108).collect();
        space.admit_pages(&first, 0, pages(&first));
        space.admit_pages(&second, 0, pages(&second));

        let m = space.match_prefix(&first);
        assert!(m.blocks.iter().all(|(_, tier)| *tier == Some(Tier::Host)));

        let lease = space.lookup(&first).await;
        assert_eq!(lease.cached_tokens(), 8);
        assert_eq!(lease.payloads(), &pages(&first)[..]);
    }

    #[tokio::test]
    async fn test_single_tier_eviction_clears_association() {
        let space = space(CacheConfig::device_only(PS, 16), None);
        let first: Vec<TokenId> = (0..8).collect();
        let second: Vec<TokenId> = (100..108).collect();
        space.admit_pages(&first, 0, pages(&first));
        space.admit_pages(&second, 0, pages(&second));

        let m = space.match_prefix(&first);
        assert_eq!(m.matched_len, 8);
        assert!(m.blocks.is_empty());
        assert_eq!(space.lookup(&first).await.cached_tokens(), 0);
    }

    #[tokio::test]
    async fn test_flush_then_reload_from_storage() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = CacheConfig::hierarchical(PS, 1 << 20, 1 << 21);
        config.write_policy = WritePolicy::WriteBack;
        let space = space(config, Some(backend.clone()));
        let tokens: Vec<TokenId> = (0..13).collect();
        space.admit_pages(&tokens, 0, pages(&tokens));
        assert!(backend.is_empty());

        assert_eq!(space.flush().await.unwrap(), 3);
        assert_eq!(backend.len(), 3);
        assert_eq!(space.flush().await.unwrap(), 0);

        assert_eq!(space.release_memory(), 3);
        let m = space.match_prefix(&tokens);
        assert!(m.blocks.iter().all(|(_, tier)| *tier == Some(Tier::Remote)));

        let lease = space.lookup(&tokens).await;
        assert_eq!(lease.ready_pages(), 3);
        assert_eq!(lease.payloads(), &pages(&tokens)[..]);
    }

    #[tokio::test]
    async fn test_storage_prefetch_fills_fresh_space() {
        let backend: Arc<MemoryBackend> = Arc::new(MemoryBackend::new());
        let tokens: Vec<TokenId> = (0..16).collect();

        let writer = space(CacheConfig::hierarchical(PS, 1 << 20, 1 << 21), Some(backend.clone()));
        writer.admit_pages(&tokens, 0, pages(&tokens));
        writer.flush().await.unwrap();

        let reader = space(CacheConfig::hierarchical(PS, 1 << 20, 1 << 21), Some(backend.clone()));
        let lease = reader.lookup(&tokens[..15]).await;
        assert_eq!(lease.ready_pages(), 3);
        assert_eq!(lease.payloads()[2], payload(2));
    }

    #[tokio::test]
    async fn test_best_effort_serves_ready_pages_and_loads_in_background() {
        let tokens: Vec<TokenId> = (0..16).collect();
        let backend = persisted_backend(&tokens, Duration::ZERO).await;
        let reader = reader(backend, PrefetchPolicy::BestEffort, Duration::from_secs(2));

        let first = reader.lookup(&tokens[..15]).await;
        assert_eq!(first.ready_pages(), 0);
        assert_eq!(first.cached_tokens(), 0);
        drop(first);

        wait_for_pages(&reader, &tokens[..15], 3).await;
        let second = reader.lookup(&tokens[..15]).await;
        assert_eq!(second.ready_pages(), 3);
        assert_eq!(second.payloads()[2], payload(2));
    }

    #[tokio::test]
    async fn test_timeout_waits_for_fast_loads() {
        let tokens: Vec<TokenId> = (0..16).collect();
        let backend = persisted_backend(&tokens, Duration::ZERO).await;
        let reader = reader(backend, PrefetchPolicy::Timeout, Duration::from_secs(2));

        let lease = reader.lookup(&tokens[..15]).await;
        assert_eq!(lease.ready_pages(), 3);
    }

    #[tokio::test]
    async fn test_timeout_gives_up_on_slow_loads() {
        let tokens: Vec<TokenId> = (0..16).collect();
        let backend = persisted_backend(&tokens, Duration::from_millis(400)).await;
        let reader = reader(backend, PrefetchPolicy::Timeout, Duration::from_millis(20));

        let started = Instant::now();
        let lease = reader.lookup(&tokens[..15]).await;
        assert!(started.elapsed() < Duration::from_millis(300));
        assert_eq!(lease.ready_pages(), 0);
        drop(lease);

        // The load keeps running after the request moved on.
        wait_for_pages(&reader, &tokens[..15], 3).await;
        assert_eq!(reader.lookup(&tokens[..15]).await.ready_pages(), 3);
    }

    #[tokio::test]
    async fn test_duplicate_pages_do_not_leak_blocks() {
        let space = space(CacheConfig::device_only(PS, 1 << 20), None);
        let other: Vec<TokenId> = (100..104).collect();
        let existing = space.admit_pages(&other, 0, pages(&other))[0];

        // Page 0 of `tokens` is already backed by a block under another key.
        let tokens: Vec<TokenId> = (0..8).collect();
        {
            let mut state = space.state.write();
            state.index.clear_block(existing);
            state.index.insert(&tokens[..PS], &[Some(existing)]);
        }

        let admitted = space.admit_pages(&tokens, 0, pages(&tokens));
        assert_eq!(admitted[0], existing);
        let matched: Vec<BlockId> = space.match_prefix(&tokens).blocks.iter().map(|(id, _)| *id).collect();
        assert_eq!(matched, admitted);

        let stats = space.stats();
        assert_eq!(stats.blocks, 2);
        let device = stats.tiers.iter().find(|t| t.tier == Tier::Device).unwrap();
        assert_eq!(device.stats.bytes_used, 16);
        assert_eq!(space.validate_or_rebuild(), 0);
    }

    #[tokio::test]
    async fn test_flush_reports_failures() {
        let backend = Arc::new(MemoryBackend::new());
        let mut config = CacheConfig::hierarchical(PS, 1 << 20, 1 << 21);
        config.write_policy = WritePolicy::WriteBack;
        config.durability.max_retries = 0;
        let space = space(config, Some(backend.clone()));
        let tokens: Vec<TokenId> = (0..8).collect();
        space.admit_pages(&tokens, 0, pages(&tokens));

        backend.fail_next_puts(1);
        let err = space.flush().await.unwrap_err();
        assert_eq!(err, FlushError::Incomplete { failed: 1, attempted: 2 });

        // The failed block stayed dirty and the next flush picks it up.
        assert_eq!(space.flush().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_write_through_persists_on_admit() {
        let backend = Arc::new(MemoryBackend::new());
        let space = space(CacheConfig::hierarchical(PS, 1 << 20, 1 << 21), Some(backend.clone()));
        let tokens: Vec<TokenId> = (0..8).collect();
        space.admit_pages(&tokens, 0, pages(&tokens));

        space.drain().await;
        assert_eq!(backend.len(), 2);
        assert_eq!(space.flush().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rebuild_drops_corrupt_subtree() {
        let space = space(CacheConfig::device_only(PS, 1 << 20), None);
        let tokens: Vec<TokenId> = (0..8).collect();
        let ids = space.admit_pages(&tokens, 0, pages(&tokens));

        assert!(space.corrupt_index_for_test(ids[1]));
        assert!(space.validate_or_rebuild() > 0);
        assert_eq!(space.validate_or_rebuild(), 0);
        assert!(space.ref_count(ids[1]).is_none());
    }
}

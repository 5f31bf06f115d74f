//! Tier manager (pager): orchestrates block movement between tiers.
//!
//! The pager owns the block store and is the only place tier capacity counters
//! change. It:
//! - Admits freshly computed blocks into the Device tier
//! - Pins blocks for in-flight requests (pinned blocks are never evicted)
//! - Promotes Host/Remote blocks back to Device
//! - Demotes or discards least-recently-used blocks when a tier is over budget
//! - Maintains per-tier usage accounting

use std::collections::HashMap;

use bytes::Bytes;
use serde::Serialize;
use tracing::{debug, info};

use crate::cache::block::{Block, BlockId, BlockKey, BlockStore, Tier};
use crate::cache::evictor::Evictor;

/// Per-tier usage statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TierStats {
    /// Number of blocks with a copy in this tier.
    pub block_count: usize,
    /// Total bytes used in this tier.
    pub bytes_used: usize,
    /// Capacity budget in bytes. Zero means unbounded.
    pub capacity: usize,
}

impl TierStats {
    /// Usage as a fraction of capacity (0.0 for unbounded tiers).
    pub fn usage_fraction(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.bytes_used as f64 / self.capacity as f64
    }

    /// Bytes above budget, or zero.
    pub fn overflow(&self) -> usize {
        if self.capacity == 0 {
            return 0;
        }
        self.bytes_used.saturating_sub(self.capacity)
    }
}

/// Capacity budgets and mode flags for a pager.
#[derive(Debug, Clone)]
pub struct PagerConfig {
    pub device_capacity: usize,
    pub host_capacity: usize,
    /// Whether the Host tier exists at all.
    pub hierarchical: bool,
    /// Whether a durable backend is configured.
    pub has_backend: bool,
    /// Fraction of capacity eviction drains down to (1.0 = just under budget).
    pub low_watermark: f64,
}

/// A dirty block handed to the durability pipeline.
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub block_id: BlockId,
    pub key: BlockKey,
    pub payload: Bytes,
}

/// What one capacity enforcement pass did.
#[derive(Debug, Default)]
pub struct EvictionReport {
    /// Device blocks moved down to Host.
    pub demoted: Vec<BlockId>,
    /// Blocks whose state is gone everywhere; their index association must be cleared.
    pub discarded: Vec<BlockId>,
    /// Host copies dropped because a faster or durable copy exists.
    pub host_dropped: Vec<BlockId>,
    /// Dirty Host blocks evicted under write-back; they must be persisted or discarded.
    pub writeback: Vec<PendingWrite>,
}

impl EvictionReport {
    pub fn is_empty(&self) -> bool {
        self.demoted.is_empty()
            && self.discarded.is_empty()
            && self.host_dropped.is_empty()
            && self.writeback.is_empty()
    }

    /// Number of blocks that left the given tier.
    pub fn evicted_from(&self, tier: Tier) -> usize {
        match tier {
            Tier::Device => self.demoted.len() + self.discarded.len(),
            Tier::Host => self.host_dropped.len() + self.writeback.len(),
            Tier::Remote => 0,
        }
    }
}

/// The central tier manager.
#[derive(Debug)]
pub struct Pager {
    store: BlockStore,
    tier_stats: HashMap<Tier, TierStats>,
    evictor: Evictor,
    config: PagerConfig,
    clock: u64,
    /// Payloads evicted under write-back whose durable write has not landed.
    writing_back: HashMap<BlockId, Bytes>,
}

impl Pager {
    pub fn new(config: PagerConfig) -> Self {
        let mut tier_stats = HashMap::new();
        tier_stats.insert(
            Tier::Device,
            TierStats {
                capacity: config.device_capacity,
                ..Default::default()
            },
        );
        if config.hierarchical {
            tier_stats.insert(
                Tier::Host,
                TierStats {
                    capacity: config.host_capacity,
                    ..Default::default()
                },
            );
        }
        if config.has_backend {
            tier_stats.insert(Tier::Remote, TierStats::default());
        }

        Self {
            store: BlockStore::new(),
            tier_stats,
            evictor: Evictor::new(),
            config,
            clock: 0,
            writing_back: HashMap::new(),
        }
    }

    /// Advance the logical clock.
    pub fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn account_add(&mut self, tier: Tier, bytes: usize) {
        if let Some(stats) = self.tier_stats.get_mut(&tier) {
            stats.block_count += 1;
            stats.bytes_used += bytes;
        }
    }

    fn account_sub(&mut self, tier: Tier, bytes: usize) {
        if let Some(stats) = self.tier_stats.get_mut(&tier) {
            stats.block_count = stats.block_count.saturating_sub(1);
            stats.bytes_used = stats.bytes_used.saturating_sub(bytes);
        }
    }

    /// Register a freshly computed Device block.
    ///
    /// If a block with the same key already exists it is kept; when it has no
    /// Device copy the new payload is installed there. Returns the ID of the
    /// block now holding that key.
    pub fn admit(&mut self, block: Block) -> BlockId {
        let now = self.tick();
        if let Some(existing) = self.store.id_for_key(block.key) {
            let needs_device = self
                .store
                .get(existing)
                .is_some_and(|b| !b.is_resident_in(Tier::Device));
            if needs_device {
                if let Some(payload) = block.device_payload().cloned() {
                    self.install_device(existing, payload);
                }
            }
            if let Some(b) = self.store.get_mut(existing) {
                b.touch(now);
            }
            return existing;
        }

        let size = block.size_bytes;
        let (id, _) = self.store.insert(block);
        if let Some(b) = self.store.get_mut(id) {
            b.touch(now);
        }
        self.account_add(Tier::Device, size);
        id
    }

    pub fn block(&self, id: BlockId) -> Option<&Block> {
        self.store.get(id)
    }

    pub fn id_for_key(&self, key: BlockKey) -> Option<BlockId> {
        self.store.id_for_key(key)
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.store.iter()
    }

    /// Increment the reference count of each block and record the access.
    pub fn pin(&mut self, ids: &[BlockId]) {
        let now = self.tick();
        for id in ids {
            if let Some(block) = self.store.get_mut(*id) {
                block.ref_count += 1;
                block.touch(now);
            }
        }
    }

    pub fn unpin(&mut self, ids: &[BlockId]) {
        for id in ids {
            if let Some(block) = self.store.get_mut(*id) {
                block.ref_count = block.ref_count.saturating_sub(1);
            }
        }
    }

    /// Copy a Host-resident block up to Device. Returns false if the block
    /// has no Host copy.
    pub fn promote_from_host(&mut self, id: BlockId) -> bool {
        let Some(block) = self.store.get_mut(id) else {
            return false;
        };
        if block.is_resident_in(Tier::Device) {
            return true;
        }
        let Some(payload) = block.host_payload().cloned() else {
            return false;
        };
        let size = payload.len();
        block.set_device(payload);
        self.account_add(Tier::Device, size);
        debug!(block_id = id, "Promoted block from host");
        true
    }

    /// Install a payload fetched from the durable backend into Device.
    pub fn install_device(&mut self, id: BlockId, payload: Bytes) -> bool {
        let Some(block) = self.store.get_mut(id) else {
            return false;
        };
        if block.is_resident_in(Tier::Device) {
            return true;
        }
        let size = payload.len();
        block.set_device(payload);
        self.account_add(Tier::Device, size);
        true
    }

    /// Confirm a durable copy of a block.
    pub fn mark_durable(&mut self, id: BlockId) {
        let Some(block) = self.store.get_mut(id) else {
            return;
        };
        if block.durable {
            return;
        }
        block.durable = true;
        self.writing_back.remove(&id);
        let size = block.size_bytes;
        self.account_add(Tier::Remote, size);
    }

    /// Give up on a failed durable write. A block whose only copy was the
    /// in-flight write-back payload is removed; returns true in that case.
    pub fn abandon_writeback(&mut self, id: BlockId) -> bool {
        let pending = self.writing_back.remove(&id).is_some();
        let lost = self
            .store
            .get(id)
            .is_some_and(|b| b.tier().is_none());
        if pending && lost {
            self.store.remove(id);
            debug!(block_id = id, "Discarded block after failed write-back");
            return true;
        }
        false
    }

    /// Snapshot of the dirty blocks among `ids` that still have a payload.
    pub fn dirty_snapshot(&self, ids: &[BlockId]) -> Vec<PendingWrite> {
        ids.iter()
            .filter_map(|id| self.store.get(*id))
            .filter(|b| b.is_dirty())
            .filter_map(|b| {
                let payload = b.payload().or_else(|| self.writing_back.get(&b.id));
                payload.map(|payload| PendingWrite {
                    block_id: b.id,
                    key: b.key,
                    payload: payload.clone(),
                })
            })
            .collect()
    }

    /// Drop a block from every tier.
    pub fn remove_block(&mut self, id: BlockId) -> Option<Block> {
        let mut block = self.store.remove(id)?;
        self.writing_back.remove(&id);
        if let Some(p) = block.take_device() {
            self.account_sub(Tier::Device, p.len());
        }
        if let Some(p) = block.take_host() {
            self.account_sub(Tier::Host, p.len());
        }
        if block.durable {
            self.account_sub(Tier::Remote, block.size_bytes);
        }
        Some(block)
    }

    fn bytes_to_free(&self, tier: Tier) -> usize {
        let Some(stats) = self.tier_stats.get(&tier) else {
            return 0;
        };
        if stats.overflow() == 0 {
            return 0;
        }
        let target = (self.config.low_watermark * stats.capacity as f64) as usize;
        stats.bytes_used.saturating_sub(target.min(stats.capacity))
    }

    /// Bring every tier back under budget.
    ///
    /// Device overflow demotes to Host (or discards in single-tier mode).
    /// Host overflow then drops copies that exist elsewhere, and writes back or
    /// discards dirty ones. Blocks with a non-zero reference count never move.
    pub fn enforce_capacity(&mut self) -> EvictionReport {
        let mut report = EvictionReport::default();

        let need = self.bytes_to_free(Tier::Device);
        if need > 0 {
            let victims = self
                .evictor
                .select_victims(self.store.iter(), Tier::Device, need);
            for victim in victims {
                self.evict_device(victim.block_id, &mut report);
            }
        }

        let need = self.bytes_to_free(Tier::Host);
        if need > 0 {
            let victims = self
                .evictor
                .select_victims(self.store.iter(), Tier::Host, need);
            for victim in victims {
                self.evict_host(victim.block_id, &mut report);
            }
        }

        if !report.is_empty() {
            info!(
                demoted = report.demoted.len(),
                discarded = report.discarded.len(),
                host_dropped = report.host_dropped.len(),
                writeback = report.writeback.len(),
                "Eviction round complete"
            );
        }
        report
    }

    fn evict_device(&mut self, id: BlockId, report: &mut EvictionReport) {
        let hierarchical = self.config.hierarchical;
        let Some(block) = self.store.get_mut(id) else {
            return;
        };
        let Some(payload) = block.take_device() else {
            return;
        };
        let size = payload.len();
        let on_host = block.is_resident_in(Tier::Host);
        let durable = block.durable;

        if hierarchical && !on_host {
            block.set_host(payload);
            self.account_sub(Tier::Device, size);
            self.account_add(Tier::Host, size);
            report.demoted.push(id);
            debug!(block_id = id, from = %Tier::Device, to = %Tier::Host, "Evicted block");
        } else if hierarchical || durable {
            // A slower copy already exists.
            self.account_sub(Tier::Device, size);
            report.demoted.push(id);
        } else {
            self.account_sub(Tier::Device, size);
            self.store.remove(id);
            report.discarded.push(id);
            debug!(block_id = id, "Discarded block");
        }
    }

    fn evict_host(&mut self, id: BlockId, report: &mut EvictionReport) {
        let has_backend = self.config.has_backend;
        let Some(block) = self.store.get_mut(id) else {
            return;
        };
        let keep_elsewhere = block.durable || block.is_resident_in(Tier::Device);
        let key = block.key;
        let Some(payload) = block.take_host() else {
            return;
        };
        let size = payload.len();
        self.account_sub(Tier::Host, size);

        if keep_elsewhere {
            report.host_dropped.push(id);
        } else if has_backend {
            self.writing_back.insert(id, payload.clone());
            report.writeback.push(PendingWrite {
                block_id: id,
                key,
                payload,
            });
        } else {
            self.store.remove(id);
            report.discarded.push(id);
        }
    }

    /// Drop the in-memory copies of every unpinned durable block, leaving
    /// them resident only in the Remote tier. Returns how many moved.
    pub fn release_memory(&mut self) -> usize {
        let ids: Vec<BlockId> = self
            .store
            .iter()
            .filter(|b| b.durable && b.ref_count == 0 && b.payload().is_some())
            .map(|b| b.id)
            .collect();

        for &id in &ids {
            let Some(block) = self.store.get_mut(id) else {
                continue;
            };
            let device = block.take_device();
            let host = block.take_host();
            if let Some(p) = device {
                self.account_sub(Tier::Device, p.len());
            }
            if let Some(p) = host {
                self.account_sub(Tier::Host, p.len());
            }
        }
        ids.len()
    }

    /// Get tier statistics for monitoring.
    pub fn tier_stats(&self) -> Vec<(Tier, TierStats)> {
        Tier::ALL
            .iter()
            .filter_map(|t| self.tier_stats.get(t).map(|s| (*t, s.clone())))
            .collect()
    }

    pub fn stats_for(&self, tier: Tier) -> Option<&TierStats> {
        self.tier_stats.get(&tier)
    }

    /// Total number of blocks across all tiers.
    pub fn total_blocks(&self) -> usize {
        self.store.len()
    }
}

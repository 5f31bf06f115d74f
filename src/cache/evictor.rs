//! Eviction policy: decides which blocks leave a tier first.
//!
//! Least-recently-used among blocks that no in-flight request references.
//! Recency is a logical clock so ordering is exact even when many accesses
//! land within the same instant; ties break on block ID (older first).

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use crate::cache::block::{Block, BlockId, Tier};

/// An eviction candidate. Higher priority (older access) pops first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionCandidate {
    pub block_id: BlockId,
    pub last_access: u64,
    pub size_bytes: usize,
}

impl EvictionCandidate {
    fn priority(&self) -> Reverse<(u64, BlockId)> {
        Reverse((self.last_access, self.block_id))
    }
}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.priority().cmp(&other.priority())
    }
}

/// The eviction policy engine.
#[derive(Debug, Default, Clone)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Whether `block` may be evicted from `tier` at all.
    pub fn is_evictable(block: &Block, tier: Tier) -> bool {
        block.ref_count == 0 && block.is_resident_in(tier)
    }

    /// Select blocks to evict from `tier` until at least `bytes_needed` bytes
    /// are freed or candidates run out. Returned oldest first.
    ///
    /// Referenced blocks are never selected.
    pub fn select_victims<'a>(
        &self,
        blocks: impl Iterator<Item = &'a Block>,
        tier: Tier,
        bytes_needed: usize,
    ) -> Vec<EvictionCandidate> {
        let mut heap: BinaryHeap<EvictionCandidate> = blocks
            .filter(|b| Self::is_evictable(b, tier))
            .map(|b| EvictionCandidate {
                block_id: b.id,
                last_access: b.last_access,
                size_bytes: b.size_bytes,
            })
            .collect();

        let mut victims = Vec::new();
        let mut freed = 0;
        while freed < bytes_needed {
            let Some(candidate) = heap.pop() else {
                break;
            };
            freed += candidate.size_bytes;
            victims.push(candidate);
        }
        victims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::block::BlockKey;
    use bytes::Bytes;
    use std::sync::Arc;

    fn make_block(key: u64, last_access: u64, ref_count: usize) -> Block {
        let mut block = Block::new_device(
            BlockKey(key),
            0,
            Arc::from(vec![0u32; 4]),
            Bytes::from(vec![0u8; 100]),
            last_access,
        );
        block.ref_count = ref_count;
        block
    }

    #[test]
    fn test_eviction_prefers_least_recent() {
        let blocks = vec![make_block(1, 30, 0), make_block(2, 10, 0), make_block(3, 20, 0)];

        let victims = Evictor::new().select_victims(blocks.iter(), Tier::Device, 150);
        let order: Vec<u64> = victims.iter().map(|v| v.last_access).collect();
        assert_eq!(order, vec![10, 20]);
    }

    #[test]
    fn test_referenced_blocks_never_selected() {
        let blocks = vec![make_block(1, 1, 2), make_block(2, 50, 0)];

        let victims = Evictor::new().select_victims(blocks.iter(), Tier::Device, usize::MAX);
        assert_eq!(victims.len(), 1);
        assert_eq!(victims[0].block_id, blocks[1].id);
    }

    #[test]
    fn test_non_resident_excluded() {
        let blocks = vec![make_block(1, 1, 0), make_block(2, 2, 0)];

        let host = Evictor::new().select_victims(blocks.iter(), Tier::Host, usize::MAX);
        assert!(host.is_empty());

        let none = Evictor::new().select_victims(blocks.iter(), Tier::Device, 0);
        assert!(none.is_empty());
    }
}

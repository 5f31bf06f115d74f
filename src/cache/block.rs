//! Block types and the block store.
//!
//! A block is one page of cached attention state: exactly `page_size`
//! consecutive tokens of some prefix, plus an opaque payload. Blocks are the
//! unit of movement between tiers and are immutable once created.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Token ID type.
pub type TokenId = u32;

/// Identifies a storage tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Tier 0: accelerator memory, the only tier compute can read.
    Device,
    /// Tier 1: host RAM.
    Host,
    /// Tier 2: durable storage backend (file or object store).
    Remote,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Device, Tier::Host, Tier::Remote];
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Device => write!(f, "device"),
            Tier::Host => write!(f, "host"),
            Tier::Remote => write!(f, "remote"),
        }
    }
}

/// Unique identifier for a block within one cache space.
pub type BlockId = u64;

/// Global monotonic block ID counter.
static NEXT_BLOCK_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a new unique block ID.
pub fn new_block_id() -> BlockId {
    NEXT_BLOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// Content key of a page.
///
/// Chained over the whole prefix: the key of page `i` is a hash of the key of
/// page `i - 1` and the tokens of page `i`. Two nodes that cache the same
/// prefix therefore agree on every key, which is what the durable backend and
/// the peer transfer protocol address pages by.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockKey(pub u64);

impl BlockKey {
    /// Key of a page given its parent page's key (None for page 0).
    pub fn chain(parent: Option<BlockKey>, page_tokens: &[TokenId]) -> Self {
        let mut hasher = DefaultHasher::new();
        parent.map(|p| p.0).unwrap_or(0).hash(&mut hasher);
        page_tokens.hash(&mut hasher);
        BlockKey(hasher.finish())
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl std::fmt::Display for BlockKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Chained keys for every full page of `tokens`. A trailing partial page has no key.
pub fn page_keys(tokens: &[TokenId], page_size: usize) -> Vec<BlockKey> {
    let mut keys = Vec::with_capacity(tokens.len() / page_size.max(1));
    let mut parent = None;
    for page in tokens.chunks_exact(page_size) {
        let key = BlockKey::chain(parent, page);
        keys.push(key);
        parent = Some(key);
    }
    keys
}

/// A single cached page.
#[derive(Debug)]
pub struct Block {
    /// Unique identifier for this block.
    pub id: BlockId,

    /// Chained content key.
    pub key: BlockKey,

    /// Index of this page within its prefix.
    pub page_index: usize,

    /// Tokens covered by this page.
    pub token_ids: Arc<[TokenId]>,

    /// Payload size in bytes.
    pub size_bytes: usize,

    /// Number of in-flight requests depending on this block.
    pub ref_count: usize,

    /// Logical clock value of the last access.
    pub last_access: u64,

    /// Whether a durable copy is confirmed in the storage backend.
    pub durable: bool,

    device: Option<Bytes>,
    host: Option<Bytes>,
}

impl Block {
    /// Create a freshly computed block resident on Device.
    pub fn new_device(
        key: BlockKey,
        page_index: usize,
        token_ids: Arc<[TokenId]>,
        payload: Bytes,
        now: u64,
    ) -> Self {
        Self {
            id: new_block_id(),
            key,
            page_index,
            token_ids,
            size_bytes: payload.len(),
            ref_count: 0,
            last_access: now,
            durable: false,
            device: Some(payload),
            host: None,
        }
    }

    /// Record an access.
    pub fn touch(&mut self, now: u64) {
        self.last_access = self.last_access.max(now);
    }

    /// The fastest tier currently holding this block, or None if the block's
    /// state is gone everywhere.
    pub fn tier(&self) -> Option<Tier> {
        if self.device.is_some() {
            Some(Tier::Device)
        } else if self.host.is_some() {
            Some(Tier::Host)
        } else if self.durable {
            Some(Tier::Remote)
        } else {
            None
        }
    }

    /// Whether a copy of this block lives in the given tier.
    pub fn is_resident_in(&self, tier: Tier) -> bool {
        match tier {
            Tier::Device => self.device.is_some(),
            Tier::Host => self.host.is_some(),
            Tier::Remote => self.durable,
        }
    }

    /// True until a durable copy is confirmed.
    pub fn is_dirty(&self) -> bool {
        !self.durable
    }

    /// Payload from the fastest in-memory tier.
    pub fn payload(&self) -> Option<&Bytes> {
        self.device.as_ref().or(self.host.as_ref())
    }

    pub fn device_payload(&self) -> Option<&Bytes> {
        self.device.as_ref()
    }

    pub(crate) fn set_device(&mut self, payload: Bytes) {
        self.device = Some(payload);
    }

    pub(crate) fn take_device(&mut self) -> Option<Bytes> {
        self.device.take()
    }

    pub(crate) fn set_host(&mut self, payload: Bytes) {
        self.host = Some(payload);
    }

    pub(crate) fn take_host(&mut self) -> Option<Bytes> {
        self.host.take()
    }

    pub(crate) fn host_payload(&self) -> Option<&Bytes> {
        self.host.as_ref()
    }
}

/// Owns every block of a cache space, indexed by ID and by content key.
#[derive(Debug, Default)]
pub struct BlockStore {
    blocks: HashMap<BlockId, Block>,
    by_key: HashMap<BlockKey, BlockId>,
}

impl BlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a block. If a block with the same key already exists the new
    /// one is dropped and the existing ID is returned.
    pub fn insert(&mut self, block: Block) -> (BlockId, bool) {
        if let Some(&existing) = self.by_key.get(&block.key) {
            return (existing, false);
        }
        let id = block.id;
        self.by_key.insert(block.key, id);
        self.blocks.insert(id, block);
        (id, true)
    }

    pub fn get(&self, id: BlockId) -> Option<&Block> {
        self.blocks.get(&id)
    }

    pub fn get_mut(&mut self, id: BlockId) -> Option<&mut Block> {
        self.blocks.get_mut(&id)
    }

    pub fn id_for_key(&self, key: BlockKey) -> Option<BlockId> {
        self.by_key.get(&key).copied()
    }

    pub fn remove(&mut self, id: BlockId) -> Option<Block> {
        let block = self.blocks.remove(&id)?;
        if self.by_key.get(&block.key) == Some(&id) {
            self.by_key.remove(&block.key);
        }
        Some(block)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}

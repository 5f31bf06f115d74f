//! Hierarchical prefix cache.
//!
//! - [`block`]: pages, chained content keys, tiers and the block store
//! - [`radix`]: arena radix tree mapping token sequences to block chains
//! - [`pager`]: tier manager (capacity accounting, promotion, eviction)
//! - [`evictor`]: LRU victim selection among unreferenced blocks
//! - [`durability`]: write-through / write-back replication and flush
//! - [`accounting`]: per-request cached-token statistics
//! - [`space`]: the per-node cache space tying everything together

pub mod accounting;
pub mod block;
pub mod durability;
pub mod evictor;
pub mod pager;
pub mod radix;
pub mod space;

pub use space::{CacheSpace, Lease};

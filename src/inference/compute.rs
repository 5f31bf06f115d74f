//! Compute collaborator.
//!
//! Produces the cached-state payload of each page. The synthetic backend
//! derives an fp16 payload from the page's chained key, so a page computed on
//! any node, in any run, is bit-identical.

use std::fmt::Debug;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use half::f16;

use super::EngineError;
use crate::cache::block::{page_keys, BlockKey, TokenId};

#[async_trait]
pub trait ComputeBackend: Send + Sync + Debug {
    /// Compute the payloads of `pages` (page indices) of `tokens`.
    async fn compute_pages(
        &self,
        tokens: &[TokenId],
        pages: Range<usize>,
    ) -> Result<Vec<Bytes>, EngineError>;

    /// Pages computed so far.
    fn pages_computed(&self) -> u64;
}

#[derive(Debug)]
pub struct SyntheticCompute {
    page_size: usize,
    page_bytes: usize,
    delay: Duration,
    computed: AtomicU64,
}

impl SyntheticCompute {
    pub fn new(page_size: usize, bytes_per_token: usize, delay: Duration) -> Self {
        Self {
            page_size,
            page_bytes: page_size * bytes_per_token,
            delay,
            computed: AtomicU64::new(0),
        }
    }

    pub fn page_bytes(&self) -> usize {
        self.page_bytes
    }

    /// Deterministic payload of the page with the given key.
    pub fn payload_for(&self, key: BlockKey) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.page_bytes);
        let mut state = key.0 | 1;
        for _ in 0..self.page_bytes / 2 {
            // xorshift64
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            let value = (state >> 40) as f32 / (1u64 << 24) as f32 - 0.5;
            buf.put_slice(&f16::from_f32(value).to_le_bytes());
        }
        buf.resize(self.page_bytes, 0);
        buf.freeze()
    }
}

#[async_trait]
impl ComputeBackend for SyntheticCompute {
    async fn compute_pages(
        &self,
        tokens: &[TokenId],
        pages: Range<usize>,
    ) -> Result<Vec<Bytes>, EngineError> {
        let keys = page_keys(tokens, self.page_size);
        if pages.end > keys.len() {
            return Err(EngineError::Compute(format!(
                "page {} is beyond the {} full pages of the sequence",
                pages.end,
                keys.len()
            )));
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay * pages.len() as u32).await;
        }
        self.computed.fetch_add(pages.len() as u64, Ordering::Relaxed);
        Ok(keys[pages].iter().map(|k| self.payload_for(*k)).collect())
    }

    fn pages_computed(&self) -> u64 {
        self.computed.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_payloads_are_deterministic() {
        let a = SyntheticCompute::new(4, 8, Duration::ZERO);
        let b = SyntheticCompute::new(4, 8, Duration::ZERO);
        let tokens: Vec<TokenId> = (0..9).collect();

        let pa = a.compute_pages(&tokens, 0..2).await.unwrap();
        let pb = b.compute_pages(&tokens, 1..2).await.unwrap();
        assert_eq!(pa[0].len(), 32);
        assert_eq!(pa[1], pb[0]);
        assert_ne!(pa[0], pa[1]);
        assert_eq!(a.pages_computed(), 2);
    }

    #[tokio::test]
    async fn test_partial_page_cannot_be_computed() {
        let compute = SyntheticCompute::new(4, 8, Duration::ZERO);
        let err = compute.compute_pages(&[1, 2, 3, 4, 5], 0..2).await.unwrap_err();
        assert!(matches!(err, EngineError::Compute(_)));
    }
}

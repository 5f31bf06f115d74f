//! Decode-side transfer coordinator.
//!
//! Fetches the pages of a prompt prefix from the prefill peer, coalescing
//! identical concurrent fetches, and verifies what comes back before any of
//! it reaches the local cache. Every failure is returned as a
//! [`TransferError`]; callers treat it as a local miss.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use super::codec::{FetchRequest, FetchResponse};
use super::inflight::InflightTable;
use super::peer::PeerLink;
use super::TransferError;
use crate::cache::block::{page_keys, BlockKey, TokenId};
use crate::metrics::CacheMetrics;

type FetchResult = Result<Arc<FetchResponse>, TransferError>;

/// Verified pages of a prefix.
#[derive(Debug, Clone)]
pub struct FetchedPages {
    /// Payloads for pages `0..payloads.len()`.
    pub payloads: Vec<Bytes>,
    /// The peer's own cache hit for the prefix.
    pub peer_cached_tokens: usize,
}

#[derive(Debug)]
pub struct TransferCoordinator {
    peer: Arc<dyn PeerLink>,
    page_size: usize,
    timeout: Duration,
    inflight: InflightTable<(BlockKey, usize), FetchResult>,
    metrics: CacheMetrics,
}

/// Key identifying a whole token sequence, partial tail included.
fn sequence_key(tokens: &[TokenId], page_size: usize) -> (BlockKey, usize) {
    let keys = page_keys(tokens, page_size);
    let tail = &tokens[keys.len() * page_size..];
    (BlockKey::chain(keys.last().copied(), tail), tokens.len())
}

impl TransferCoordinator {
    pub fn new(
        peer: Arc<dyn PeerLink>,
        page_size: usize,
        timeout: Duration,
        metrics: CacheMetrics,
    ) -> Self {
        Self {
            peer,
            page_size,
            timeout,
            inflight: InflightTable::new(),
            metrics,
        }
    }

    /// Fetch and verify the pages the peer holds for `tokens`.
    ///
    /// The peer resolves the whole sequence, so it also fills its own cache
    /// for it. At most `max_pages` verified pages are returned.
    pub async fn fetch_prefix(
        &self,
        tokens: &[TokenId],
        max_pages: usize,
    ) -> Result<FetchedPages, TransferError> {
        let peer = Arc::clone(&self.peer);
        let request = FetchRequest {
            token_ids: tokens.to_vec(),
            page_size: self.page_size,
        };
        let timeout = self.timeout;

        let waiter = self.inflight.join(sequence_key(tokens, self.page_size), move || async move {
            match tokio::time::timeout(timeout, peer.fetch(request)).await {
                Ok(result) => result.map(Arc::new),
                Err(_) => Err(TransferError::Timeout(timeout)),
            }
        });
        if !waiter.is_leader() {
            self.metrics.record_coalesced("transfer");
        }

        let result = waiter
            .wait()
            .await
            .unwrap_or(Err(TransferError::Aborted))
            .and_then(|response| self.verify(tokens, &response, max_pages));

        match &result {
            Ok(pages) => {
                self.metrics.transfer_pages.inc_by(pages.payloads.len() as u64);
                debug!(
                    pages = pages.payloads.len(),
                    peer_cached = pages.peer_cached_tokens,
                    "Received pages from prefill peer"
                );
            }
            Err(e) => {
                self.metrics.transfer_failures.inc();
                warn!(error = %e, "Peer fetch failed, falling back to local compute");
            }
        }
        result
    }

    /// Check page size, ordering and every chained key of a response.
    pub fn verify(
        &self,
        tokens: &[TokenId],
        response: &FetchResponse,
        max_pages: usize,
    ) -> Result<FetchedPages, TransferError> {
        if response.page_size != self.page_size {
            return Err(TransferError::PageSizeMismatch {
                local: self.page_size,
                remote: response.page_size,
            });
        }

        let keys = page_keys(tokens, self.page_size);
        let mut payloads = Vec::with_capacity(response.pages.len().min(max_pages));
        for (i, page) in response.pages.iter().enumerate().take(max_pages) {
            if page.page_index != i {
                return Err(TransferError::Malformed(format!(
                    "expected page {i}, got {}",
                    page.page_index
                )));
            }
            let expected = keys
                .get(i)
                .ok_or_else(|| TransferError::Malformed(format!("page {i} beyond the request")))?;
            if page.key != *expected {
                return Err(TransferError::KeyMismatch { page_index: i });
            }
            if page.payload.is_empty() {
                return Err(TransferError::Malformed(format!("page {i} has no payload")));
            }
            payloads.push(page.payload.clone());
        }

        // A claimed hit only counts for whole pages that arrived intact.
        let verified = payloads.len() * self.page_size;
        let whole_pages = response.cached_tokens.min(verified) / self.page_size;
        Ok(FetchedPages {
            peer_cached_tokens: whole_pages * self.page_size,
            payloads,
        })
    }
}

//! Per-request cache-hit accounting.

use serde::Serialize;

use crate::metrics::CacheMetrics;

/// Tokens served from cache: the matched length truncated to the whole pages
/// that actually reached the Device tier.
pub fn cached_tokens(ready_pages: usize, page_size: usize, matched_len: usize) -> usize {
    (ready_pages * page_size).min(matched_len)
}

/// Cache statistics of one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RequestCacheStats {
    pub prompt_tokens: usize,
    /// Hit on this node.
    pub local_cached_tokens: usize,
    /// Hit reported by the prefill peer, in disaggregated decode.
    pub peer_cached_tokens: Option<usize>,
}

impl RequestCacheStats {
    pub fn local(prompt_tokens: usize, local_cached_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            local_cached_tokens,
            peer_cached_tokens: None,
        }
    }

    /// The value surfaced in response metadata.
    pub fn cached_tokens(&self) -> usize {
        self.local_cached_tokens
            .max(self.peer_cached_tokens.unwrap_or(0))
            .min(self.prompt_tokens)
    }

    pub fn record(&self, metrics: &CacheMetrics) {
        metrics.requests.inc();
        metrics.prompt_tokens.inc_by(self.prompt_tokens as u64);
        metrics.cached_tokens.inc_by(self.cached_tokens() as u64);
    }
}

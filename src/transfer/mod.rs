//! Cross-node page transfer for disaggregated prefill/decode.
//!
//! - [`codec`]: fetch request/response messages and their binary framing
//! - [`peer`]: links to the prefill node (in-process or HTTP)
//! - [`coordinator`]: coalesced, verified fetches on the decode side
//! - [`inflight`]: shared in-flight work with waiter counting

pub mod codec;
pub mod coordinator;
pub mod inflight;
pub mod peer;

use std::time::Duration;

use thiserror::Error;

/// A failed transfer. Always downgraded to a local cache miss.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Peer unreachable: {0}")]
    Unreachable(String),

    #[error("Peer answered with status {0}")]
    PeerStatus(u16),

    #[error("Malformed payload: {0}")]
    Malformed(String),

    #[error("Page size mismatch: local {local}, peer {remote}")]
    PageSizeMismatch { local: usize, remote: usize },

    #[error("Key mismatch at page {page_index}")]
    KeyMismatch { page_index: usize },

    #[error("Peer did not answer within {0:?}")]
    Timeout(Duration),

    #[error("No prefill peer configured")]
    NoPeer,

    #[error("Transfer aborted")]
    Aborted,

    #[error("Peer failed to resolve the prefix: {0}")]
    Remote(String),
}

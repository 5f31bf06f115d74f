//! Links to a prefill peer.
//!
//! - [`LocalPeer`]: in-process, calls a [`PageSource`] directly
//! - [`HttpPeer`]: `POST /hicache/fetch` on a remote node with a binary body

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::codec::{self, FetchRequest, FetchResponse};
use super::TransferError;

/// Something that can answer fetch requests: the prefill side.
#[async_trait]
pub trait PageSource: Send + Sync {
    async fn serve_fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransferError>;
}

/// The decode side's view of its prefill peer.
#[async_trait]
pub trait PeerLink: Send + Sync + Debug {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransferError>;
}

pub struct LocalPeer {
    source: Arc<dyn PageSource>,
}

impl LocalPeer {
    pub fn new(source: Arc<dyn PageSource>) -> Self {
        Self { source }
    }
}

impl Debug for LocalPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LocalPeer")
    }
}

#[async_trait]
impl PeerLink for LocalPeer {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransferError> {
        // Round-trip through the wire format so both links behave identically.
        let request = codec::decode_request(codec::encode_request(&request))?;
        let response = self.source.serve_fetch(request).await?;
        codec::decode_response(codec::encode_response(&response))
    }
}

#[derive(Debug, Clone)]
pub struct HttpPeer {
    client: reqwest::Client,
    url: String,
}

impl HttpPeer {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            url: format!("{}/hicache/fetch", base_url.trim_end_matches('/')),
        })
    }
}

#[async_trait]
impl PeerLink for HttpPeer {
    async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransferError> {
        let body = codec::encode_request(&request);
        let response = self
            .client
            .post(&self.url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(body)
            .send()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransferError::PeerStatus(status.as_u16()));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| TransferError::Unreachable(e.to_string()))?;
        debug!(url = %self.url, size = bytes.len(), "Fetched pages from peer");
        codec::decode_response(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed;

    #[async_trait]
    impl PageSource for Fixed {
        async fn serve_fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransferError> {
            Ok(FetchResponse {
                cached_tokens: request.token_ids.len(),
                page_size: request.page_size,
                pages: vec![],
            })
        }
    }

    #[tokio::test]
    async fn test_local_peer_roundtrip() {
        let peer = LocalPeer::new(Arc::new(Fixed));
        let resp = peer
            .fetch(FetchRequest {
                token_ids: vec![1, 2, 3],
                page_size: 2,
            })
            .await
            .unwrap();
        assert_eq!(resp.cached_tokens, 3);
        assert_eq!(resp.page_size, 2);
    }

    #[tokio::test]
    async fn test_http_peer_unreachable() {
        // Port 9 (discard) is never served in test environments.
        let peer = HttpPeer::new("http://127.0.0.1:9/", Duration::from_millis(200)).unwrap();
        let err = peer
            .fetch(FetchRequest {
                token_ids: vec![1],
                page_size: 1,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Unreachable(_)));
    }
}

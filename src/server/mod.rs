//! HTTP server.
//!
//! - [`http_api`]: native routes, the peer fetch endpoint and the router
//! - [`openai_api`]: OpenAI-compatible completion routes
//! - [`streaming`]: SSE streaming for token-by-token responses

pub mod http_api;
pub mod openai_api;
pub mod streaming;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;
use tracing::{error, info};

use crate::cache::durability::FlushError;
use crate::cache::CacheSpace;
use crate::config::ResolvedConfig;
use crate::inference::compute::SyntheticCompute;
use crate::inference::engine::InferenceEngine;
use crate::inference::EngineError;
use crate::metrics::CacheMetrics;
use crate::storage::{open_backend, StorageError};
use crate::transfer::peer::HttpPeer;
use crate::transfer::TransferError;

pub use http_api::{build_router, AppState};

/// Errors surfaced to HTTP clients.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Internal(String),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Flush(#[from] FlushError),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Engine(e) if e.is_invalid_request() => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!(error = %self, "Request failed");
        }
        let body = serde_json::json!({
            "object": "error",
            "message": self.to_string(),
            "code": status.as_u16(),
        });
        (status, Json(body)).into_response()
    }
}

/// A node that could not be wired together.
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Storage backend: {0}")]
    Storage(#[from] StorageError),

    #[error("Metrics registry: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("Prefill peer: {0}")]
    Peer(#[from] TransferError),
}

/// Wire a node together from its resolved configuration.
pub async fn build_state(config: &ResolvedConfig) -> Result<Arc<AppState>, StartupError> {
    let backend = match &config.storage {
        Some(storage) => {
            let backend =
                open_backend(storage.kind, storage.root.as_deref(), storage.compression.clone())
                    .await?;
            info!(kind = ?storage.kind, root = ?storage.root, "Storage backend opened");
            Some(backend)
        }
        None => None,
    };

    let metrics = CacheMetrics::new()?;
    let space = Arc::new(CacheSpace::new(config.cache.clone(), backend, metrics));
    let compute = Arc::new(SyntheticCompute::new(
        config.engine.page_size,
        config.engine.bytes_per_token,
        config.engine.compute_delay,
    ));

    let mut engine = InferenceEngine::new(config.engine.clone(), space, compute);
    if let Some(url) = &config.prefill_url {
        let peer = HttpPeer::new(url, config.transfer_timeout)?;
        engine = engine.with_peer(Arc::new(peer), config.transfer_timeout);
        info!(prefill_url = %url, "Decode node linked to prefill peer");
    }

    Ok(Arc::new(AppState::new(
        Arc::new(engine),
        config.served_model_name.clone(),
    )))
}

/// Seconds since the Unix epoch, 0 if the clock is before it.
pub(crate) fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_requests_map_to_400() {
        let err = ApiError::from(EngineError::ContextLengthExceeded { len: 120, limit: 100 });
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);
        let err = ApiError::from(EngineError::Compute("boom".into()));
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let err = ApiError::from(FlushError::Incomplete { failed: 1, attempted: 3 });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}

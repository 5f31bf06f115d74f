//! Native HTTP API.
//!
//! - POST /generate
//! - POST /flush_cache
//! - GET  /health
//! - POST /hicache/fetch (prefill peer endpoint, binary)
//! - GET  /hicache/stats
//! - GET  /metrics

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::openai_api;
use super::streaming::generate_sse_stream;
use super::ApiError;
use crate::cache::block::TokenId;
use crate::cache::space::SpaceStats;
use crate::config::DisaggregationMode;
use crate::inference::engine::{
    FinishReason, GenerationEvent, GenerationRequest, GenerationSummary, InferenceEngine,
    PrefillService,
};
use crate::inference::sampler::SamplingParams;
use crate::transfer::codec;
use crate::transfer::peer::PageSource;
use crate::transfer::TransferError;

/// Application state shared across handlers.
pub struct AppState {
    pub engine: Arc<InferenceEngine>,
    pub prefill: PrefillService,
    pub served_model_name: String,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(engine: Arc<InferenceEngine>, served_model_name: impl Into<String>) -> Self {
        Self {
            prefill: PrefillService::new(Arc::clone(&engine)),
            engine,
            served_model_name: served_model_name.into(),
            start_time: Instant::now(),
        }
    }
}

/// Build the axum router with all routes.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/generate", post(generate))
        .route("/flush_cache", post(flush_cache))
        .route("/health", get(health))
        .route("/hicache/fetch", post(hicache_fetch))
        .route("/hicache/stats", get(hicache_stats))
        .route("/metrics", get(metrics))
        .route("/v1/completions", post(openai_api::completions))
        .route("/v1/chat/completions", post(openai_api::chat_completions))
        .route("/v1/models", get(openai_api::list_models))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ─── Request/Response Types ────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub input_ids: Option<Vec<TokenId>>,
    #[serde(default)]
    pub sampling_params: SamplingParams,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub rid: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub text: String,
    pub output_ids: Vec<TokenId>,
    pub meta_info: MetaInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MetaInfo {
    pub id: String,
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cached_tokens: usize,
    pub finish_reason: Option<FinishReason>,
}

impl MetaInfo {
    pub fn from_summary(id: String, summary: &GenerationSummary) -> Self {
        Self {
            id,
            prompt_tokens: summary.prompt_tokens,
            completion_tokens: summary.completion_tokens,
            cached_tokens: summary.cached_tokens,
            finish_reason: Some(summary.finish_reason),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub uptime_secs: u64,
    pub role: DisaggregationMode,
    pub cache: SpaceStats,
}

#[derive(Debug, Serialize)]
pub struct FlushResponse {
    pub success: bool,
    pub written: usize,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let request_id = req.rid.unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let prompt_tokens = match (req.input_ids, req.text) {
        (Some(ids), _) => ids,
        (None, Some(text)) => state.engine.tokenizer().encode(&text),
        (None, None) => {
            return Err(ApiError::BadRequest(
                "either text or input_ids must be provided".into(),
            ))
        }
    };

    info!(
        request_id = %request_id,
        prompt_tokens = prompt_tokens.len(),
        stream = req.stream,
        "Generate request"
    );

    let prompt_len = prompt_tokens.len();
    let mut rx = state.engine.generate(GenerationRequest {
        request_id: request_id.clone(),
        prompt_tokens,
        params: req.sampling_params,
    })?;

    if req.stream {
        let stream = generate_sse_stream(rx, request_id, prompt_len);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let mut text = String::new();
    let mut output_ids = Vec::new();
    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Token { token_id, text: piece } => {
                text.push_str(&piece);
                output_ids.push(token_id);
            }
            GenerationEvent::Done(summary) => {
                return Ok(Json(GenerateResponse {
                    text,
                    output_ids,
                    meta_info: MetaInfo::from_summary(request_id, &summary),
                })
                .into_response());
            }
            GenerationEvent::Error(e) => return Err(e.into()),
        }
    }
    Err(ApiError::Internal("generation ended without a result".into()))
}

async fn flush_cache(State(state): State<Arc<AppState>>) -> Result<Json<FlushResponse>, ApiError> {
    let written = state.engine.space().flush().await?;
    Ok(Json(FlushResponse {
        success: true,
        written,
    }))
}

async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        uptime_secs: state.start_time.elapsed().as_secs(),
        role: state.engine.config().role,
        cache: state.engine.space().stats(),
    })
}

async fn hicache_stats(State(state): State<Arc<AppState>>) -> Json<SpaceStats> {
    Json(state.engine.space().stats())
}

async fn hicache_fetch(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let result = match codec::decode_request(body) {
        Ok(request) => state.prefill.serve_fetch(request).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(response) => (
            [(header::CONTENT_TYPE, "application/octet-stream")],
            codec::encode_response(&response),
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Rejected peer fetch");
            let status = match e {
                TransferError::Malformed(_) | TransferError::PageSizeMismatch { .. } => {
                    StatusCode::BAD_REQUEST
                }
                TransferError::Remote(_) => StatusCode::UNPROCESSABLE_ENTITY,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            (status, e.to_string()).into_response()
        }
    }
}

async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.engine.space().metrics().encode(),
    )
}

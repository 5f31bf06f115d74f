//! OpenAI-compatible HTTP API.
//!
//! Implements the subset of the OpenAI API clients use against a cache node:
//! - POST /v1/chat/completions
//! - POST /v1/completions
//! - GET /v1/models
//!
//! `usage.prompt_tokens_details.cached_tokens` reports how much of the prompt
//! was served from cache.

use std::sync::Arc;

use axum::extract::State;
use axum::response::sse::{KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use super::http_api::AppState;
use super::streaming::openai_sse_stream;
use super::{unix_now, ApiError};
use crate::inference::engine::{FinishReason, GenerationEvent, GenerationRequest, GenerationSummary};
use crate::inference::sampler::SamplingParams;

// ─── Request/Response Types ────────────────────────────────────────────────

/// Chat completion request (OpenAI-compatible).
#[derive(Debug, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

fn default_temperature() -> f32 {
    1.0
}
fn default_top_p() -> f32 {
    1.0
}

/// Completion request (non-chat).
#[derive(Debug, Deserialize)]
pub struct CompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub prompt: String,
    #[serde(default)]
    pub max_tokens: Option<usize>,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChatChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct ChatChoice {
    pub index: usize,
    pub message: ChatMessage,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize)]
pub struct CompletionResponse {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<CompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Serialize)]
pub struct CompletionChoice {
    pub index: usize,
    pub text: String,
    pub finish_reason: &'static str,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
    pub prompt_tokens_details: PromptTokensDetails,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct PromptTokensDetails {
    pub cached_tokens: usize,
}

impl Usage {
    pub fn from_summary(summary: &GenerationSummary) -> Self {
        Self {
            prompt_tokens: summary.prompt_tokens,
            completion_tokens: summary.completion_tokens,
            total_tokens: summary.prompt_tokens + summary.completion_tokens,
            prompt_tokens_details: PromptTokensDetails {
                cached_tokens: summary.cached_tokens,
            },
        }
    }
}

pub fn finish_reason_str(reason: FinishReason) -> &'static str {
    match reason {
        FinishReason::Stop => "stop",
        FinishReason::Length => "length",
    }
}

/// Model listing response.
#[derive(Debug, Serialize)]
pub struct ModelList {
    pub object: &'static str,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Serialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub owned_by: &'static str,
}

// ─── Route Handlers ────────────────────────────────────────────────────────

fn sampling_params(
    max_tokens: Option<usize>,
    temperature: f32,
    top_p: f32,
    seed: Option<u64>,
) -> SamplingParams {
    let defaults = SamplingParams::default();
    SamplingParams {
        temperature,
        top_p,
        max_new_tokens: max_tokens.unwrap_or(defaults.max_new_tokens),
        seed,
        ..defaults
    }
}

/// Runs a request to completion, collecting its text.
async fn collect(
    state: &AppState,
    request: GenerationRequest,
) -> Result<(String, GenerationSummary), ApiError> {
    let mut rx = state.engine.generate(request)?;
    let mut text = String::new();
    while let Some(event) = rx.recv().await {
        match event {
            GenerationEvent::Token { text: piece, .. } => text.push_str(&piece),
            GenerationEvent::Done(summary) => return Ok((text, summary)),
            GenerationEvent::Error(e) => return Err(e.into()),
        }
    }
    Err(ApiError::Internal("generation ended without a result".into()))
}

pub(crate) async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ChatCompletionRequest>,
) -> Result<Response, ApiError> {
    let request_id = format!("chatcmpl-{}", Uuid::new_v4().simple());
    let model = req.model.unwrap_or_else(|| state.served_model_name.clone());

    info!(
        request_id = %request_id,
        messages = req.messages.len(),
        stream = req.stream,
        "Chat completion request"
    );

    let prompt = req
        .messages
        .iter()
        .map(|m| format!("{}: {}", m.role, m.content))
        .collect::<Vec<_>>()
        .join("\n");

    let request = GenerationRequest {
        request_id: request_id.clone(),
        prompt_tokens: state.engine.tokenizer().encode(&prompt),
        params: sampling_params(req.max_tokens, req.temperature, req.top_p, req.seed),
    };

    if req.stream {
        let rx = state.engine.generate(request)?;
        let stream = openai_sse_stream(rx, request_id, model, true);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let (text, summary) = collect(&state, request).await?;
    Ok(Json(ChatCompletionResponse {
        id: request_id,
        object: "chat.completion",
        created: unix_now(),
        model,
        choices: vec![ChatChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".to_string(),
                content: text,
            },
            finish_reason: finish_reason_str(summary.finish_reason),
        }],
        usage: Usage::from_summary(&summary),
    })
    .into_response())
}

pub(crate) async fn completions(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CompletionRequest>,
) -> Result<Response, ApiError> {
    let request_id = format!("cmpl-{}", Uuid::new_v4().simple());
    let model = req.model.unwrap_or_else(|| state.served_model_name.clone());

    info!(request_id = %request_id, stream = req.stream, "Completion request");

    let request = GenerationRequest {
        request_id: request_id.clone(),
        prompt_tokens: state.engine.tokenizer().encode(&req.prompt),
        params: sampling_params(req.max_tokens, req.temperature, req.top_p, req.seed),
    };

    if req.stream {
        let rx = state.engine.generate(request)?;
        let stream = openai_sse_stream(rx, request_id, model, false);
        return Ok(Sse::new(stream).keep_alive(KeepAlive::default()).into_response());
    }

    let (text, summary) = collect(&state, request).await?;
    Ok(Json(CompletionResponse {
        id: request_id,
        object: "text_completion",
        created: unix_now(),
        model,
        choices: vec![CompletionChoice {
            index: 0,
            text,
            finish_reason: finish_reason_str(summary.finish_reason),
        }],
        usage: Usage::from_summary(&summary),
    })
    .into_response())
}

pub(crate) async fn list_models(State(state): State<Arc<AppState>>) -> Json<ModelList> {
    Json(ModelList {
        object: "list",
        data: vec![ModelInfo {
            id: state.served_model_name.clone(),
            object: "model",
            created: 0,
            owned_by: "hicache",
        }],
    })
}

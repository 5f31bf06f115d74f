//! SSE streaming for token-by-token responses.
//!
//! Converts a channel of [`GenerationEvent`]s into an SSE stream, either in
//! the native `/generate` format (cumulative text plus `meta_info`) or as
//! OpenAI-compatible chunks. Both end with a `[DONE]` sentinel.

use std::convert::Infallible;

use axum::response::sse::Event;
use futures::stream::Stream;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_stream::StreamExt;

use super::http_api::{GenerateResponse, MetaInfo};
use super::unix_now;
use crate::cache::block::TokenId;
use crate::inference::engine::GenerationEvent;

/// Streaming completion chunk (OpenAI-compatible).
#[derive(Debug, Serialize)]
pub struct CompletionChunk {
    pub id: String,
    pub object: &'static str,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<super::openai_api::Usage>,
}

#[derive(Debug, Serialize)]
pub struct ChunkChoice {
    pub index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delta: Option<ChunkDelta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ChunkDelta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

fn json_event<T: Serialize>(value: &T) -> Result<Event, Infallible> {
    Ok(Event::default().data(serde_json::to_string(value).unwrap_or_default()))
}

fn done_sentinel() -> impl Stream<Item = Result<Event, Infallible>> {
    tokio_stream::once(Ok(Event::default().data("[DONE]")))
}

/// Native `/generate` stream: every chunk carries the text so far.
pub fn generate_sse_stream(
    rx: mpsc::Receiver<GenerationEvent>,
    request_id: String,
    prompt_tokens: usize,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut text = String::new();
    let mut output_ids: Vec<TokenId> = Vec::new();

    ReceiverStream::new(rx)
        .map(move |event| match event {
            GenerationEvent::Token { token_id, text: piece } => {
                text.push_str(&piece);
                output_ids.push(token_id);
                json_event(&GenerateResponse {
                    text: text.clone(),
                    output_ids: output_ids.clone(),
                    meta_info: MetaInfo {
                        id: request_id.clone(),
                        prompt_tokens,
                        completion_tokens: output_ids.len(),
                        cached_tokens: 0,
                        finish_reason: None,
                    },
                })
            }
            GenerationEvent::Done(summary) => json_event(&GenerateResponse {
                text: text.clone(),
                output_ids: output_ids.clone(),
                meta_info: MetaInfo::from_summary(request_id.clone(), &summary),
            }),
            GenerationEvent::Error(e) => json_event(&serde_json::json!({
                "error": { "message": e.to_string() }
            })),
        })
        .chain(done_sentinel())
}

/// OpenAI-compatible stream for `/v1/completions` and `/v1/chat/completions`.
pub fn openai_sse_stream(
    rx: mpsc::Receiver<GenerationEvent>,
    request_id: String,
    model: String,
    chat: bool,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let mut first = true;
    let object = if chat {
        "chat.completion.chunk"
    } else {
        "text_completion"
    };

    ReceiverStream::new(rx)
        .map(move |event| {
            let (content, finish_reason, usage) = match event {
                GenerationEvent::Token { text, .. } => (Some(text), None, None),
                GenerationEvent::Done(summary) => (
                    None,
                    Some(super::openai_api::finish_reason_str(summary.finish_reason).to_string()),
                    Some(super::openai_api::Usage::from_summary(&summary)),
                ),
                GenerationEvent::Error(e) => (Some(format!("[Error: {e}]")), Some("error".to_string()), None),
            };

            let choice = if chat {
                // First chunk includes the role.
                let role = std::mem::take(&mut first).then(|| "assistant".to_string());
                ChunkChoice {
                    index: 0,
                    delta: Some(ChunkDelta { role, content }),
                    text: None,
                    finish_reason,
                }
            } else {
                ChunkChoice {
                    index: 0,
                    delta: None,
                    text: Some(content.unwrap_or_default()),
                    finish_reason,
                }
            };

            json_event(&CompletionChunk {
                id: request_id.clone(),
                object,
                created: unix_now(),
                model: model.clone(),
                choices: vec![choice],
                usage,
            })
        })
        .chain(done_sentinel())
}

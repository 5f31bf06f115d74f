//! Request engine: drives one request through the cache.
//!
//! For each request the engine:
//! 1. Validates the prompt against the context and token budgets
//! 2. Resolves the cached prefix (at most `len - 1` tokens, so the last
//!    token is always computed) and pins it
//! 3. In decode mode, fetches missing pages from the prefill peer
//! 4. Computes the remaining whole pages, coalescing identical work
//! 5. Samples the output and streams it to the returned receiver
//! 6. Admits the pages produced while generating

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::compute::ComputeBackend;
use super::sampler::{Sampler, SamplingParams};
use super::tokenizer::{ByteTokenizer, EOS_TOKEN};
use super::EngineError;
use crate::cache::accounting::RequestCacheStats;
use crate::cache::block::{page_keys, BlockKey, TokenId};
use crate::cache::{CacheSpace, Lease};
use crate::config::EngineConfig;
use crate::transfer::codec::{FetchRequest, FetchResponse, PagePayload};
use crate::transfer::coordinator::TransferCoordinator;
use crate::transfer::inflight::InflightTable;
use crate::transfer::peer::{PageSource, PeerLink};
use crate::transfer::TransferError;

/// Rounds of joining other requests' compute before computing directly.
const MAX_COALESCE_ROUNDS: usize = 4;

type ComputeResult = Result<Arc<[BlockKey]>, EngineError>;

/// A generation request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub prompt_tokens: Vec<TokenId>,
    pub params: SamplingParams,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
}

#[derive(Debug, Clone, Serialize)]
pub struct GenerationSummary {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub cached_tokens: usize,
    pub finish_reason: FinishReason,
}

#[derive(Debug, Clone)]
pub enum GenerationEvent {
    Token { token_id: TokenId, text: String },
    Done(GenerationSummary),
    Error(EngineError),
}

pub struct InferenceEngine {
    config: EngineConfig,
    space: Arc<CacheSpace>,
    compute: Arc<dyn ComputeBackend>,
    tokenizer: ByteTokenizer,
    computing: InflightTable<BlockKey, ComputeResult>,
    coordinator: Option<TransferCoordinator>,
}

impl std::fmt::Debug for InferenceEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InferenceEngine")
            .field("role", &self.config.role)
            .field("page_size", &self.config.page_size)
            .field("has_peer", &self.coordinator.is_some())
            .finish_non_exhaustive()
    }
}

impl InferenceEngine {
    pub fn new(config: EngineConfig, space: Arc<CacheSpace>, compute: Arc<dyn ComputeBackend>) -> Self {
        Self {
            config,
            space,
            compute,
            tokenizer: ByteTokenizer,
            computing: InflightTable::new(),
            coordinator: None,
        }
    }

    /// Fetch missing pages from a prefill peer (decode mode).
    pub fn with_peer(mut self, peer: Arc<dyn PeerLink>, timeout: Duration) -> Self {
        self.coordinator = Some(TransferCoordinator::new(
            peer,
            self.config.page_size,
            timeout,
            self.space.metrics().clone(),
        ));
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn space(&self) -> &Arc<CacheSpace> {
        &self.space
    }

    pub fn tokenizer(&self) -> &ByteTokenizer {
        &self.tokenizer
    }

    pub fn compute(&self) -> &Arc<dyn ComputeBackend> {
        &self.compute
    }

    /// Check a prompt against the budgets; returns the number of tokens that
    /// may be generated.
    pub fn validate(&self, prompt_len: usize, max_new_tokens: usize) -> Result<usize, EngineError> {
        if prompt_len == 0 {
            return Err(EngineError::EmptyPrompt);
        }
        let limit = self.config.context_length;
        if prompt_len >= limit {
            return Err(EngineError::ContextLengthExceeded {
                len: prompt_len,
                limit,
            });
        }
        let mut budget = limit - prompt_len;
        if let Some(total) = self.config.max_total_tokens {
            if prompt_len > total {
                return Err(EngineError::TotalTokensExceeded {
                    len: prompt_len,
                    limit: total,
                });
            }
            budget = budget.min(total - prompt_len);
        }
        Ok(max_new_tokens.min(budget))
    }

    /// Make every whole page of `tokens` cached, returning the lease on the
    /// prefix that was already cached and the request's hit statistics.
    pub async fn prefill(self: &Arc<Self>, tokens: &[TokenId]) -> Result<(Lease, RequestCacheStats), EngineError> {
        if tokens.is_empty() {
            return Err(EngineError::EmptyPrompt);
        }
        let ps = self.config.page_size;
        let probe = &tokens[..tokens.len() - 1];
        let lease = self.space.lookup(probe).await;
        let mut stats = RequestCacheStats::local(tokens.len(), lease.cached_tokens());
        let mut next = lease.ready_pages();

        let wanted = probe.len() / ps;
        if let Some(coordinator) = &self.coordinator {
            if next < wanted {
                if let Ok(fetched) = coordinator.fetch_prefix(tokens, wanted).await {
                    let received = fetched.payloads.len();
                    if received > next {
                        let payloads = fetched.payloads.into_iter().skip(next).collect();
                        let admitted = self.space.admit_pages(tokens, next, payloads);
                        next += admitted.len();
                    }
                    // Only pages now held locally count as a peer hit.
                    stats.peer_cached_tokens = Some(fetched.peer_cached_tokens.min(next * ps));
                }
            }
        }

        self.compute_missing(tokens, next).await?;
        debug!(
            prompt_tokens = tokens.len(),
            cached_tokens = stats.cached_tokens(),
            "Prefill complete"
        );
        Ok((lease, stats))
    }

    /// Compute and admit pages `next..` of `tokens`.
    ///
    /// Concurrent requests needing the same novel page join one computation
    /// keyed by that page's chained key, then continue past what it covered.
    async fn compute_missing(self: &Arc<Self>, tokens: &[TokenId], mut next: usize) -> Result<(), EngineError> {
        let ps = self.config.page_size;
        let total = tokens.len() / ps;
        if next >= total {
            return Ok(());
        }
        let keys = page_keys(tokens, ps);
        let seq: Arc<[TokenId]> = Arc::from(tokens);

        for _ in 0..MAX_COALESCE_ROUNDS {
            if next >= total {
                return Ok(());
            }
            let engine = Arc::clone(self);
            let task_seq = Arc::clone(&seq);
            let start = next;
            let waiter = self.computing.join(keys[next], move || async move {
                engine.compute_and_admit(task_seq, start).await
            });
            if !waiter.is_leader() {
                self.space.metrics().record_coalesced("compute");
            }
            let done = waiter
                .wait()
                .await
                .unwrap_or_else(|| Err(EngineError::Compute("computation aborted".into())))?;
            next += keys[next..]
                .iter()
                .zip(done.iter())
                .take_while(|(want, got)| want == got)
                .count();
        }

        if next < total {
            Arc::clone(self).compute_and_admit(seq, next).await?;
        }
        Ok(())
    }

    async fn compute_and_admit(self: Arc<Self>, seq: Arc<[TokenId]>, start: usize) -> ComputeResult {
        let ps = self.config.page_size;
        let total = seq.len() / ps;
        let payloads = self.compute.compute_pages(&seq, start..total).await?;
        self.space
            .metrics()
            .computed_pages
            .inc_by(payloads.len() as u64);
        self.space.admit_pages(&seq, start, payloads);
        let keys = page_keys(&seq, ps);
        Ok(Arc::from(&keys[start..]))
    }

    /// Run a request, streaming tokens to the returned receiver.
    ///
    /// Invalid requests are rejected before anything is spawned.
    pub fn generate(
        self: &Arc<Self>,
        request: GenerationRequest,
    ) -> Result<mpsc::Receiver<GenerationEvent>, EngineError> {
        let max_new = self.validate(request.prompt_tokens.len(), request.params.max_new_tokens)?;
        let (tx, rx) = mpsc::channel(32);
        let engine = Arc::clone(self);

        tokio::spawn(async move {
            let tokens = request.prompt_tokens;
            info!(
                request_id = %request.request_id,
                prompt_tokens = tokens.len(),
                max_new_tokens = max_new,
                "Starting generation"
            );

            let (lease, stats) = match engine.prefill(&tokens).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(request_id = %request.request_id, error = %e, "Prefill failed");
                    let _ = tx.send(GenerationEvent::Error(e)).await;
                    return;
                }
            };
            stats.record(engine.space.metrics());

            let seed = request.params.seed.unwrap_or(engine.config.random_seed);
            let mut sampler = Sampler::new(&tokens, &request.params, seed);
            let mut output = Vec::with_capacity(max_new);
            let mut finish_reason = FinishReason::Length;

            for _ in 0..max_new {
                let token_id = sampler.next_token();
                if token_id == EOS_TOKEN {
                    finish_reason = FinishReason::Stop;
                    break;
                }
                output.push(token_id);
                let text = engine.tokenizer.decode_one(token_id);
                if tx.send(GenerationEvent::Token { token_id, text }).await.is_err() {
                    debug!(request_id = %request.request_id, "Receiver dropped, cancelling");
                    return;
                }
            }

            if engine.config.admit_outputs && output.len() > 1 {
                // The last sampled token has no cached state yet.
                let full = [&tokens[..], &output[..output.len() - 1]].concat();
                if let Err(e) = engine.compute_missing(&full, tokens.len() / engine.config.page_size).await {
                    warn!(request_id = %request.request_id, error = %e, "Failed to cache generated pages");
                }
            }
            drop(lease);

            let summary = GenerationSummary {
                prompt_tokens: tokens.len(),
                completion_tokens: output.len(),
                cached_tokens: stats.cached_tokens(),
                finish_reason,
            };
            info!(
                request_id = %request.request_id,
                completion_tokens = summary.completion_tokens,
                cached_tokens = summary.cached_tokens,
                "Generation complete"
            );
            let _ = tx.send(GenerationEvent::Done(summary)).await;
        });

        Ok(rx)
    }

    /// Run a request to completion.
    pub async fn generate_text(
        self: &Arc<Self>,
        request: GenerationRequest,
    ) -> Result<(Vec<TokenId>, GenerationSummary), EngineError> {
        let mut rx = self.generate(request)?;
        let mut output = Vec::new();
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Token { token_id, .. } => output.push(token_id),
                GenerationEvent::Done(summary) => return Ok((output, summary)),
                GenerationEvent::Error(e) => return Err(e),
            }
        }
        Err(EngineError::Compute("generation ended without a result".into()))
    }
}

/// The prefill side of page transfer: resolves a fetch as a local request.
#[derive(Debug, Clone)]
pub struct PrefillService {
    engine: Arc<InferenceEngine>,
}

impl PrefillService {
    pub fn new(engine: Arc<InferenceEngine>) -> Self {
        Self { engine }
    }
}

#[async_trait]
impl PageSource for PrefillService {
    async fn serve_fetch(&self, request: FetchRequest) -> Result<FetchResponse, TransferError> {
        let engine = &self.engine;
        let ps = engine.config.page_size;
        if request.page_size != ps {
            return Err(TransferError::PageSizeMismatch {
                local: ps,
                remote: request.page_size,
            });
        }
        let tokens = request.token_ids;
        engine
            .validate(tokens.len(), 0)
            .map_err(|e| TransferError::Remote(e.to_string()))?;

        let (initial, stats) = engine
            .prefill(&tokens)
            .await
            .map_err(|e| TransferError::Remote(e.to_string()))?;
        stats.record(engine.space.metrics());

        let ready = engine.space.lookup(&tokens[..tokens.len() - 1]).await;
        drop(initial);
        let keys = page_keys(&tokens, ps);
        let pages = ready
            .payloads()
            .iter()
            .zip(keys)
            .enumerate()
            .map(|(page_index, (payload, key))| PagePayload {
                page_index,
                key,
                payload: payload.clone(),
            })
            .collect::<Vec<_>>();

        debug!(pages = pages.len(), cached_tokens = stats.local_cached_tokens, "Served fetch");
        Ok(FetchResponse {
            cached_tokens: stats.local_cached_tokens,
            page_size: ps,
            pages,
        })
    }
}

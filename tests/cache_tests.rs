//! Integration tests for prefix reuse through the cache space.

use std::sync::Arc;
use std::time::Duration;

use hicache::cache::block::{TokenId, Tier};
use hicache::cache::CacheSpace;
use hicache::config::{CacheConfig, EngineConfig, PrefetchPolicy, WritePolicy};
use hicache::inference::compute::{ComputeBackend, SyntheticCompute};
use hicache::inference::engine::{GenerationRequest, InferenceEngine};
use hicache::inference::sampler::SamplingParams;
use hicache::metrics::CacheMetrics;
use hicache::storage::compressor::CompressionConfig;
use hicache::storage::file::FileBackend;
use hicache::storage::{MemoryBackend, SharedBackend};

const BYTES_PER_TOKEN: usize = 16;

fn node(config: CacheConfig, backend: Option<SharedBackend>) -> Arc<InferenceEngine> {
    let page_size = config.page_size;
    let space = Arc::new(CacheSpace::new(config, backend, CacheMetrics::new().unwrap()));
    let compute = Arc::new(SyntheticCompute::new(page_size, BYTES_PER_TOKEN, Duration::ZERO));
    Arc::new(InferenceEngine::new(EngineConfig::for_tests(page_size), space, compute))
}

fn request(tokens: Vec<TokenId>, max_new_tokens: usize) -> GenerationRequest {
    GenerationRequest {
        request_id: "cache-test".to_string(),
        prompt_tokens: tokens,
        params: SamplingParams {
            ignore_eos: true,
            ..SamplingParams::greedy(max_new_tokens)
        },
    }
}

fn text_tokens(seed: u32, len: usize) -> Vec<TokenId> {
    (0..len as u32).map(|i| 32 + (i * 7 + seed * 13) % 95).collect()
}

#[tokio::test]
async fn test_repeat_long_prompt_after_flush() {
    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let engine = node(CacheConfig::hierarchical(64, 1 << 24, 1 << 25), Some(backend));
    let prompt = text_tokens(1, 800);

    let (_, cold) = engine.generate_text(request(prompt.clone(), 8)).await.unwrap();
    assert_eq!(cold.cached_tokens, 0);

    engine.space().flush().await.unwrap();

    let (_, warm) = engine.generate_text(request(prompt, 8)).await.unwrap();
    assert!(warm.cached_tokens > 700, "cached {}", warm.cached_tokens);
}

#[tokio::test]
async fn test_growing_conversation_reuses_more_each_turn() {
    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let engine = node(CacheConfig::hierarchical(16, 1 << 24, 1 << 25), Some(backend));

    let mut context = text_tokens(2, 120);
    let mut previous = None;
    for turn in 0..4 {
        let (output, summary) = engine
            .generate_text(request(context.clone(), 24))
            .await
            .unwrap();
        engine.space().flush().await.unwrap();

        if let Some(prev) = previous {
            assert!(
                summary.cached_tokens > prev,
                "turn {turn}: {} <= {prev}",
                summary.cached_tokens
            );
        }
        previous = Some(summary.cached_tokens);

        context.extend(output);
        context.extend(text_tokens(turn + 10, 40));
    }
}

#[tokio::test]
async fn test_lookup_is_idempotent_without_admits() {
    let engine = node(CacheConfig::device_only(8, 1 << 20), None);
    let prompt = text_tokens(3, 70);
    engine.generate_text(request(prompt.clone(), 1)).await.unwrap();

    let space = engine.space();
    let first = space.match_prefix(&prompt);
    let second = space.match_prefix(&prompt);
    assert_eq!(first.matched_len, second.matched_len);
    assert_eq!(first.blocks, second.blocks);
}

#[tokio::test]
async fn test_longer_prefix_never_matches_less() {
    let engine = node(CacheConfig::device_only(8, 1 << 20), None);
    let prompt = text_tokens(4, 90);
    engine.generate_text(request(prompt.clone(), 1)).await.unwrap();

    let space = engine.space();
    let mut last = 0;
    for len in (8..=prompt.len()).step_by(8) {
        let m = space.match_prefix(&prompt[..len]);
        assert!(m.blocks.len() >= last);
        last = m.blocks.len();
    }
}

#[tokio::test]
async fn test_restarted_node_reads_durable_pages() {
    let dir = tempfile::tempdir().unwrap();
    let prompt = text_tokens(5, 300);

    let writer_backend: SharedBackend =
        Arc::new(FileBackend::new(dir.path(), CompressionConfig::default()).await.unwrap());
    let mut config = CacheConfig::hierarchical(32, 1 << 24, 1 << 25);
    config.write_policy = WritePolicy::WriteBack;
    let writer = node(config, Some(writer_backend));
    writer.generate_text(request(prompt.clone(), 1)).await.unwrap();
    assert_eq!(writer.space().flush().await.unwrap(), 9);
    drop(writer);

    let reader_backend: SharedBackend =
        Arc::new(FileBackend::new(dir.path(), CompressionConfig::default()).await.unwrap());
    let mut config = CacheConfig::hierarchical(32, 1 << 24, 1 << 25);
    config.prefetch_policy = PrefetchPolicy::WaitComplete;
    let reader = node(config, Some(reader_backend));

    let (_, summary) = reader.generate_text(request(prompt, 1)).await.unwrap();
    assert_eq!(summary.cached_tokens, 288);
    assert_eq!(reader.compute().pages_computed(), 0);
}

#[tokio::test]
async fn test_released_memory_is_served_from_storage() {
    let backend: SharedBackend = Arc::new(MemoryBackend::new());
    let engine = node(CacheConfig::hierarchical(16, 1 << 24, 1 << 25), Some(backend));
    let prompt = text_tokens(6, 100);
    engine.generate_text(request(prompt.clone(), 1)).await.unwrap();
    engine.space().flush().await.unwrap();

    engine.space().release_memory();
    let m = engine.space().match_prefix(&prompt);
    assert!(m.blocks.iter().all(|(_, tier)| *tier == Some(Tier::Remote)));

    let computed = engine.compute().pages_computed();
    let (_, summary) = engine.generate_text(request(prompt, 1)).await.unwrap();
    assert_eq!(summary.cached_tokens, 96);
    assert_eq!(engine.compute().pages_computed(), computed);
}

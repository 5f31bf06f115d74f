//! End-to-end tests against real HTTP servers on ephemeral ports.

use std::time::Duration;

use hicache::config::{Cli, Config, DisaggregationMode, StorageBackendKind};
use hicache::server::{build_router, build_state};
use serde_json::{json, Value};
use tokio::net::TcpListener;

/// Start a node and return its base URL.
async fn spawn_node(cli: Cli) -> String {
    let config = Config::default().merge_cli(&cli).resolve().unwrap();
    let state = build_state(&config).await.unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, build_router(state)).await.unwrap();
    });
    format!("http://{addr}")
}

fn small_node() -> Cli {
    Cli {
        page_size: Some(4),
        max_total_tokens: Some(4096),
        ..Default::default()
    }
}

fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(10))
        .build()
        .unwrap()
}

async fn generate(base: &str, body: Value) -> (u16, Value) {
    let resp = client()
        .post(format!("{base}/generate"))
        .json(&body)
        .send()
        .await
        .unwrap();
    let status = resp.status().as_u16();
    (status, resp.json().await.unwrap())
}

#[tokio::test]
async fn test_context_length_boundary() {
    let base = spawn_node(Cli {
        context_length: Some(100),
        max_total_tokens: Some(110),
        ..Default::default()
    })
    .await;

    let ids: Vec<u32> = (0..99).map(|i| 32 + i % 90).collect();
    let (status, body) = generate(&base, json!({ "input_ids": ids })).await;
    assert_eq!(status, 200, "{body}");
    assert_eq!(body["meta_info"]["prompt_tokens"], 99);

    let ids: Vec<u32> = (0..150).map(|i| 32 + i % 90).collect();
    let (status, body) = generate(&base, json!({ "input_ids": ids })).await;
    assert_eq!(status, 400);
    assert!(body["message"].as_str().unwrap().contains("context length"));
}

#[tokio::test]
async fn test_repeat_prompt_reports_cached_tokens() {
    let base = spawn_node(small_node()).await;
    let prompt = "The quick brown fox jumps over the lazy dog, again and again.";
    let body = json!({
        "text": prompt,
        "sampling_params": { "temperature": 0.0, "max_new_tokens": 4 }
    });

    let (status, cold) = generate(&base, body.clone()).await;
    assert_eq!(status, 200);
    assert_eq!(cold["meta_info"]["cached_tokens"], 0);

    let (_, warm) = generate(&base, body).await;
    let len = prompt.len() as u64;
    assert_eq!(warm["meta_info"]["cached_tokens"], (len - 1) / 4 * 4);
    assert_eq!(cold["text"], warm["text"]);
}

#[tokio::test]
async fn test_empty_generate_is_rejected() {
    let base = spawn_node(small_node()).await;
    let (status, _) = generate(&base, json!({})).await;
    assert_eq!(status, 400);
    let (status, _) = generate(&base, json!({ "text": "" })).await;
    assert_eq!(status, 400);
}

#[tokio::test]
async fn test_openai_usage_includes_cached_tokens() {
    let base = spawn_node(small_node()).await;
    let body = json!({
        "prompt": "Once upon a time in a land far, far away",
        "max_tokens": 3,
        "temperature": 0.0
    });

    for expected_hit in [false, true] {
        let resp: Value = client()
            .post(format!("{base}/v1/completions"))
            .json(&body)
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(resp["object"], "text_completion");
        let cached = resp["usage"]["prompt_tokens_details"]["cached_tokens"].as_u64().unwrap();
        assert_eq!(cached > 0, expected_hit);
    }

    let chat: Value = client()
        .post(format!("{base}/v1/chat/completions"))
        .json(&json!({
            "messages": [{ "role": "user", "content": "hello there" }],
            "max_tokens": 2
        }))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(chat["choices"][0]["message"]["role"], "assistant");

    let models: Value = client()
        .get(format!("{base}/v1/models"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(models["data"][0]["id"], "hicache-synthetic");
}

#[tokio::test]
async fn test_streaming_generate_ends_with_done() {
    let base = spawn_node(small_node()).await;
    let text = client()
        .post(format!("{base}/generate"))
        .json(&json!({
            "text": "stream me",
            "stream": true,
            "sampling_params": { "max_new_tokens": 5, "ignore_eos": true }
        }))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();

    let events: Vec<&str> = text
        .lines()
        .filter_map(|l| l.strip_prefix("data: "))
        .collect();
    assert_eq!(events.last(), Some(&"[DONE]"));
    let last: Value = serde_json::from_str(events[events.len() - 2]).unwrap();
    assert_eq!(last["meta_info"]["completion_tokens"], 5);
    assert_eq!(last["meta_info"]["finish_reason"], "length");
}

#[tokio::test]
async fn test_flush_and_stats() {
    let base = spawn_node(Cli {
        enable_hierarchical_cache: true,
        hicache_storage_backend: Some(StorageBackendKind::Memory),
        ..small_node()
    })
    .await;

    let (status, _) = generate(&base, json!({ "text": "persist these pages please" })).await;
    assert_eq!(status, 200);

    let resp = client().post(format!("{base}/flush_cache")).send().await.unwrap();
    assert_eq!(resp.status().as_u16(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["success"], true);

    let stats: Value = client()
        .get(format!("{base}/hicache/stats"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["hierarchical"], true);
    assert_eq!(stats["backend"], "memory");
    assert!(stats["blocks"].as_u64().unwrap() > 0);

    let health: Value = client()
        .get(format!("{base}/health"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "ok");

    let metrics = client()
        .get(format!("{base}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("hicache_requests_total 1"));
}

#[tokio::test]
async fn test_decode_node_pulls_pages_over_http() {
    let prefill = spawn_node(Cli {
        disaggregation_mode: Some(DisaggregationMode::Prefill),
        ..small_node()
    })
    .await;
    let decode = spawn_node(Cli {
        disaggregation_mode: Some(DisaggregationMode::Decode),
        disaggregation_prefill_url: Some(prefill.clone()),
        ..small_node()
    })
    .await;

    let body = json!({
        "text": "a shared system prompt that both nodes should agree on",
        "sampling_params": { "temperature": 0.0, "max_new_tokens": 4 }
    });
    let (status, from_decode) = generate(&decode, body.clone()).await;
    assert_eq!(status, 200);
    let (_, from_prefill) = generate(&prefill, body).await;
    assert_eq!(from_decode["text"], from_prefill["text"]);

    let metrics = client()
        .get(format!("{decode}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("hicache_transfer_pages_total 13"));
    assert!(metrics.contains("hicache_computed_pages_total 0"));
}

#[tokio::test]
async fn test_malformed_peer_fetch_is_rejected() {
    let base = spawn_node(small_node()).await;
    let resp = client()
        .post(format!("{base}/hicache/fetch"))
        .body(vec![1u8, 2, 3])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status().as_u16(), 400);
}

//! Prometheus metrics for the cache space.
//!
//! Each cache space owns its own registry so several spaces (a prefill and a
//! decode node in one test process, say) never collide on registration.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry, TextEncoder,
};

use crate::cache::block::Tier;
use crate::cache::pager::TierStats;

#[derive(Clone)]
pub struct CacheMetrics {
    registry: Registry,
    pub requests: IntCounter,
    pub prompt_tokens: IntCounter,
    pub cached_tokens: IntCounter,
    pub computed_pages: IntCounter,
    pub evictions: IntCounterVec,
    pub durable_writes: IntCounter,
    pub durable_write_failures: IntCounter,
    pub storage_hits: IntCounter,
    pub transfer_pages: IntCounter,
    pub transfer_failures: IntCounter,
    pub coalesced_waits: IntCounterVec,
    pub tier_bytes: IntGaugeVec,
    pub tier_blocks: IntGaugeVec,
}

impl std::fmt::Debug for CacheMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheMetrics")
            .field("requests", &self.requests.get())
            .finish_non_exhaustive()
    }
}

fn counter(registry: &Registry, name: &str, help: &str) -> prometheus::Result<IntCounter> {
    let c = IntCounter::with_opts(Opts::new(name, help).namespace("hicache"))?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn counter_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntCounterVec> {
    let c = IntCounterVec::new(Opts::new(name, help).namespace("hicache"), labels)?;
    registry.register(Box::new(c.clone()))?;
    Ok(c)
}

fn gauge_vec(
    registry: &Registry,
    name: &str,
    help: &str,
    labels: &[&str],
) -> prometheus::Result<IntGaugeVec> {
    let g = IntGaugeVec::new(Opts::new(name, help).namespace("hicache"), labels)?;
    registry.register(Box::new(g.clone()))?;
    Ok(g)
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        Ok(Self {
            requests: counter(&registry, "requests_total", "Requests resolved against the cache")?,
            prompt_tokens: counter(&registry, "prompt_tokens_total", "Prompt tokens seen")?,
            cached_tokens: counter(&registry, "cached_tokens_total", "Prompt tokens served from cache")?,
            computed_pages: counter(&registry, "computed_pages_total", "Pages produced by compute")?,
            evictions: counter_vec(&registry, "evictions_total", "Blocks evicted per tier", &["tier"])?,
            durable_writes: counter(&registry, "durable_writes_total", "Pages written to the durable backend")?,
            durable_write_failures: counter(
                &registry,
                "durable_write_failures_total",
                "Durable writes that exhausted their retries",
            )?,
            storage_hits: counter(&registry, "storage_hits_total", "Pages promoted from the durable backend")?,
            transfer_pages: counter(&registry, "transfer_pages_total", "Pages received from a prefill peer")?,
            transfer_failures: counter(
                &registry,
                "transfer_failures_total",
                "Peer fetches downgraded to a local miss",
            )?,
            coalesced_waits: counter_vec(
                &registry,
                "coalesced_waits_total",
                "Callers that joined work already in flight",
                &["kind"],
            )?,
            tier_bytes: gauge_vec(&registry, "tier_bytes", "Bytes resident per tier", &["tier"])?,
            tier_blocks: gauge_vec(&registry, "tier_blocks", "Blocks resident per tier", &["tier"])?,
            registry,
        })
    }

    pub fn record_evictions(&self, tier: Tier, count: usize) {
        if count > 0 {
            self.evictions
                .with_label_values(&[tier.to_string().as_str()])
                .inc_by(count as u64);
        }
    }

    pub fn record_coalesced(&self, kind: &str) {
        self.coalesced_waits.with_label_values(&[kind]).inc();
    }

    pub fn set_tier_stats(&self, stats: &[(Tier, TierStats)]) {
        for (tier, s) in stats {
            let label = tier.to_string();
            self.tier_bytes
                .with_label_values(&[label.as_str()])
                .set(s.bytes_used as i64);
            self.tier_blocks
                .with_label_values(&[label.as_str()])
                .set(s.block_count as i64);
        }
    }

    /// Render every metric in the Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = Vec::new();
        let encoder = TextEncoder::new();
        if encoder.encode(&self.registry.gather(), &mut buf).is_err() {
            return String::new();
        }
        String::from_utf8(buf).unwrap_or_default()
    }
}

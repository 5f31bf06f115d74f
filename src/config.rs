//! Runtime configuration for hicache.
//!
//! A JSON file provides the base configuration; command-line flags override
//! individual fields. Everything is resolved once at startup into a validated
//! [`ResolvedConfig`], and invalid combinations are rejected as a
//! [`ConfigError`] before the server starts.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::cache::durability::DurabilityConfig;
use crate::gpu::device;
use crate::storage::compressor::CompressionConfig;

const GIB: usize = 1024 * 1024 * 1024;
const DEFAULT_DEVICE_BUDGET: usize = 256 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("hicache-ratio must be greater than 1.0 when hicache-size is 0 (got {0})")]
    InvalidRatio(f64),

    #[error("A storage backend requires the hierarchical cache to be enabled")]
    BackendRequiresHierarchical,

    #[error("The file storage backend requires a storage directory (HICACHE_FILE_BACKEND_STORAGE_DIR)")]
    MissingStorageDir,

    #[error("disaggregation-prefill-url is only valid in decode mode")]
    PrefillUrlRequiresDecode,
}

/// When blocks are replicated to the durable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum WritePolicy {
    /// Replicate on admit.
    #[value(name = "write_through")]
    WriteThrough,
    /// Replicate under capacity pressure or on flush.
    #[value(name = "write_back")]
    WriteBack,
}

/// How long a request waits for pages coming up from the durable backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum PrefetchPolicy {
    /// Use whatever is already in memory; load the rest in the background.
    #[value(name = "best_effort")]
    BestEffort,
    /// Block until every page has landed on Device.
    #[value(name = "wait_complete")]
    WaitComplete,
    /// Block up to the prefetch timeout, then continue with what has landed.
    #[value(name = "timeout")]
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackendKind {
    #[value(name = "file")]
    File,
    #[value(name = "memory")]
    Memory,
}

/// Role of this node in a disaggregated deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum DisaggregationMode {
    #[value(name = "null")]
    Null,
    #[value(name = "prefill")]
    Prefill,
    #[value(name = "decode")]
    Decode,
}

/// Command-line arguments. Every cache flag is optional and overrides the
/// corresponding field of the config file.
#[derive(Parser, Debug, Clone, Default)]
#[command(name = "hicache", about = "Hierarchical prefix cache server")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// HTTP listen address.
    #[arg(long)]
    pub listen: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Block granularity in tokens.
    #[arg(long)]
    pub page_size: Option<usize>,

    /// Enable the Host tier (and, with a backend, the Remote tier).
    #[arg(long)]
    pub enable_hierarchical_cache: bool,

    /// Host tier capacity relative to Device capacity.
    #[arg(long)]
    pub hicache_ratio: Option<f64>,

    /// Absolute Host tier capacity in GiB (0 = derive from ratio).
    #[arg(long)]
    pub hicache_size: Option<usize>,

    #[arg(long, value_enum)]
    pub hicache_write_policy: Option<WritePolicy>,

    #[arg(long, value_enum)]
    pub hicache_storage_backend: Option<StorageBackendKind>,

    #[arg(long, value_enum)]
    pub hicache_storage_prefetch_policy: Option<PrefetchPolicy>,

    #[arg(long)]
    pub hicache_storage_prefetch_timeout_ms: Option<u64>,

    #[arg(long)]
    pub hicache_max_write_retries: Option<u32>,

    /// Root directory of the file storage backend.
    #[arg(long, env = "HICACHE_FILE_BACKEND_STORAGE_DIR")]
    pub hicache_storage_dir: Option<PathBuf>,

    #[arg(long, value_enum)]
    pub disaggregation_mode: Option<DisaggregationMode>,

    /// Subject decode-side blocks, generated ones included, to durability.
    #[arg(long)]
    pub disaggregation_decode_enable_offload_kvcache: bool,

    /// Base URL of the prefill node (decode mode).
    #[arg(long)]
    pub disaggregation_prefill_url: Option<String>,

    /// Maximum prompt length plus one; longer prompts are rejected.
    #[arg(long)]
    pub context_length: Option<usize>,

    /// Token capacity of the Device tier.
    #[arg(long)]
    pub max_total_tokens: Option<usize>,

    #[arg(long)]
    pub random_seed: Option<u64>,

    /// Fraction of accelerator memory reserved for static allocations.
    #[arg(long)]
    pub mem_fraction_static: Option<f64>,
}

/// Top-level file configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub model: ModelConfig,
    pub cache: CacheSection,
    pub disaggregation: DisaggregationSection,
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:30000").
    pub listen: String,

    /// Name reported by the OpenAI-compatible endpoints.
    pub served_model_name: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:30000".to_string(),
            served_model_name: "hicache-synthetic".to_string(),
        }
    }
}

/// Model shape. Only used to size pages; nothing here is ever loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Context size in tokens.
    pub context_length: usize,

    /// Number of layers in the model.
    pub n_layers: usize,

    /// Number of KV heads (for GQA/MQA).
    pub n_kv_heads: usize,

    /// Head dimension.
    pub head_dim: usize,

    /// Bytes per element of cached state (2 for fp16).
    pub dtype_bytes: usize,

    pub random_seed: u64,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            context_length: 8192,
            n_layers: 4,
            n_kv_heads: 2,
            head_dim: 16,
            dtype_bytes: 2,
            random_seed: 42,
        }
    }
}

impl ModelConfig {
    /// Bytes of cached state per token (K and V, all layers).
    pub fn bytes_per_token(&self) -> usize {
        2 * self.n_layers * self.n_kv_heads * self.head_dim * self.dtype_bytes
    }
}

/// Cache settings as written in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSection {
    pub page_size: usize,
    pub enable_hierarchical_cache: bool,
    pub hicache_ratio: f64,
    /// GiB; 0 derives the Host budget from the ratio.
    pub hicache_size: usize,
    pub write_policy: WritePolicy,
    pub storage_backend: Option<StorageBackendKind>,
    pub storage_dir: Option<PathBuf>,
    pub prefetch_policy: PrefetchPolicy,
    pub prefetch_timeout_ms: u64,
    pub max_write_retries: u32,
    pub retry_backoff_ms: u64,
    /// Eviction drains a tier to this fraction of its budget.
    pub low_watermark: f64,
    pub max_total_tokens: Option<usize>,
    pub mem_fraction_static: f64,
    pub compression: CompressionConfig,
}

impl Default for CacheSection {
    fn default() -> Self {
        Self {
            page_size: 1,
            enable_hierarchical_cache: false,
            hicache_ratio: 2.0,
            hicache_size: 0,
            write_policy: WritePolicy::WriteThrough,
            storage_backend: None,
            storage_dir: None,
            prefetch_policy: PrefetchPolicy::BestEffort,
            prefetch_timeout_ms: 2000,
            max_write_retries: 3,
            retry_backoff_ms: 20,
            low_watermark: 1.0,
            max_total_tokens: None,
            mem_fraction_static: 0.88,
            compression: CompressionConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisaggregationSection {
    pub mode: DisaggregationMode,
    pub decode_enable_offload_kvcache: bool,
    pub prefill_url: Option<String>,
    pub transfer_timeout_ms: u64,
}

impl Default for DisaggregationSection {
    fn default() -> Self {
        Self {
            mode: DisaggregationMode::Null,
            decode_enable_offload_kvcache: false,
            prefill_url: None,
            transfer_timeout_ms: 30_000,
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let data = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&data)?)
    }

    /// Apply command-line overrides.
    pub fn merge_cli(mut self, cli: &Cli) -> Self {
        if let Some(listen) = &cli.listen {
            self.server.listen = listen.clone();
        }
        if let Some(v) = cli.context_length {
            self.model.context_length = v;
        }
        if let Some(v) = cli.random_seed {
            self.model.random_seed = v;
        }

        let cache = &mut self.cache;
        if let Some(v) = cli.page_size {
            cache.page_size = v;
        }
        cache.enable_hierarchical_cache |= cli.enable_hierarchical_cache;
        if let Some(v) = cli.hicache_ratio {
            cache.hicache_ratio = v;
        }
        if let Some(v) = cli.hicache_size {
            cache.hicache_size = v;
        }
        if let Some(v) = cli.hicache_write_policy {
            cache.write_policy = v;
        }
        if let Some(v) = cli.hicache_storage_backend {
            cache.storage_backend = Some(v);
        }
        if let Some(v) = &cli.hicache_storage_dir {
            cache.storage_dir = Some(v.clone());
        }
        if let Some(v) = cli.hicache_storage_prefetch_policy {
            cache.prefetch_policy = v;
        }
        if let Some(v) = cli.hicache_storage_prefetch_timeout_ms {
            cache.prefetch_timeout_ms = v;
        }
        if let Some(v) = cli.hicache_max_write_retries {
            cache.max_write_retries = v;
        }
        if let Some(v) = cli.max_total_tokens {
            cache.max_total_tokens = Some(v);
        }
        if let Some(v) = cli.mem_fraction_static {
            cache.mem_fraction_static = v;
        }

        let disagg = &mut self.disaggregation;
        if let Some(v) = cli.disaggregation_mode {
            disagg.mode = v;
        }
        disagg.decode_enable_offload_kvcache |= cli.disaggregation_decode_enable_offload_kvcache;
        if let Some(v) = &cli.disaggregation_prefill_url {
            disagg.prefill_url = Some(v.clone());
        }
        self
    }

    /// Validate and derive the runtime configuration.
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let cache = &self.cache;
        let disagg = &self.disaggregation;

        if cache.page_size == 0 {
            return Err(ConfigError::InvalidValue {
                field: "page-size",
                reason: "must be positive".into(),
            });
        }
        if self.model.context_length == 0 {
            return Err(ConfigError::InvalidValue {
                field: "context-length",
                reason: "must be positive".into(),
            });
        }
        if !(cache.low_watermark > 0.0 && cache.low_watermark <= 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "low_watermark",
                reason: format!("{} is outside (0, 1]", cache.low_watermark),
            });
        }
        if !(cache.mem_fraction_static > 0.0 && cache.mem_fraction_static < 1.0) {
            return Err(ConfigError::InvalidValue {
                field: "mem-fraction-static",
                reason: format!("{} is outside (0, 1)", cache.mem_fraction_static),
            });
        }
        if disagg.prefill_url.is_some() && disagg.mode != DisaggregationMode::Decode {
            return Err(ConfigError::PrefillUrlRequiresDecode);
        }

        let decode_offload =
            disagg.mode == DisaggregationMode::Decode && disagg.decode_enable_offload_kvcache;
        let hierarchical = cache.enable_hierarchical_cache || decode_offload;

        let mut backend = cache.storage_backend;
        if disagg.mode == DisaggregationMode::Decode && !decode_offload && backend.is_some() {
            warn!("Decode node without offload keeps no durable copies; ignoring storage backend");
            backend = None;
        }
        if backend.is_some() && !hierarchical {
            return Err(ConfigError::BackendRequiresHierarchical);
        }
        if hierarchical && cache.hicache_size == 0 && cache.hicache_ratio <= 1.0 {
            return Err(ConfigError::InvalidRatio(cache.hicache_ratio));
        }

        let storage = match backend {
            Some(StorageBackendKind::File) => {
                let root = cache.storage_dir.clone().ok_or(ConfigError::MissingStorageDir)?;
                Some(StorageSettings {
                    kind: StorageBackendKind::File,
                    root: Some(root),
                    compression: cache.compression.clone(),
                })
            }
            Some(kind) => Some(StorageSettings {
                kind,
                root: cache.storage_dir.clone(),
                compression: cache.compression.clone(),
            }),
            None => None,
        };

        let bytes_per_token = self.model.bytes_per_token();
        let device_capacity = match cache.max_total_tokens {
            Some(tokens) => tokens * bytes_per_token,
            None => device::device_cache_budget(cache.mem_fraction_static)
                .unwrap_or(DEFAULT_DEVICE_BUDGET),
        };
        let host_capacity = if !hierarchical {
            0
        } else if cache.hicache_size > 0 {
            cache.hicache_size * GIB
        } else {
            (cache.hicache_ratio * device_capacity as f64) as usize
        };

        Ok(ResolvedConfig {
            listen: self.server.listen.clone(),
            served_model_name: self.server.served_model_name.clone(),
            cache: CacheConfig {
                page_size: cache.page_size,
                hierarchical,
                device_capacity,
                host_capacity,
                write_policy: cache.write_policy,
                prefetch_policy: cache.prefetch_policy,
                prefetch_timeout: Duration::from_millis(cache.prefetch_timeout_ms),
                durability: DurabilityConfig {
                    max_retries: cache.max_write_retries,
                    retry_backoff: Duration::from_millis(cache.retry_backoff_ms),
                },
                low_watermark: cache.low_watermark,
            },
            storage,
            engine: EngineConfig {
                page_size: cache.page_size,
                context_length: self.model.context_length,
                max_total_tokens: cache.max_total_tokens,
                bytes_per_token,
                random_seed: self.model.random_seed,
                role: disagg.mode,
                admit_outputs: disagg.mode != DisaggregationMode::Decode || decode_offload,
                compute_delay: Duration::ZERO,
            },
            prefill_url: disagg.prefill_url.clone(),
            transfer_timeout: Duration::from_millis(disagg.transfer_timeout_ms),
        })
    }
}

/// Validated settings of one cache space.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub page_size: usize,
    pub hierarchical: bool,
    /// Device tier budget in bytes.
    pub device_capacity: usize,
    /// Host tier budget in bytes (0 when not hierarchical).
    pub host_capacity: usize,
    pub write_policy: WritePolicy,
    pub prefetch_policy: PrefetchPolicy,
    pub prefetch_timeout: Duration,
    pub durability: DurabilityConfig,
    pub low_watermark: f64,
}

impl CacheConfig {
    /// A single-tier configuration, mostly for tests.
    pub fn device_only(page_size: usize, device_capacity: usize) -> Self {
        Self {
            page_size,
            hierarchical: false,
            device_capacity,
            host_capacity: 0,
            write_policy: WritePolicy::WriteThrough,
            prefetch_policy: PrefetchPolicy::WaitComplete,
            prefetch_timeout: Duration::from_secs(2),
            durability: DurabilityConfig::default(),
            low_watermark: 1.0,
        }
    }

    /// A Device + Host configuration, mostly for tests.
    pub fn hierarchical(page_size: usize, device_capacity: usize, host_capacity: usize) -> Self {
        Self {
            hierarchical: true,
            host_capacity,
            ..Self::device_only(page_size, device_capacity)
        }
    }
}

#[derive(Debug, Clone)]
pub struct StorageSettings {
    pub kind: StorageBackendKind,
    pub root: Option<PathBuf>,
    pub compression: CompressionConfig,
}

/// Validated settings of the request engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub page_size: usize,
    pub context_length: usize,
    pub max_total_tokens: Option<usize>,
    pub bytes_per_token: usize,
    pub random_seed: u64,
    pub role: DisaggregationMode,
    /// Whether pages produced while generating are cached too.
    pub admit_outputs: bool,
    /// Simulated compute time per page.
    pub compute_delay: Duration,
}

impl EngineConfig {
    pub fn for_tests(page_size: usize) -> Self {
        Self {
            page_size,
            context_length: 8192,
            max_total_tokens: None,
            bytes_per_token: 16,
            random_seed: 42,
            role: DisaggregationMode::Null,
            admit_outputs: true,
            compute_delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedConfig {
    pub listen: String,
    pub served_model_name: String,
    pub cache: CacheConfig,
    pub storage: Option<StorageSettings>,
    pub engine: EngineConfig,
    pub prefill_url: Option<String>,
    pub transfer_timeout: Duration,
}

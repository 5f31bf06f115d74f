//! hicache: hierarchical prefix cache for LLM serving.
//!
//! Reuses already-computed attention pages across requests that share a
//! token prefix. Pages live in a hierarchy of tiers:
//!   Device (hot) → Host (warm) → durable storage (cold)
//!
//! A decode node can pull prefix pages from a prefill peer instead of
//! recomputing them. The node serves a native `/generate` API alongside an
//! OpenAI-compatible one.

pub mod cache;
pub mod config;
pub mod gpu;
pub mod inference;
pub mod metrics;
pub mod server;
pub mod storage;
pub mod transfer;

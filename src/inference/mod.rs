//! Request engine.
//!
//! - [`engine`]: request orchestration over the cache space
//! - [`compute`]: the compute collaborator and its synthetic implementation
//! - [`sampler`]: seeded sampling
//! - [`tokenizer`]: byte-level tokenizer

pub mod compute;
pub mod engine;
pub mod sampler;
pub mod tokenizer;

use thiserror::Error;

/// A request the engine refuses or cannot finish.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("The input ({len} tokens) is longer than the model's context length ({limit} tokens)")]
    ContextLengthExceeded { len: usize, limit: usize },

    #[error("The input ({len} tokens) exceeds the total token budget ({limit} tokens)")]
    TotalTokensExceeded { len: usize, limit: usize },

    #[error("The input is empty")]
    EmptyPrompt,

    #[error("Compute failed: {0}")]
    Compute(String),
}

impl EngineError {
    /// Whether the request itself is at fault.
    pub fn is_invalid_request(&self) -> bool {
        !matches!(self, EngineError::Compute(_))
    }
}

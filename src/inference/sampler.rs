//! Seeded token sampling over synthetic logits.
//!
//! Logits depend only on the prompt, so greedy decoding is identical on every
//! node. Sampling randomness comes from the request seed: the same seed
//! reproduces the same output, different seeds diverge when temperature > 0.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use super::tokenizer::EOS_TOKEN;
use crate::cache::block::TokenId;

/// Printable ASCII, the only text the synthetic model emits.
const FIRST_PRINTABLE: TokenId = 32;
const PRINTABLE: usize = 95;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplingParams {
    pub temperature: f32,
    pub top_p: f32,
    pub max_new_tokens: usize,
    pub ignore_eos: bool,
    pub seed: Option<u64>,
}

impl Default for SamplingParams {
    fn default() -> Self {
        Self {
            temperature: 1.0,
            top_p: 1.0,
            max_new_tokens: 128,
            ignore_eos: false,
            seed: None,
        }
    }
}

impl SamplingParams {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            temperature: 0.0,
            max_new_tokens,
            ..Default::default()
        }
    }
}

#[derive(Debug)]
pub struct Sampler {
    logits_rng: StdRng,
    sample_rng: StdRng,
    temperature: f32,
    top_p: f32,
    ignore_eos: bool,
    step: usize,
}

fn prompt_hash(prompt: &[TokenId]) -> u64 {
    let mut hasher = DefaultHasher::new();
    prompt.hash(&mut hasher);
    hasher.finish()
}

impl Sampler {
    pub fn new(prompt: &[TokenId], params: &SamplingParams, seed: u64) -> Self {
        let hash = prompt_hash(prompt);
        Self {
            logits_rng: StdRng::seed_from_u64(hash),
            sample_rng: StdRng::seed_from_u64(seed ^ hash.rotate_left(17)),
            temperature: params.temperature,
            top_p: params.top_p.clamp(f32::EPSILON, 1.0),
            ignore_eos: params.ignore_eos,
            step: 0,
        }
    }

    fn logits(&mut self) -> Vec<(TokenId, f32)> {
        let mut logits: Vec<(TokenId, f32)> = (0..PRINTABLE as TokenId)
            .map(|i| (FIRST_PRINTABLE + i, self.logits_rng.random::<f32>() * 8.0))
            .collect();
        if !self.ignore_eos {
            // End-of-sequence grows likelier as the output gets longer.
            logits.push((EOS_TOKEN, -6.0 + self.step as f32 * 0.5));
        }
        logits
    }

    pub fn next_token(&mut self) -> TokenId {
        let mut logits = self.logits();
        self.step += 1;

        if self.temperature <= 1e-5 {
            return logits
                .iter()
                .max_by(|a, b| a.1.total_cmp(&b.1))
                .map(|(t, _)| *t)
                .unwrap_or(EOS_TOKEN);
        }

        let max = logits.iter().map(|(_, l)| *l).fold(f32::MIN, f32::max);
        for (_, l) in logits.iter_mut() {
            *l = ((*l - max) / self.temperature).exp();
        }
        let total: f32 = logits.iter().map(|(_, p)| *p).sum();
        logits.sort_by(|a, b| b.1.total_cmp(&a.1));

        let mut nucleus = 0;
        let mut mass = 0.0;
        for (_, p) in &logits {
            nucleus += 1;
            mass += *p;
            if mass >= self.top_p * total {
                break;
            }
        }

        let mut r = self.sample_rng.random::<f32>() * mass;
        for (token, p) in &logits[..nucleus] {
            if r < *p {
                return *token;
            }
            r -= *p;
        }
        logits[nucleus - 1].0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(prompt: &[TokenId], params: &SamplingParams, seed: u64, n: usize) -> Vec<TokenId> {
        let mut sampler = Sampler::new(prompt, params, seed);
        (0..n).map(|_| sampler.next_token()).collect()
    }

    #[test]
    fn test_same_seed_same_output() {
        let params = SamplingParams {
            temperature: 0.8,
            ignore_eos: true,
            ..Default::default()
        };
        assert_eq!(sample(&[1, 2, 3], &params, 7, 32), sample(&[1, 2, 3], &params, 7, 32));
        assert_ne!(sample(&[1, 2, 3], &params, 7, 32), sample(&[1, 2, 3], &params, 8, 32));
    }

    #[test]
    fn test_greedy_ignores_seed() {
        let params = SamplingParams::greedy(16);
        assert_eq!(sample(&[4, 5], &params, 1, 16), sample(&[4, 5], &params, 2, 16));
    }

    #[test]
    fn test_ignore_eos_never_stops() {
        let params = SamplingParams {
            temperature: 1.0,
            ignore_eos: true,
            ..Default::default()
        };
        assert!(sample(&[9], &params, 3, 200).iter().all(|t| *t != EOS_TOKEN));
    }

    #[test]
    fn test_output_is_printable() {
        let params = SamplingParams::default();
        for t in sample(&[1], &params, 11, 20) {
            assert!(t == EOS_TOKEN || (32..127).contains(&t));
        }
    }
}

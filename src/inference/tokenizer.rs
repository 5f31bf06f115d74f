//! Byte-level tokenizer.
//!
//! Every byte of UTF-8 text is one token, so appending generated text to a
//! prompt appends exactly the generated token ids. Id 256 is end-of-sequence.

use crate::cache::block::TokenId;

pub const EOS_TOKEN: TokenId = 256;
pub const VOCAB_SIZE: usize = 257;

#[derive(Debug, Clone, Copy, Default)]
pub struct ByteTokenizer;

impl ByteTokenizer {
    pub fn encode(&self, text: &str) -> Vec<TokenId> {
        text.bytes().map(TokenId::from).collect()
    }

    /// Decode a token sequence, skipping special and out-of-range ids.
    pub fn decode(&self, tokens: &[TokenId]) -> String {
        let bytes: Vec<u8> = tokens
            .iter()
            .filter_map(|&t| u8::try_from(t).ok())
            .collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn decode_one(&self, token: TokenId) -> String {
        self.decode(&[token])
    }
}

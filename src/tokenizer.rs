use ahash::AHashMap;
use anyhow::{ensure, Context, Result};
use tracing::debug;

use crate::model::TokenId;

type FastMap<K, V> = AHashMap<K, V>;

/// Character-level vocabulary: every distinct character of the corpus gets a
/// dense id, assigned in sorted character order.
#[derive(Debug, Clone)]
pub struct Tokenizer {
    chars: Vec<char>,
    encoder: FastMap<char, TokenId>,
}

impl Tokenizer {
    pub fn from_corpus(text: &str) -> Result<Self> {
        let mut chars: Vec<char> = text.chars().collect();
        chars.sort_unstable();
        chars.dedup();
        ensure!(!chars.is_empty(), "cannot build a vocabulary from an empty corpus");

        let encoder = chars
            .iter()
            .enumerate()
            .map(|(id, ch)| (*ch, id as TokenId))
            .collect::<FastMap<_, _>>();
        debug!("built character vocabulary of {} symbols", chars.len());
        Ok(Self { chars, encoder })
    }

    pub fn vocab_size(&self) -> usize {
        self.chars.len()
    }

    /// The alphabet, indexed by token id.
    pub fn chars(&self) -> &[char] {
        &self.chars
    }

    pub fn encode(&self, text: &str) -> Result<Vec<TokenId>> {
        text.chars()
            .map(|ch| {
                self.encoder
                    .get(&ch)
                    .copied()
                    .with_context(|| format!("character {ch:?} is not in the vocabulary"))
            })
            .collect()
    }

    pub fn decode(&self, tokens: &[TokenId]) -> Result<String> {
        tokens
            .iter()
            .map(|&id| {
                self.chars
                    .get(id as usize)
                    .copied()
                    .with_context(|| format!("token id {id} is out of range"))
            })
            .collect()
    }
}

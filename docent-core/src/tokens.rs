//! Token counting with tiktoken-rs.

use std::sync::{Arc, LazyLock};

use tiktoken_rs::CoreBPE;

use crate::types::ChatTurn;

static CL100K: LazyLock<Arc<CoreBPE>> = LazyLock::new(|| {
    Arc::new(tiktoken_rs::cl100k_base().expect("cl100k_base should be available"))
});

/// Token counter backed by a BPE encoder. Cheap to clone.
#[derive(Clone)]
pub struct TokenCounter {
    bpe: Arc<CoreBPE>,
}

impl TokenCounter {
    /// The `cl100k_base` encoding, shared process-wide.
    pub fn cl100k() -> Self {
        Self {
            bpe: Arc::clone(&CL100K),
        }
    }

    /// Create a token counter for the given model.
    /// Falls back to cl100k_base if the model isn't recognized.
    pub fn for_model(model: &str) -> Self {
        match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => Self { bpe: Arc::new(bpe) },
            Err(_) => Self::cl100k(),
        }
    }

    /// Count the number of tokens in a string.
    pub fn count(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    /// Estimate tokens for conversation turns, including role overhead.
    pub fn count_turns(&self, turns: &[ChatTurn]) -> usize {
        turns.iter().map(|t| 4 + self.count(&t.text)).sum()
    }

    /// Longest prefix of `text` that fits in `max_tokens`, cut on a char boundary.
    pub fn truncate(&self, text: &str, max_tokens: usize) -> String {
        if self.count(text) <= max_tokens {
            return text.to_string();
        }
        let tokens = self.bpe.encode_with_special_tokens(text);
        let kept = &tokens[..max_tokens.min(tokens.len())];
        match self.bpe.decode(kept.to_vec()) {
            Ok(s) => s,
            // The cut landed inside a multi-byte sequence; back off by characters.
            Err(_) => {
                let mut out: String = text.chars().take(max_tokens).collect();
                while !out.is_empty() && self.count(&out) > max_tokens {
                    out.pop();
                }
                out
            }
        }
    }
}

impl std::fmt::Debug for TokenCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCounter").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_basic() {
        let counter = TokenCounter::cl100k();
        assert_eq!(counter.count(""), 0);
        assert!(counter.count("Hello, world!") > 0);
    }

    #[test]
    fn test_unknown_model_falls_back() {
        let counter = TokenCounter::for_model("some-local-model");
        assert_eq!(
            counter.count("photosynthesis"),
            TokenCounter::cl100k().count("photosynthesis")
        );
    }

    #[test]
    fn test_count_turns_adds_overhead() {
        let counter = TokenCounter::cl100k();
        let turns = vec![ChatTurn::user("hi"), ChatTurn::assistant("hello")];
        let raw = counter.count("hi") + counter.count("hello");
        assert_eq!(counter.count_turns(&turns), raw + 8);
    }

    #[test]
    fn test_truncate_respects_limit() {
        let counter = TokenCounter::cl100k();
        let text = "The mitochondria is the powerhouse of the cell. ".repeat(20);
        let cut = counter.truncate(&text, 10);
        assert!(counter.count(&cut) <= 10);
        assert!(text.starts_with(&cut));
    }
}

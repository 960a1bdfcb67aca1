//! Shared token counting utilities.
//!
//! Uses `tiktoken-rs` for accurate counts and falls back to a conservative
//! heuristic if tokenizer initialization fails.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Estimate tokens for raw content.
#[inline]
pub fn estimate_content_tokens(content: &str) -> usize {
    TOKENIZER
        .as_ref()
        .map(|bpe| bpe.encode_with_special_tokens(content).len())
        .unwrap_or_else(|| heuristic_estimate(content))
}

/// Estimate token count for content plus a fixed per-message overhead.
#[inline]
pub fn estimate_tokens_with_overhead(content: &str, message_overhead: usize) -> usize {
    estimate_content_tokens(content) + message_overhead
}

fn heuristic_estimate(content: &str) -> usize {
    // Biased toward overestimation so budget trimming errs on the safe side.
    let factor = if content.contains('{') || content.contains(';') {
        3
    } else {
        4
    };
    (content.len() / factor).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_nonzero() {
        assert!(estimate_content_tokens("df -h on all hosts") > 0);
    }

    #[test]
    fn test_overhead_added() {
        let base = estimate_content_tokens("hello");
        assert_eq!(estimate_tokens_with_overhead("hello", 4), base + 4);
    }

    #[test]
    fn test_heuristic_minimum_one() {
        assert_eq!(heuristic_estimate(""), 1);
    }
}

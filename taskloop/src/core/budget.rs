//! Length estimation and prompt budget helpers.

/// Fixed per-message framing cost (role label, separators).
pub const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Smallest prompt budget the builder accepts: system and user messages
/// each keep their framing, a short prefix and a truncation marker.
pub const MIN_PROMPT_BUDGET_TOKENS: usize = 2 * (MESSAGE_OVERHEAD_TOKENS + 8);

/// Estimates the size of planner input.
///
/// Implementations must be deterministic: the prompt builder relies on equal
/// inputs producing equal estimates.
pub trait LengthEstimator: Send + Sync {
    fn estimate(&self, text: &str) -> usize;

    /// Estimate a whole message including framing overhead.
    fn estimate_message(&self, content: &str) -> usize {
        self.estimate(content) + MESSAGE_OVERHEAD_TOKENS
    }
}

/// Character-based approximation used when no tokenizer is available:
/// one token per four characters, rounded up.
#[derive(Debug, Clone, Copy, Default)]
pub struct CharEstimator;

impl LengthEstimator for CharEstimator {
    fn estimate(&self, text: &str) -> usize {
        text.chars().count().div_ceil(4)
    }
}

/// Token budget for planner input, reserving headroom for the model's output.
pub fn prompt_budget(context_window_tokens: usize, ratio: f64) -> usize {
    let ratio = ratio.clamp(0.0, 1.0);
    (context_window_tokens as f64 * ratio).floor() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_estimator_rounds_up() {
        let est = CharEstimator;
        assert_eq!(est.estimate(""), 0);
        assert_eq!(est.estimate("a"), 1);
        assert_eq!(est.estimate("abcd"), 1);
        assert_eq!(est.estimate("abcde"), 2);
    }

    #[test]
    fn char_estimator_counts_chars_not_bytes() {
        assert_eq!(CharEstimator.estimate("éééé"), 1);
    }

    #[test]
    fn message_estimate_includes_overhead() {
        assert_eq!(CharEstimator.estimate_message("abcd"), 1 + MESSAGE_OVERHEAD_TOKENS);
    }

    #[test]
    fn prompt_budget_reserves_headroom() {
        assert_eq!(prompt_budget(8192, 0.8), 6553);
        assert_eq!(prompt_budget(100, 1.5), 100);
    }
}

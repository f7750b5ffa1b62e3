//! Token estimation utilities.
//!
//! Providers count tokens with their own tokenizers, which this crate never
//! sees. Context sizing therefore works from a character/word heuristic that
//! errs on the high side.

use serde::{Deserialize, Serialize};

/// Token estimation strategies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EstimationMethod {
    /// Character-based estimation (3.5 chars ≈ 1 token for English prose)
    CharacterBased,
    /// Word-based estimation (1 word ≈ 1.3 tokens)
    WordBased,
    /// Higher of the two, with a safety margin
    #[default]
    Conservative,
}

/// Token estimator for manuscript text.
#[derive(Debug, Clone)]
pub struct TokenEstimator {
    method: EstimationMethod,
    /// Multiplier applied to the base estimate
    safety_margin: f64,
}

impl Default for TokenEstimator {
    fn default() -> Self {
        Self::new(EstimationMethod::Conservative)
    }
}

impl TokenEstimator {
    /// Create a new token estimator with the specified method.
    pub fn new(method: EstimationMethod) -> Self {
        let safety_margin = match method {
            EstimationMethod::CharacterBased | EstimationMethod::WordBased => 1.0,
            EstimationMethod::Conservative => 1.2,
        };
        Self {
            method,
            safety_margin,
        }
    }

    /// Create a conservative estimator with a custom safety margin (never below 1.0).
    pub fn conservative(safety_margin: f64) -> Self {
        Self {
            method: EstimationMethod::Conservative,
            safety_margin: safety_margin.max(1.0),
        }
    }

    pub fn method(&self) -> EstimationMethod {
        self.method
    }

    /// Estimate tokens for a piece of text.
    ///
    /// The estimate is monotone in the text length: a prefix never
    /// estimates higher than the full text. Truncation relies on this.
    pub fn estimate(&self, text: &str) -> u64 {
        let base = match self.method {
            EstimationMethod::CharacterBased => Self::by_chars(text),
            EstimationMethod::WordBased => Self::by_words(text),
            EstimationMethod::Conservative => Self::by_chars(text).max(Self::by_words(text)),
        };

        (base as f64 * self.safety_margin).ceil() as u64
    }

    fn by_chars(text: &str) -> u64 {
        let chars = text.chars().count();
        (chars as f64 / 3.5).ceil() as u64
    }

    fn by_words(text: &str) -> u64 {
        let words = text.split_whitespace().count();
        (words as f64 * 1.3).ceil() as u64
    }

    /// Approximate output tokens for a target word count.
    pub fn estimate_words(&self, words: u64) -> u64 {
        (words as f64 * 1.3 * self.safety_margin).ceil() as u64
    }
}

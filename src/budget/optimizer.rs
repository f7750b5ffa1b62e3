//! Fits candidate context items under a hard token ceiling.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use super::compress::Compressor;
use super::estimator::TokenEstimator;

/// A candidate piece of generation context (outline excerpt, prior chapter
/// summary, character sheet, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    pub text: String,
    /// Higher weight is included first
    pub weight: f64,
    /// Estimated token cost of `text`
    pub tokens: u64,
    /// May be run through the compression pass
    #[serde(default)]
    pub summarizable: bool,
    /// May be cut to a prefix
    #[serde(default)]
    pub truncatable: bool,
}

impl ContentItem {
    /// Create an item whose token cost is estimated from its text.
    pub fn new(
        id: impl Into<String>,
        text: impl Into<String>,
        weight: f64,
        estimator: &TokenEstimator,
    ) -> Self {
        let text = text.into();
        let tokens = estimator.estimate(&text);
        Self {
            id: id.into(),
            text,
            weight,
            tokens,
            summarizable: false,
            truncatable: false,
        }
    }

    pub fn summarizable(mut self, yes: bool) -> Self {
        self.summarizable = yes;
        self
    }

    pub fn truncatable(mut self, yes: bool) -> Self {
        self.truncatable = yes;
        self
    }
}

/// Token ceiling for one generation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenBudget {
    pub maximum: u64,
    pub used: u64,
}

impl TokenBudget {
    pub fn new(maximum: u64) -> Self {
        Self { maximum, used: 0 }
    }

    pub fn remaining(&self) -> u64 {
        self.maximum.saturating_sub(self.used)
    }

    pub fn fits(&self, tokens: u64) -> bool {
        self.used.saturating_add(tokens) <= self.maximum
    }

    fn consume(&mut self, tokens: u64) {
        self.used += tokens;
    }
}

/// How an included item was adapted to fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Treatment {
    Full,
    Compressed,
    Truncated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectedItem {
    pub id: String,
    pub text: String,
    pub tokens: u64,
    pub weight: f64,
    pub treatment: Treatment,
}

/// Result of an optimization pass, ordered by descending weight.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Selection {
    pub items: Vec<SelectedItem>,
    pub used: u64,
    pub maximum: u64,
    /// Ids of items that could not be fitted at all
    pub dropped: Vec<String>,
}

impl Selection {
    /// Concatenated context text, one item per paragraph.
    pub fn text(&self) -> String {
        self.items
            .iter()
            .map(|item| item.text.as_str())
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.iter().any(|item| item.id == id)
    }

    pub fn treatment_of(&self, id: &str) -> Option<Treatment> {
        self.items.iter().find(|item| item.id == id).map(|item| item.treatment)
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContextError {
    #[error("context uses {used} tokens, ceiling is {maximum}")]
    BudgetExceeded { used: u64, maximum: u64 },
}

/// Greedy context optimizer.
#[derive(Debug, Clone, Default)]
pub struct ContextOptimizer {
    estimator: TokenEstimator,
    compressor: Compressor,
}

impl ContextOptimizer {
    pub fn new(estimator: TokenEstimator) -> Self {
        Self {
            estimator,
            compressor: Compressor::new(),
        }
    }

    pub fn estimator(&self) -> &TokenEstimator {
        &self.estimator
    }

    /// Select items so that their total estimated tokens stay within `budget`.
    ///
    /// Items are visited by descending weight (ties keep input order). An
    /// item that does not fit is compressed if summarizable, cut to a prefix
    /// if truncatable, and dropped otherwise. The ceiling is re-checked on
    /// the final selection before returning.
    pub fn optimize(
        &self,
        items: Vec<ContentItem>,
        budget: TokenBudget,
    ) -> Result<Selection, ContextError> {
        let starting_used = budget.used;
        let mut budget = budget;
        let mut ordered = items;
        // sort_by is stable, so equal weights keep their input order
        ordered.sort_by(|a, b| b.weight.total_cmp(&a.weight));

        let mut selected = Vec::with_capacity(ordered.len());
        let mut dropped = Vec::new();

        for item in ordered {
            if budget.fits(item.tokens) {
                budget.consume(item.tokens);
                selected.push(SelectedItem {
                    id: item.id,
                    text: item.text,
                    tokens: item.tokens,
                    weight: item.weight,
                    treatment: Treatment::Full,
                });
                continue;
            }

            let mut compressed: Option<String> = None;
            if item.summarizable {
                let text = self.compressor.compress(&item.text);
                let tokens = self.estimator.estimate(&text);
                if budget.fits(tokens) {
                    debug!(
                        item = %item.id,
                        before = item.tokens,
                        after = tokens,
                        "compressed context item"
                    );
                    budget.consume(tokens);
                    selected.push(SelectedItem {
                        id: item.id,
                        text,
                        tokens,
                        weight: item.weight,
                        treatment: Treatment::Compressed,
                    });
                    continue;
                }
                compressed = Some(text);
            }

            if item.truncatable {
                let source = compressed.as_deref().unwrap_or(&item.text);
                if let Some((text, tokens)) = self.truncate_to(source, budget.remaining()) {
                    debug!(item = %item.id, tokens, "truncated context item");
                    budget.consume(tokens);
                    selected.push(SelectedItem {
                        id: item.id,
                        text,
                        tokens,
                        weight: item.weight,
                        treatment: Treatment::Truncated,
                    });
                    continue;
                }
            }

            debug!(
                item = %item.id,
                tokens = item.tokens,
                remaining = budget.remaining(),
                "dropped context item"
            );
            dropped.push(item.id);
        }

        let used = starting_used + selected.iter().map(|item| item.tokens).sum::<u64>();
        if used > budget.maximum {
            return Err(ContextError::BudgetExceeded {
                used,
                maximum: budget.maximum,
            });
        }

        Ok(Selection {
            items: selected,
            used,
            maximum: budget.maximum,
            dropped,
        })
    }

    /// Longest char-boundary prefix of `text` whose estimate fits in `remaining`.
    ///
    /// Returns `None` when not even a non-empty prefix fits.
    fn truncate_to(&self, text: &str, remaining: u64) -> Option<(String, u64)> {
        if remaining == 0 || text.is_empty() {
            return None;
        }

        let boundaries: Vec<usize> = text
            .char_indices()
            .map(|(idx, _)| idx)
            .chain(std::iter::once(text.len()))
            .collect();

        // boundaries[k] is the byte length of the k-char prefix
        let (mut lo, mut hi) = (0usize, boundaries.len() - 1);
        while lo < hi {
            let mid = lo + (hi - lo + 1) / 2;
            if self.estimator.estimate(&text[..boundaries[mid]]) <= remaining {
                lo = mid;
            } else {
                hi = mid - 1;
            }
        }

        let prefix = text[..boundaries[lo]].trim_end();
        if prefix.is_empty() {
            return None;
        }
        let tokens = self.estimator.estimate(prefix);
        Some((prefix.to_string(), tokens))
    }
}

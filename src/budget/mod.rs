//! Token budget optimization for generation context.
//!
//! Every provider call carries a context assembled from outline excerpts,
//! prior-chapter recaps and the tail of the text produced so far. Going over
//! the provider's context ceiling makes the call fail or get silently cut, so
//! the context is fitted here before any call is made.
//!
//! # Overview
//!
//! - **TokenEstimator**: estimates token counts from text (providers do not
//!   expose their tokenizers)
//! - **Compressor**: deterministic filler/phrase/whitespace compression
//! - **ContextOptimizer**: greedy, weight-ordered selection under a `TokenBudget`
//!
//! # Example
//!
//! ```ignore
//! use quillforge::budget::{ContentItem, ContextOptimizer, TokenBudget, TokenEstimator};
//!
//! let estimator = TokenEstimator::default();
//! let items = vec![
//!     ContentItem::new("outline", outline_text, 3.0, &estimator),
//!     ContentItem::new("recap", recap_text, 1.0, &estimator).summarizable(true),
//! ];
//!
//! let selection = ContextOptimizer::new(estimator).optimize(items, TokenBudget::new(8_000))?;
//! assert!(selection.used <= 8_000);
//! ```

mod compress;
mod estimator;
mod optimizer;

pub use compress::Compressor;
pub use estimator::{EstimationMethod, TokenEstimator};
pub use optimizer::{
    ContentItem, ContextError, ContextOptimizer, SelectedItem, Selection, TokenBudget, Treatment,
};

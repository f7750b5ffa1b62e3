//! Load-driven feature levels.
//!
//! Under pressure the system keeps admitting work but asks each job to do
//! less of it: smaller context windows and no optional passes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// How much of the generation pipeline a job gets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureLevel {
    /// Full context and every optional pass
    Full,
    /// Trimmed context, optional passes skipped
    Reduced,
    /// Bare minimum context
    Minimal,
}

impl Default for FeatureLevel {
    fn default() -> Self {
        Self::Full
    }
}

impl FeatureLevel {
    /// Scale applied to the context token ceiling.
    pub fn context_multiplier(&self) -> f64 {
        match self {
            FeatureLevel::Full => 1.0,
            FeatureLevel::Reduced => 0.7,
            FeatureLevel::Minimal => 0.4,
        }
    }

    /// Whether optional enrichment passes (style review, continuity notes) run.
    pub fn optional_passes(&self) -> bool {
        matches!(self, FeatureLevel::Full)
    }

    /// Token ceiling for a job at this level.
    pub fn scale_ceiling(&self, maximum: u64) -> u64 {
        (maximum as f64 * self.context_multiplier()).floor() as u64
    }

    /// Pick a level for the current load.
    pub fn for_load(load: f64, load_threshold: f64, critical_threshold: f64) -> Self {
        if load >= critical_threshold {
            FeatureLevel::Minimal
        } else if load >= load_threshold {
            FeatureLevel::Reduced
        } else {
            FeatureLevel::Full
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureLevel::Full => "full",
            FeatureLevel::Reduced => "reduced",
            FeatureLevel::Minimal => "minimal",
        }
    }
}

/// Shared view of how busy the system is.
///
/// The queue depth is pushed by the orchestrator and the running count by
/// the worker pool; admission only reads.
#[derive(Debug)]
pub struct LoadGauge {
    queued: AtomicUsize,
    running: AtomicUsize,
    capacity: usize,
}

impl LoadGauge {
    /// `capacity` is queue capacity plus worker count.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            queued: AtomicUsize::new(0),
            running: AtomicUsize::new(0),
            capacity: capacity.max(1),
        })
    }

    pub fn set_queued(&self, queued: usize) {
        self.queued.store(queued, Ordering::SeqCst);
    }

    pub fn running_started(&self) -> usize {
        self.running.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn running_finished(&self) {
        let _ = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    pub fn queued(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// `(queued + running) / capacity`, capped at 1.0.
    pub fn load(&self) -> f64 {
        ((self.queued() + self.running()) as f64 / self.capacity as f64).min(1.0)
    }
}

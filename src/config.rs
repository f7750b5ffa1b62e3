//! Orchestrator configuration.
//!
//! Values are layered: built-in defaults, then an optional TOML file, then
//! `QUILLFORGE__*` environment variables (e.g. `QUILLFORGE__MAX_PARALLEL=8`).

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "QUILLFORGE";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),

    #[error("failed to render configuration: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Request allowance for a client tier.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    /// Accepted requests allowed per window
    pub requests: u32,
    /// Sliding window length in seconds
    pub window_secs: u64,
    /// Tier-specific burst threshold; falls back to `abuse_burst_threshold`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_threshold: Option<u32>,
}

impl TierLimit {
    pub fn new(requests: u32, window_secs: u64) -> Self {
        Self {
            requests,
            window_secs,
            burst_threshold: None,
        }
    }

    pub fn with_burst_threshold(mut self, threshold: u32) -> Self {
        self.burst_threshold = Some(threshold);
        self
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Configuration for admission, scheduling and retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Number of concurrent workers
    pub max_parallel: usize,
    /// Maximum pending jobs held in the queue
    pub queue_capacity: usize,
    /// Generation attempts per job, counted across restarts
    pub max_retries: u32,
    pub retry_backoff_base_ms: u64,
    pub retry_backoff_max_ms: u64,
    /// Timeout for a single generation call
    pub attempt_timeout_ms: u64,
    /// How long an idle worker waits on the queue before re-checking shutdown
    pub idle_poll_ms: u64,
    /// Token ceiling for one generation context
    pub token_budget_max: u64,
    /// Tier used when a request names an unknown tier
    pub default_tier: String,
    /// Arrivals within `abuse_window_seconds` above which a client is flagged
    pub abuse_burst_threshold: u32,
    pub abuse_window_seconds: u64,
    /// Consecutive near-identical intervals that count as a scripted pattern
    pub abuse_constant_run: u32,
    pub abuse_interval_tolerance_ms: u64,
    /// Intervals shorter than this are left to burst detection
    pub abuse_min_interval_ms: u64,
    /// How long a flagged client stays denied
    pub abuse_cooldown_seconds: u64,
    /// Load fraction at which optional passes are disabled
    pub degradation_load_threshold: f64,
    /// Load fraction at which context is cut to the minimum
    pub degradation_critical_threshold: f64,
    /// Buffered progress events before new ones are dropped
    pub progress_channel_capacity: usize,
    /// Per-tier allowances. Must stay the last field: TOML tables follow plain values.
    pub rate_limit_tiers: BTreeMap<String, TierLimit>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        let mut tiers = BTreeMap::new();
        tiers.insert("free".to_string(), TierLimit::new(10, 60));
        tiers.insert("pro".to_string(), TierLimit::new(60, 60));
        tiers.insert(
            "enterprise".to_string(),
            TierLimit::new(600, 60).with_burst_threshold(200),
        );

        Self {
            max_parallel: 3,
            queue_capacity: 64,
            max_retries: 3,
            retry_backoff_base_ms: 500,
            retry_backoff_max_ms: 30_000,
            attempt_timeout_ms: 120_000,
            idle_poll_ms: 250,
            token_budget_max: 8_000,
            default_tier: "free".to_string(),
            abuse_burst_threshold: 30,
            abuse_window_seconds: 10,
            abuse_constant_run: 6,
            abuse_interval_tolerance_ms: 50,
            abuse_min_interval_ms: 250,
            abuse_cooldown_seconds: 300,
            degradation_load_threshold: 0.75,
            degradation_critical_threshold: 0.95,
            progress_channel_capacity: 256,
            rate_limit_tiers: tiers,
        }
    }
}

impl OrchestratorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load defaults, an optional TOML file and environment overrides, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .separator("__")
                .try_parsing(true),
        );

        let loaded: Self = builder.build()?.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    /// Render as TOML.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        if self.max_parallel == 0 {
            return invalid("max_parallel must be at least 1".into());
        }
        if self.queue_capacity == 0 {
            return invalid("queue_capacity must be at least 1".into());
        }
        if self.max_retries == 0 {
            return invalid("max_retries must be at least 1".into());
        }
        if self.retry_backoff_base_ms > self.retry_backoff_max_ms {
            return invalid(format!(
                "retry_backoff_base_ms ({}) exceeds retry_backoff_max_ms ({})",
                self.retry_backoff_base_ms, self.retry_backoff_max_ms
            ));
        }
        if self.attempt_timeout_ms == 0 {
            return invalid("attempt_timeout_ms must be positive".into());
        }
        if self.token_budget_max == 0 {
            return invalid("token_budget_max must be positive".into());
        }
        if !self.rate_limit_tiers.contains_key(&self.default_tier) {
            return invalid(format!(
                "default_tier '{}' has no entry in rate_limit_tiers",
                self.default_tier
            ));
        }
        for (name, tier) in &self.rate_limit_tiers {
            if tier.requests == 0 || tier.window_secs == 0 {
                return invalid(format!("tier '{}' needs positive requests and window_secs", name));
            }
        }
        if self.abuse_constant_run < 2 {
            return invalid("abuse_constant_run must be at least 2".into());
        }
        let in_unit = |v: f64| v > 0.0 && v <= 1.0;
        if !in_unit(self.degradation_load_threshold)
            || !in_unit(self.degradation_critical_threshold)
        {
            return invalid("degradation thresholds must be in (0, 1]".into());
        }
        if self.degradation_load_threshold > self.degradation_critical_threshold {
            return invalid(
                "degradation_load_threshold exceeds degradation_critical_threshold".into(),
            );
        }
        if self.progress_channel_capacity == 0 {
            return invalid("progress_channel_capacity must be at least 1".into());
        }
        Ok(())
    }

    /// Limit for `tier`, falling back to the default tier.
    pub fn tier_limit(&self, tier: &str) -> &TierLimit {
        self.rate_limit_tiers
            .get(tier)
            .or_else(|| self.rate_limit_tiers.get(&self.default_tier))
            .unwrap_or(&FALLBACK_TIER)
    }

    pub fn retry_backoff_base(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_base_ms)
    }

    pub fn retry_backoff_max(&self) -> Duration {
        Duration::from_millis(self.retry_backoff_max_ms)
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn abuse_window(&self) -> Duration {
        Duration::from_secs(self.abuse_window_seconds)
    }

    pub fn with_max_parallel(mut self, workers: usize) -> Self {
        self.max_parallel = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_max_retries(mut self, attempts: u32) -> Self {
        self.max_retries = attempts;
        self
    }

    pub fn with_retry_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.retry_backoff_base_ms = base.as_millis() as u64;
        self.retry_backoff_max_ms = max.as_millis() as u64;
        self
    }

    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_idle_poll(mut self, poll: Duration) -> Self {
        self.idle_poll_ms = poll.as_millis() as u64;
        self
    }

    pub fn with_token_budget_max(mut self, tokens: u64) -> Self {
        self.token_budget_max = tokens;
        self
    }

    pub fn with_tier(mut self, name: impl Into<String>, limit: TierLimit) -> Self {
        self.rate_limit_tiers.insert(name.into(), limit);
        self
    }

    pub fn with_abuse_burst(mut self, threshold: u32, window_seconds: u64) -> Self {
        self.abuse_burst_threshold = threshold;
        self.abuse_window_seconds = window_seconds;
        self
    }

    pub fn with_abuse_constant_pattern(
        mut self,
        run: u32,
        tolerance: Duration,
        min_interval: Duration,
    ) -> Self {
        self.abuse_constant_run = run;
        self.abuse_interval_tolerance_ms = tolerance.as_millis() as u64;
        self.abuse_min_interval_ms = min_interval.as_millis() as u64;
        self
    }

    pub fn with_abuse_cooldown(mut self, seconds: u64) -> Self {
        self.abuse_cooldown_seconds = seconds;
        self
    }

    pub fn with_degradation_thresholds(mut self, load: f64, critical: f64) -> Self {
        self.degradation_load_threshold = load.clamp(0.0, 1.0);
        self.degradation_critical_threshold = critical.clamp(0.0, 1.0);
        self
    }
}

static FALLBACK_TIER: TierLimit = TierLimit {
    requests: 1,
    window_secs: 60,
    burst_threshold: None,
};

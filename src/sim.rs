//! In-process collaborators for dry runs and tests.
//!
//! [`SimulatedGenerator`] produces deterministic stage text and can be told
//! to fail; [`InMemoryLedger`] prices requests from their target length and
//! keeps per-user balances in memory.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::budget::{ContentItem, TokenEstimator};
use crate::external::{
    Cents, ChargeError, CostLedger, GenerationContext, GenerationError, Generator, ProgressSink,
    SinkError, StageRequest,
};
use crate::job::{GenerationRequest, JobId};
use crate::progress::ProgressEvent;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Model pricing in cents per 1K tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TokenPricing {
    pub input_cents_per_1k: f64,
    pub output_cents_per_1k: f64,
}

impl Default for TokenPricing {
    fn default() -> Self {
        Self {
            input_cents_per_1k: 0.3,  // $0.003 per 1K input
            output_cents_per_1k: 1.5, // $0.015 per 1K output
        }
    }
}

impl TokenPricing {
    /// Cheaper model tier.
    pub fn economy() -> Self {
        Self {
            input_cents_per_1k: 0.025,
            output_cents_per_1k: 0.125,
        }
    }

    /// Cost in cents, rounded up.
    pub fn cost(&self, input_tokens: u64, output_tokens: u64) -> Cents {
        let input_cost = (input_tokens as f64 / 1000.0) * self.input_cents_per_1k;
        let output_cost = (output_tokens as f64 / 1000.0) * self.output_cents_per_1k;
        (input_cost + output_cost).ceil() as Cents
    }
}

#[derive(Debug, Default)]
struct Account {
    remaining: Cents,
    charges: Vec<Cents>,
}

/// Ledger keeping balances in memory.
///
/// Requests are priced as target words of output plus the same amount of
/// context input, with a one cent minimum. Unknown users start with the
/// default budget.
#[derive(Debug)]
pub struct InMemoryLedger {
    pricing: TokenPricing,
    estimator: TokenEstimator,
    flat_cost: Option<Cents>,
    default_budget: Cents,
    charge_outages: AtomicU32,
    accounts: Mutex<HashMap<String, Account>>,
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self {
            pricing: TokenPricing::default(),
            estimator: TokenEstimator::default(),
            flat_cost: None,
            default_budget: 0,
            charge_outages: AtomicU32::new(0),
            accounts: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_pricing(mut self, pricing: TokenPricing) -> Self {
        self.pricing = pricing;
        self
    }

    /// Price every request at `cents` regardless of length.
    pub fn with_flat_cost(mut self, cents: Cents) -> Self {
        self.flat_cost = Some(cents);
        self
    }

    pub fn with_default_budget(mut self, cents: Cents) -> Self {
        self.default_budget = cents;
        self
    }

    /// Answer the next `count` charges with `Unavailable` without debiting.
    pub fn with_charge_outages(self, count: u32) -> Self {
        self.charge_outages.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_budget(self, user_id: impl Into<String>, cents: Cents) -> Self {
        lock(&self.accounts).insert(
            user_id.into(),
            Account {
                remaining: cents,
                charges: Vec::new(),
            },
        );
        self
    }

    /// Amounts charged to `user_id`, oldest first.
    pub fn charges(&self, user_id: &str) -> Vec<Cents> {
        lock(&self.accounts)
            .get(user_id)
            .map(|a| a.charges.clone())
            .unwrap_or_default()
    }

    pub fn total_charges(&self) -> usize {
        lock(&self.accounts).values().map(|a| a.charges.len()).sum()
    }

    pub fn balance(&self, user_id: &str) -> Cents {
        lock(&self.accounts)
            .get(user_id)
            .map(|a| a.remaining)
            .unwrap_or(self.default_budget)
    }
}

#[async_trait]
impl CostLedger for InMemoryLedger {
    async fn estimate_cost(&self, request: &GenerationRequest) -> Cents {
        if let Some(flat) = self.flat_cost {
            return flat;
        }
        let output = self.estimator.estimate_words(request.target_words);
        self.pricing.cost(output, output).max(1)
    }

    async fn remaining_budget(&self, user_id: &str) -> Result<Cents, ChargeError> {
        Ok(self.balance(user_id))
    }

    async fn charge(&self, user_id: &str, amount: Cents) -> Result<(), ChargeError> {
        let outage = self
            .charge_outages
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if outage {
            return Err(ChargeError::Unavailable("simulated ledger outage".to_string()));
        }
        let mut accounts = lock(&self.accounts);
        let account = accounts
            .entry(user_id.to_string())
            .or_insert_with(|| Account {
                remaining: self.default_budget,
                charges: Vec::new(),
            });
        if account.remaining < amount {
            return Err(ChargeError::InsufficientBudget {
                user_id: user_id.to_string(),
                requested: amount,
                remaining: account.remaining,
            });
        }
        account.remaining -= amount;
        account.charges.push(amount);
        Ok(())
    }
}

/// Generator producing `"<payload> / stage n of m"` text.
#[derive(Debug, Default)]
pub struct SimulatedGenerator {
    latency: Duration,
    fatal: Option<String>,
    transient_failures: AtomicU32,
    stage_failures: Mutex<HashMap<u32, u32>>,
    calls: AtomicU32,
    in_flight: AtomicUsize,
    max_concurrent: AtomicUsize,
    stages_run: Mutex<Vec<(JobId, u32)>>,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl SimulatedGenerator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fail the next `count` calls with a transient error.
    pub fn with_transient_failures(self, count: u32) -> Self {
        self.transient_failures.store(count, Ordering::SeqCst);
        self
    }

    /// Fail calls for `stage` (zero-based) `times` times, across all jobs.
    pub fn with_stage_failure(self, stage: u32, times: u32) -> Self {
        lock(&self.stage_failures).insert(stage, times);
        self
    }

    /// Fail every call with a fatal error.
    pub fn with_fatal(mut self, reason: impl Into<String>) -> Self {
        self.fatal = Some(reason.into());
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping `generate` calls seen.
    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent.load(Ordering::SeqCst)
    }

    /// Stages that produced text, in completion order.
    pub fn stages_run(&self) -> Vec<(JobId, u32)> {
        lock(&self.stages_run).clone()
    }

    /// Stages that produced text for `job_id`.
    pub fn stages_for(&self, job_id: JobId) -> Vec<u32> {
        lock(&self.stages_run)
            .iter()
            .filter(|(id, _)| *id == job_id)
            .map(|(_, stage)| *stage)
            .collect()
    }
}

#[async_trait]
impl Generator for SimulatedGenerator {
    async fn gather_context(
        &self,
        request: &StageRequest<'_>,
    ) -> Result<Vec<ContentItem>, GenerationError> {
        let estimator = TokenEstimator::default();
        Ok(vec![ContentItem::new("brief", request.payload, 50.0, &estimator)
            .summarizable(true)
            .truncatable(true)])
    }

    async fn generate(&self, context: &GenerationContext) -> Result<String, GenerationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now_running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let _in_flight = InFlight(&self.in_flight);
        self.max_concurrent.fetch_max(now_running, Ordering::SeqCst);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        if let Some(reason) = &self.fatal {
            return Err(GenerationError::Fatal(reason.clone()));
        }
        let transient = self
            .transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if transient {
            return Err(GenerationError::Transient("simulated provider overload".to_string()));
        }
        {
            let mut failures = lock(&self.stage_failures);
            if let Some(left) = failures.get_mut(&context.stage) {
                if *left > 0 {
                    *left -= 1;
                    return Err(GenerationError::Transient(format!(
                        "simulated failure at stage {}",
                        context.stage
                    )));
                }
            }
        }

        lock(&self.stages_run).push((context.job_id, context.stage));
        debug!(job_id = %context.job_id, stage = context.stage, "simulated stage generated");

        let mut text = format!(
            "{} / stage {} of {}",
            context.payload,
            context.stage + 1,
            context.total_stages
        );
        if context.features.optional_passes() {
            text.push_str(" (polished)");
        }
        Ok(text)
    }
}

/// Sink that keeps every event.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<ProgressEvent> {
        lock(&self.events).clone()
    }
}

#[async_trait]
impl ProgressSink for RecordingSink {
    async fn emit(&self, event: &ProgressEvent) -> Result<(), SinkError> {
        lock(&self.events).push(event.clone());
        Ok(())
    }
}

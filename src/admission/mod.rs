//! Admission control.
//!
//! Every request passes three checks before a job exists: the user's budget
//! (net of reservations held by their unfinished jobs), the client tier's
//! sliding-window rate limit and the abuse heuristics. Accepted jobs are
//! stamped with a [`FeatureLevel`] derived from current load; degradation
//! never turns a request away.

pub mod abuse;
pub mod degradation;
pub mod rate_limit;

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};

use crate::config::OrchestratorConfig;
use crate::external::{Cents, ChargeError, CostLedger};
use crate::job::{BatchId, GenerationRequest, Job, JobId};

pub use abuse::{AbuseDetector, AbuseSettings, AbuseSignal};
pub use degradation::{FeatureLevel, LoadGauge};
pub use rate_limit::RateLimiter;

/// Why a request was turned away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DenialReason {
    BudgetExceeded,
    RateLimited,
    AbuseSuspected,
}

impl DenialReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DenialReason::BudgetExceeded => "BUDGET_EXCEEDED",
            DenialReason::RateLimited => "RATE_LIMITED",
            DenialReason::AbuseSuspected => "ABUSE_SUSPECTED",
        }
    }
}

impl fmt::Display for DenialReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    Accepted(Job),
    Denied(DenialReason),
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        matches!(self, Admission::Accepted(_))
    }

    pub fn denial(&self) -> Option<DenialReason> {
        match self {
            Admission::Denied(reason) => Some(*reason),
            Admission::Accepted(_) => None,
        }
    }
}

/// Estimated costs of admitted, unfinished jobs, per user.
#[derive(Debug, Default)]
struct Reservations {
    by_user: HashMap<String, Cents>,
    by_job: HashMap<JobId, (String, Cents)>,
}

impl Reservations {
    fn held(&self, user_id: &str) -> Cents {
        self.by_user.get(user_id).copied().unwrap_or(0)
    }

    fn hold(&mut self, job_id: JobId, user_id: &str, amount: Cents) {
        if self.by_job.contains_key(&job_id) {
            return;
        }
        *self.by_user.entry(user_id.to_string()).or_insert(0) += amount;
        self.by_job.insert(job_id, (user_id.to_string(), amount));
    }

    fn release(&mut self, job_id: JobId) -> Option<Cents> {
        let (user_id, amount) = self.by_job.remove(&job_id)?;
        if let Some(held) = self.by_user.get_mut(&user_id) {
            *held = held.saturating_sub(amount);
            if *held == 0 {
                self.by_user.remove(&user_id);
            }
        }
        Some(amount)
    }
}

#[derive(Debug)]
struct AdmissionState {
    rate: RateLimiter,
    abuse: AbuseDetector,
    reservations: Reservations,
    decisions: u64,
}

/// Clients are swept from the rate and abuse maps every this many decisions.
const SWEEP_EVERY: u64 = 1024;

pub struct AdmissionController {
    config: Arc<OrchestratorConfig>,
    ledger: Arc<dyn CostLedger>,
    gauge: Arc<LoadGauge>,
    state: Mutex<AdmissionState>,
    /// Serializes budget reads and decisions against charges for one user
    user_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl AdmissionController {
    pub fn new(
        config: Arc<OrchestratorConfig>,
        ledger: Arc<dyn CostLedger>,
        gauge: Arc<LoadGauge>,
    ) -> Self {
        let abuse = AbuseDetector::new(AbuseSettings::from_config(&config));
        Self {
            config,
            ledger,
            gauge,
            state: Mutex::new(AdmissionState {
                rate: RateLimiter::new(),
                abuse,
                reservations: Reservations::default(),
                decisions: 0,
            }),
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_user(&self, user_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = match self.user_locks.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            locks.entry(user_id.to_string()).or_default().clone()
        };
        lock.lock_owned().await
    }

    fn sweep_user_locks(&self) {
        let mut locks = match self.user_locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
    }

    fn state(&self) -> MutexGuard<'_, AdmissionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub async fn admit(&self, request: GenerationRequest, batch_id: BatchId) -> Admission {
        self.admit_at(request, batch_id, Instant::now()).await
    }

    /// Decide on `request` as if it arrived at `now`.
    pub async fn admit_at(
        &self,
        request: GenerationRequest,
        batch_id: BatchId,
        now: Instant,
    ) -> Admission {
        let user_id = request.client.user_id.clone();
        let estimate = self.ledger.estimate_cost(&request).await;
        // Held until the reservation is in place, so a concurrent charge
        // cannot land between the balance read and the decision.
        let _user = self.lock_user(&user_id).await;
        let remaining = match self.ledger.remaining_budget(&user_id).await {
            Ok(remaining) => Some(remaining),
            Err(err) => {
                warn!(user_id = %user_id, error = %err, "budget lookup failed; denying request");
                None
            }
        };

        let features = FeatureLevel::for_load(
            self.gauge.load(),
            self.config.degradation_load_threshold,
            self.config.degradation_critical_threshold,
        );

        let client_id = request.client.client_id.clone();
        let tier = self.config.tier_limit(&request.client.tier).clone();

        let mut state = self.state();
        state.decisions += 1;
        if state.decisions % SWEEP_EVERY == 0 {
            let widest = self
                .config
                .rate_limit_tiers
                .values()
                .map(|t| t.window())
                .max()
                .unwrap_or_default();
            state.rate.sweep(widest, now);
            state.abuse.sweep(now);
            self.sweep_user_locks();
        }

        let abuse = state.abuse.observe(&client_id, tier.burst_threshold, now);

        let available = remaining.map(|r| r.saturating_sub(state.reservations.held(&user_id)));
        let reason = if available.map_or(true, |a| a < estimate) {
            Some(DenialReason::BudgetExceeded)
        } else if !state.rate.allows(&client_id, &tier, now) {
            Some(DenialReason::RateLimited)
        } else if abuse.is_some() {
            Some(DenialReason::AbuseSuspected)
        } else {
            None
        };

        if let Some(reason) = reason {
            drop(state);
            info!(
                client_id = %client_id,
                user_id = %user_id,
                reason = %reason,
                estimate,
                abuse_signal = ?abuse,
                "request denied"
            );
            return Admission::Denied(reason);
        }

        let job = Job::from_request(request, batch_id, estimate, features);
        state.rate.record(&client_id, &tier, now);
        state.reservations.hold(job.id, &user_id, estimate);
        drop(state);

        debug!(
            job_id = %job.id,
            client_id = %client_id,
            estimate,
            features = features.as_str(),
            "request admitted"
        );
        Admission::Accepted(job)
    }

    /// Hold the estimated cost of a job admitted elsewhere (recovery).
    pub fn reserve(&self, job: &Job) {
        self.state()
            .reservations
            .hold(job.id, &job.client.user_id, job.estimated_cost);
    }

    /// Drop the reservation of a job that reached a terminal status.
    pub fn release(&self, job_id: JobId) -> Option<Cents> {
        self.state().reservations.release(job_id)
    }

    /// Charge a finished job and drop its reservation, under the user's
    /// admission lock.
    ///
    /// The reservation is kept when the ledger is unavailable so the job's
    /// cost keeps counting against the user until the charge lands.
    pub async fn settle(&self, job: &Job) -> Result<(), ChargeError> {
        let _user = self.lock_user(&job.client.user_id).await;
        let result = self.ledger.charge(&job.client.user_id, job.estimated_cost).await;
        if !matches!(result, Err(ChargeError::Unavailable(_))) {
            self.release(job.id);
        }
        result
    }

    /// Cents currently reserved for `user_id`.
    pub fn reserved(&self, user_id: &str) -> Cents {
        self.state().reservations.held(user_id)
    }

    pub fn gauge(&self) -> &Arc<LoadGauge> {
        &self.gauge
    }
}

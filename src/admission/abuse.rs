//! Heuristics for scripted or abusive clients.
//!
//! Two signals are tracked per client over every arrival, accepted or not:
//! bursts (too many arrivals inside the abuse window) and metronomic traffic
//! (a run of near-identical gaps between arrivals). A flagged client stays
//! flagged for the cooldown period.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::OrchestratorConfig;

/// Why a client was flagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbuseSignal {
    Burst { arrivals: usize, threshold: u32 },
    ConstantInterval { interval_ms: u64 },
    /// Flag raised earlier and still cooling down
    Cooldown,
}

#[derive(Debug, Clone)]
pub struct AbuseSettings {
    pub window: Duration,
    pub burst_threshold: u32,
    pub constant_run: usize,
    pub interval_tolerance: Duration,
    pub min_interval: Duration,
    pub cooldown: Duration,
}

impl AbuseSettings {
    pub fn from_config(config: &OrchestratorConfig) -> Self {
        Self {
            window: config.abuse_window(),
            burst_threshold: config.abuse_burst_threshold,
            constant_run: config.abuse_constant_run.max(2) as usize,
            interval_tolerance: Duration::from_millis(config.abuse_interval_tolerance_ms),
            min_interval: Duration::from_millis(config.abuse_min_interval_ms),
            cooldown: Duration::from_secs(config.abuse_cooldown_seconds),
        }
    }
}

#[derive(Debug, Default)]
struct ClientActivity {
    in_window: VecDeque<Instant>,
    /// Last `constant_run + 1` arrivals regardless of window
    recent: VecDeque<Instant>,
    flagged_until: Option<Instant>,
}

#[derive(Debug)]
pub struct AbuseDetector {
    settings: AbuseSettings,
    clients: HashMap<String, ClientActivity>,
}

impl AbuseDetector {
    pub fn new(settings: AbuseSettings) -> Self {
        Self {
            settings,
            clients: HashMap::new(),
        }
    }

    pub fn settings(&self) -> &AbuseSettings {
        &self.settings
    }

    /// Log an arrival and report whether the client is now flagged.
    ///
    /// `tier_burst` overrides the global burst threshold for this client's tier.
    pub fn observe(
        &mut self,
        client_id: &str,
        tier_burst: Option<u32>,
        now: Instant,
    ) -> Option<AbuseSignal> {
        let settings = &self.settings;
        let activity = self.clients.entry(client_id.to_string()).or_default();

        while let Some(&oldest) = activity.in_window.front() {
            if now.saturating_duration_since(oldest) >= settings.window {
                activity.in_window.pop_front();
            } else {
                break;
            }
        }
        activity.in_window.push_back(now);
        activity.recent.push_back(now);
        while activity.recent.len() > settings.constant_run + 1 {
            activity.recent.pop_front();
        }

        let threshold = tier_burst.unwrap_or(settings.burst_threshold);
        let signal = if activity.in_window.len() > threshold as usize {
            Some(AbuseSignal::Burst {
                arrivals: activity.in_window.len(),
                threshold,
            })
        } else {
            constant_interval(&activity.recent, settings)
                .map(|interval| AbuseSignal::ConstantInterval {
                    interval_ms: interval.as_millis() as u64,
                })
        };

        match signal {
            Some(signal) => {
                activity.flagged_until = Some(now + settings.cooldown);
                Some(signal)
            }
            None => match activity.flagged_until {
                Some(until) if now < until => Some(AbuseSignal::Cooldown),
                Some(_) => {
                    activity.flagged_until = None;
                    None
                }
                None => None,
            },
        }
    }

    pub fn is_flagged(&self, client_id: &str, now: Instant) -> bool {
        self.clients
            .get(client_id)
            .and_then(|a| a.flagged_until)
            .is_some_and(|until| now < until)
    }

    /// Forget clients with no recent arrivals and no active flag.
    pub fn sweep(&mut self, now: Instant) {
        let window = self.settings.window;
        self.clients.retain(|_, activity| {
            let active = activity
                .recent
                .back()
                .is_some_and(|&last| now.saturating_duration_since(last) < window);
            let flagged = activity.flagged_until.is_some_and(|until| now < until);
            active || flagged
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

/// Mean gap when the last `constant_run` gaps are all within tolerance of each
/// other and not shorter than the minimum interval.
fn constant_interval(recent: &VecDeque<Instant>, settings: &AbuseSettings) -> Option<Duration> {
    if recent.len() < settings.constant_run + 1 {
        return None;
    }
    let gaps: Vec<Duration> = recent
        .iter()
        .zip(recent.iter().skip(1))
        .map(|(a, b)| b.saturating_duration_since(*a))
        .collect();
    let shortest = gaps.iter().min()?;
    let longest = gaps.iter().max()?;
    if *longest - *shortest > settings.interval_tolerance {
        return None;
    }
    let mean = gaps.iter().sum::<Duration>() / gaps.len() as u32;
    (mean >= settings.min_interval).then_some(mean)
}

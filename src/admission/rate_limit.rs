//! Sliding-window request counting per client.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::TierLimit;

/// Timestamps of accepted requests, per client id.
#[derive(Debug, Default)]
pub struct RateLimiter {
    accepted: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    fn prune(log: &mut VecDeque<Instant>, window: Duration, now: Instant) {
        while let Some(&oldest) = log.front() {
            if now.saturating_duration_since(oldest) >= window {
                log.pop_front();
            } else {
                break;
            }
        }
    }

    /// Accepted requests for `client_id` inside the window ending at `now`.
    pub fn in_window(&mut self, client_id: &str, limit: &TierLimit, now: Instant) -> usize {
        match self.accepted.get_mut(client_id) {
            Some(log) => {
                Self::prune(log, limit.window(), now);
                log.len()
            }
            None => 0,
        }
    }

    /// Whether one more request fits under `limit`.
    pub fn allows(&mut self, client_id: &str, limit: &TierLimit, now: Instant) -> bool {
        self.in_window(client_id, limit, now) < limit.requests as usize
    }

    /// Count an accepted request.
    pub fn record(&mut self, client_id: &str, limit: &TierLimit, now: Instant) {
        let log = self.accepted.entry(client_id.to_string()).or_default();
        Self::prune(log, limit.window(), now);
        log.push_back(now);
    }

    /// Drop clients whose windows are empty.
    pub fn sweep(&mut self, max_window: Duration, now: Instant) {
        self.accepted.retain(|_, log| {
            Self::prune(log, max_window, now);
            !log.is_empty()
        });
    }

    pub fn tracked_clients(&self) -> usize {
        self.accepted.len()
    }
}

//! Per-identity attempt throttling and advisory anomaly log.

use crate::clock::Clock;
use crate::config::GuardConfig;
use crate::types::{AnomalyEvent, AnomalyKind};
use chrono::{DateTime, Local, NaiveDate, TimeDelta};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

pub const DEFAULT_LOCATION: &str = "local";

/// Result of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub reason: String,
}

#[derive(Default)]
struct GuardState {
    /// Attempt times, trimmed to the rate window.
    attempts: HashMap<String, VecDeque<DateTime<Local>>>,
    /// Where attempts came from, trimmed to the location window.
    locations: HashMap<String, VecDeque<(DateTime<Local>, String)>>,
    anomalies: Vec<AnomalyEvent>,
}

/// Sliding-window attempt tracker. Every recorded attempt counts against the
/// cap, successful or not: rapid re-scanning is itself the suspicious signal.
pub struct AnomalyGuard {
    config: GuardConfig,
    clock: Arc<dyn Clock>,
    state: Mutex<GuardState>,
}

impl AnomalyGuard {
    pub fn new(config: GuardConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            state: Mutex::new(GuardState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn window(&self) -> TimeDelta {
        TimeDelta::from_std(self.config.window()).unwrap_or(TimeDelta::MAX)
    }

    /// Deny once `max_attempts` attempts fall inside the window. A denial is
    /// itself logged as a `RATE_LIMIT` anomaly.
    pub fn check_rate_limit(&self, identity_id: &str) -> RateDecision {
        let now = self.clock.now();
        let window = self.window();
        let mut state = self.lock();

        let recent = state.attempts.entry(identity_id.to_string()).or_default();
        while recent.front().is_some_and(|at| now - *at >= window) {
            recent.pop_front();
        }

        if recent.len() >= self.config.max_attempts {
            let reason = format!(
                "too many attempts; wait {} minutes",
                self.config.window_secs.div_ceil(60)
            );
            push_anomaly(
                &mut state,
                identity_id,
                AnomalyKind::RateLimit,
                format!("{} attempts within {}s", self.config.max_attempts, self.config.window_secs),
                now,
            );
            tracing::warn!(identity = identity_id, "rate limit hit");
            return RateDecision {
                allowed: false,
                reason,
            };
        }
        RateDecision {
            allowed: true,
            reason: String::new(),
        }
    }

    /// Record an attempt from `location`. Seeing more than one distinct
    /// location inside the location window logs a `LOCATION_ANOMALY`.
    pub fn record_attempt(&self, identity_id: &str, success: bool, location: &str) {
        let now = self.clock.now();
        let loc_window =
            TimeDelta::from_std(self.config.location_window()).unwrap_or(TimeDelta::MAX);
        let mut state = self.lock();

        state
            .attempts
            .entry(identity_id.to_string())
            .or_default()
            .push_back(now);

        let seen = state.locations.entry(identity_id.to_string()).or_default();
        while seen.front().is_some_and(|(at, _)| now - *at >= loc_window) {
            seen.pop_front();
        }
        seen.push_back((now, location.to_string()));
        let multi_location = seen.iter().any(|(_, l)| l != location);

        tracing::debug!(identity = identity_id, success, location, "attempt recorded");
        if multi_location {
            push_anomaly(
                &mut state,
                identity_id,
                AnomalyKind::LocationAnomaly,
                format!(
                    "multiple locations within {} minutes",
                    self.config.location_window_secs / 60
                ),
                now,
            );
        }
    }

    pub fn log_anomaly(&self, identity_id: &str, kind: AnomalyKind, description: &str) {
        let now = self.clock.now();
        push_anomaly(&mut self.lock(), identity_id, kind, description.to_string(), now);
    }

    /// Newest first.
    pub fn recent_anomalies(&self, count: usize) -> Vec<AnomalyEvent> {
        self.lock().anomalies.iter().rev().take(count).cloned().collect()
    }

    pub fn anomalies_on(&self, date: NaiveDate) -> usize {
        self.lock()
            .anomalies
            .iter()
            .filter(|a| a.timestamp.date_naive() == date)
            .count()
    }
}

fn push_anomaly(
    state: &mut GuardState,
    identity_id: &str,
    kind: AnomalyKind,
    description: String,
    now: DateTime<Local>,
) {
    tracing::info!(identity = identity_id, %kind, %description, "anomaly logged");
    state.anomalies.push(AnomalyEvent {
        identity_id: identity_id.to_string(),
        kind,
        description,
        timestamp: now,
    });
}

//! Per-PR circuit breaker (§4.5): trips after too many consecutive failures,
//! resets after a cooldown, and escalates when it trips repeatedly across
//! the fleet.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::warn;

/// State tracked for a single PR's breaker.
#[derive(Debug, Clone, Default)]
struct BreakerEntry {
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
}

/// Tracks trips across the fleet for the 1-hour escalation window.
#[derive(Debug, Default)]
struct EscalationState {
    trips_in_window: Vec<DateTime<Utc>>,
    last_escalated_at: Option<DateTime<Utc>>,
}

/// `true` when the breaker for a PR with `failure_count` failures, the most
/// recent at `last_failure_at`, should currently block further attempts.
/// A breaker resets itself once `reset_timeout` has elapsed since the last
/// failure, even without an explicit `record_success` call.
pub fn is_open(
    failure_count: u32,
    last_failure_at: Option<DateTime<Utc>>,
    max_failures: u32,
    reset_timeout: std::time::Duration,
) -> bool {
    if failure_count < max_failures {
        return false;
    }
    match last_failure_at {
        Some(at) => Utc::now() - at < ChronoDuration::seconds(reset_timeout.as_secs() as i64),
        None => true,
    }
}

/// Escalation threshold: 3 or more trips inside a rolling 1-hour window
/// raise a single escalation event, then enter a 1-hour cooldown so a
/// noisy deployment doesn't flood logs.
const ESCALATION_TRIP_THRESHOLD: usize = 3;
const ESCALATION_WINDOW: ChronoDuration = ChronoDuration::hours(1);
const ESCALATION_COOLDOWN: ChronoDuration = ChronoDuration::hours(1);

/// Per-deployment circuit breaker registry. One instance is shared by the
/// controller across all tracked PRs.
#[derive(Default)]
pub struct CircuitBreaker {
    entries: Mutex<HashMap<i64, BreakerEntry>>,
    escalation: Mutex<EscalationState>,
    max_failures: u32,
    reset_timeout: std::time::Duration,
}

impl CircuitBreaker {
    pub fn new(max_failures: u32, reset_timeout: std::time::Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            escalation: Mutex::new(EscalationState::default()),
            max_failures,
            reset_timeout,
        }
    }

    /// `true` if the PR's breaker currently blocks further merge/CI attempts.
    pub fn is_open(&self, pr_id: i64) -> bool {
        let entries = self.entries.lock().unwrap();
        match entries.get(&pr_id) {
            Some(entry) => is_open(entry.failure_count, entry.last_failure_at, self.max_failures, self.reset_timeout),
            None => false,
        }
    }

    /// Records a failure for `pr_id`, tripping the breaker if this pushes it
    /// over `max_failures`, and rolling an escalation check. A failure older
    /// than `reset_timeout` doesn't carry forward: the counter restarts at 1
    /// rather than accumulating across a cooldown that already elapsed.
    pub fn record_failure(&self, pr_id: i64) {
        let tripped_now = {
            let mut entries = self.entries.lock().unwrap();
            let entry = entries.entry(pr_id).or_default();
            let stale = Utc::now() - entry.last_failure_at.unwrap_or(DateTime::<Utc>::MIN_UTC)
                > ChronoDuration::seconds(self.reset_timeout.as_secs() as i64);
            if stale {
                entry.failure_count = 0;
            }
            entry.failure_count += 1;
            entry.last_failure_at = Some(Utc::now());
            entry.failure_count == self.max_failures
        };

        if tripped_now {
            warn!(pr_id, max_failures = self.max_failures, "circuit breaker tripped");
            self.record_trip_and_maybe_escalate();
        }
    }

    pub fn record_success(&self, pr_id: i64) {
        let mut entries = self.entries.lock().unwrap();
        entries.remove(&pr_id);
    }

    /// Current failure count for `pr_id`, for durable persistence.
    pub fn failure_count(&self, pr_id: i64) -> u32 {
        self.entries.lock().unwrap().get(&pr_id).map(|e| e.failure_count).unwrap_or(0)
    }

    /// Seeds a PR's breaker state directly from persisted values, bypassing
    /// `record_failure`'s stale-reset and escalation bookkeeping — used by
    /// startup recovery so a restart doesn't restamp `last_failure_at` to
    /// now and reset every recovered PR's cooldown timer.
    pub fn seed(&self, pr_id: i64, failure_count: u32, last_failure_at: Option<DateTime<Utc>>) {
        if failure_count == 0 {
            return;
        }
        let mut entries = self.entries.lock().unwrap();
        entries.insert(pr_id, BreakerEntry { failure_count, last_failure_at });
    }

    fn record_trip_and_maybe_escalate(&self) {
        let mut escalation = self.escalation.lock().unwrap();
        let now = Utc::now();
        escalation.trips_in_window.retain(|t| now - *t < ESCALATION_WINDOW);
        escalation.trips_in_window.push(now);

        if escalation.trips_in_window.len() < ESCALATION_TRIP_THRESHOLD {
            return;
        }
        if let Some(last) = escalation.last_escalated_at {
            if now - last < ESCALATION_COOLDOWN {
                return;
            }
        }

        escalation.last_escalated_at = Some(now);
        warn!(
            trips_in_window = escalation.trips_in_window.len(),
            "circuit breaker escalation: repeated trips across the fleet in the last hour"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stays_closed_below_threshold() {
        assert!(!is_open(2, Some(Utc::now()), 3, std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn opens_once_threshold_reached() {
        assert!(is_open(3, Some(Utc::now()), 3, std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn resets_after_timeout_elapses() {
        let long_ago = Utc::now() - ChronoDuration::seconds(7200);
        assert!(!is_open(5, Some(long_ago), 3, std::time::Duration::from_secs(3600)));
    }

    #[test]
    fn registry_tracks_independent_prs() {
        let breaker = CircuitBreaker::new(2, std::time::Duration::from_secs(3600));
        breaker.record_failure(1);
        breaker.record_failure(1);
        breaker.record_failure(2);

        assert!(breaker.is_open(1));
        assert!(!breaker.is_open(2));
    }

    #[test]
    fn success_clears_the_entry() {
        let breaker = CircuitBreaker::new(1, std::time::Duration::from_secs(3600));
        breaker.record_failure(1);
        assert!(breaker.is_open(1));

        breaker.record_success(1);
        assert!(!breaker.is_open(1));
    }

    #[test]
    fn record_failure_restarts_the_counter_once_stale() {
        let breaker = CircuitBreaker::new(3, std::time::Duration::from_secs(60));
        breaker.seed(1, 2, Some(Utc::now() - ChronoDuration::seconds(3600)));

        breaker.record_failure(1);
        assert_eq!(breaker.failure_count(1), 1);
        assert!(!breaker.is_open(1));
    }

    #[test]
    fn seed_restores_persisted_state_without_touching_the_clock() {
        let breaker = CircuitBreaker::new(2, std::time::Duration::from_secs(3600));
        let last_at = Utc::now() - ChronoDuration::seconds(30);
        breaker.seed(1, 2, Some(last_at));

        assert_eq!(breaker.failure_count(1), 2);
        assert!(breaker.is_open(1));
    }

    #[test]
    fn escalation_fires_after_three_trips_in_the_window() {
        let breaker = CircuitBreaker::new(1, std::time::Duration::from_secs(3600));
        for pr_id in 1..=3 {
            breaker.record_failure(pr_id);
        }
        let escalation = breaker.escalation.lock().unwrap();
        assert_eq!(escalation.trips_in_window.len(), 3);
        assert!(escalation.last_escalated_at.is_some());
    }
}

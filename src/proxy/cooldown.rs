//! Per-service circuit breaker for the paid tier
//!
//! A failed precheck opens a flat suppression window for that service. There
//! is no escalation: the next failure simply overwrites the window, and a
//! successful precheck never re-triggers it.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::debug;

use crate::clock::SharedClock;

/// Tracks when each service may attempt paid proxies again
#[derive(Debug)]
pub struct ServiceCooldownTracker {
    until: DashMap<String, Instant>,
    clock: SharedClock,
}

impl ServiceCooldownTracker {
    pub fn new(clock: SharedClock) -> Self {
        Self {
            until: DashMap::new(),
            clock,
        }
    }

    /// Suppress paid attempts for `service` for `duration` from now
    pub fn cooldown(&self, service: &str, duration: Duration) {
        let until = self.clock.now() + duration;
        self.until.insert(service.to_lowercase(), until);
        debug!(service, cooldown_ms = duration.as_millis() as u64, "Service cooling down");
    }

    pub fn is_cooling_down(&self, service: &str) -> bool {
        self.remaining(service).is_some()
    }

    /// Time left in the window, if one is open
    pub fn remaining(&self, service: &str) -> Option<Duration> {
        let now = self.clock.now();
        self.until
            .get(&service.to_lowercase())
            .and_then(|until| until.checked_duration_since(now))
            .filter(|left| !left.is_zero())
    }

    /// Services with an open window
    pub fn cooling_services(&self) -> Vec<String> {
        let now = self.clock.now();
        let mut services: Vec<String> = self
            .until
            .iter()
            .filter(|entry| now < *entry.value())
            .map(|entry| entry.key().clone())
            .collect();
        services.sort();
        services
    }

    /// Drop expired windows. Returns how many were removed.
    pub fn prune(&self) -> usize {
        let now = self.clock.now();
        let before = self.until.len();
        self.until.retain(|_, until| now < *until);
        before.saturating_sub(self.until.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    fn tracker() -> (Arc<ManualClock>, ServiceCooldownTracker) {
        let clock = Arc::new(ManualClock::new());
        let tracker = ServiceCooldownTracker::new(clock.clone());
        (clock, tracker)
    }

    #[test]
    fn test_cooldown_window() {
        let (clock, tracker) = tracker();
        assert!(!tracker.is_cooling_down("chase"));

        tracker.cooldown("chase", Duration::from_millis(600_000));

        clock.set_elapsed(Duration::from_millis(300_000));
        assert!(tracker.is_cooling_down("chase"));
        assert_eq!(
            tracker.remaining("chase"),
            Some(Duration::from_millis(300_000))
        );

        clock.set_elapsed(Duration::from_millis(600_000));
        assert!(!tracker.is_cooling_down("chase"));

        clock.set_elapsed(Duration::from_millis(600_001));
        assert!(!tracker.is_cooling_down("chase"));
    }

    #[test]
    fn test_cooldown_overwrites_and_is_case_insensitive() {
        let (clock, tracker) = tracker();

        tracker.cooldown("Chase", Duration::from_secs(600));
        clock.advance(Duration::from_secs(500));
        tracker.cooldown("chase", Duration::from_secs(60));

        assert!(tracker.is_cooling_down("CHASE"));
        clock.advance(Duration::from_secs(61));
        assert!(!tracker.is_cooling_down("chase"));
    }

    #[test]
    fn test_prune_and_listing() {
        let (clock, tracker) = tracker();
        tracker.cooldown("zillow", Duration::from_secs(10));
        tracker.cooldown("chase", Duration::from_secs(100));
        assert_eq!(tracker.cooling_services(), vec!["chase", "zillow"]);

        clock.advance(Duration::from_secs(20));
        assert_eq!(tracker.cooling_services(), vec!["chase"]);
        assert_eq!(tracker.prune(), 1);
        assert_eq!(tracker.prune(), 0);
        assert!(tracker.is_cooling_down("chase"));
    }
}

//! Per-agent circuit breaker.

use chrono::{DateTime, Duration, Utc};

use fleetrun_core::{CircuitState, TaskId};

use crate::config::FaultConfig;

/// Breaker thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BreakerSettings {
    pub failure_threshold: u32,
    pub cooldown: Duration,
    pub max_cooldown: Duration,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self::from(&FaultConfig::default())
    }
}

impl From<&FaultConfig> for BreakerSettings {
    fn from(config: &FaultConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            cooldown: Duration::seconds(config.cooldown_secs as i64),
            max_cooldown: Duration::seconds(config.max_cooldown_secs as i64),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum State {
    Closed,
    Open { until: DateTime<Utc> },
    HalfOpen { probe: Option<TaskId> },
}

/// Closed -> Open after `failure_threshold` consecutive failures; Open ->
/// HalfOpen once the cooldown elapses; HalfOpen admits a single probe whose
/// outcome closes the breaker or reopens it with a doubled cooldown.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    settings: BreakerSettings,
    state: State,
    consecutive_failures: u32,
    cooldown: Duration,
    last_state_change: DateTime<Utc>,
}

impl CircuitBreaker {
    pub fn new(settings: BreakerSettings, now: DateTime<Utc>) -> Self {
        Self {
            settings,
            state: State::Closed,
            consecutive_failures: 0,
            cooldown: settings.cooldown,
            last_state_change: now,
        }
    }

    pub fn state(&self) -> CircuitState {
        match self.state {
            State::Closed => CircuitState::Closed,
            State::Open { .. } => CircuitState::Open,
            State::HalfOpen { .. } => CircuitState::HalfOpen,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn last_state_change(&self) -> DateTime<Utc> {
        self.last_state_change
    }

    /// Cooldown the next opening will use.
    pub fn current_cooldown(&self) -> Duration {
        self.cooldown
    }

    fn set_state(&mut self, state: State, now: DateTime<Utc>) {
        self.state = state;
        self.last_state_change = now;
    }

    /// Whether a new task may be dispatched to the agent.
    ///
    /// Moves an expired Open breaker to HalfOpen.
    pub fn allows_dispatch(&mut self, now: DateTime<Utc>) -> bool {
        if let State::Open { until } = self.state {
            if now >= until {
                self.set_state(State::HalfOpen { probe: None }, now);
            }
        }
        matches!(self.state, State::Closed | State::HalfOpen { probe: None })
    }

    /// Note a dispatch. In HalfOpen this takes the single probe slot.
    pub fn on_dispatch(&mut self, task_id: &TaskId) {
        if let State::HalfOpen { probe } = &mut self.state {
            if probe.is_none() {
                *probe = Some(task_id.clone());
            }
        }
    }

    /// Free the probe slot when the probe ended without an outcome.
    pub fn release_probe(&mut self, task_id: &TaskId) {
        if let State::HalfOpen { probe } = &mut self.state {
            if probe.as_ref() == Some(task_id) {
                *probe = None;
            }
        }
    }

    pub fn record_success(&mut self, now: DateTime<Utc>) {
        self.consecutive_failures = 0;
        self.cooldown = self.settings.cooldown;
        if self.state != State::Closed {
            self.set_state(State::Closed, now);
        }
    }

    /// Record a failure. Returns true if this failure opened the breaker.
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        match self.state {
            State::Closed if self.consecutive_failures >= self.settings.failure_threshold => {
                self.open(now);
                true
            }
            State::HalfOpen { .. } => {
                self.cooldown = (self.cooldown * 2).min(self.settings.max_cooldown);
                self.open(now);
                true
            }
            _ => false,
        }
    }

    fn open(&mut self, now: DateTime<Utc>) {
        let until = now + self.cooldown;
        self.set_state(State::Open { until }, now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(now: DateTime<Utc>) -> CircuitBreaker {
        CircuitBreaker::new(BreakerSettings::default(), now)
    }

    fn trip(b: &mut CircuitBreaker, now: DateTime<Utc>) {
        for _ in 0..5 {
            b.record_failure(now);
        }
    }

    #[test]
    fn test_opens_after_threshold() {
        let now = Utc::now();
        let mut b = breaker(now);
        for _ in 0..4 {
            assert!(!b.record_failure(now));
        }
        assert!(b.allows_dispatch(now));
        assert!(b.record_failure(now));
        assert_eq!(b.state(), CircuitState::Open);
        assert!(!b.allows_dispatch(now + Duration::seconds(59)));
    }

    #[test]
    fn test_success_resets_consecutive_count() {
        let now = Utc::now();
        let mut b = breaker(now);
        for _ in 0..4 {
            b.record_failure(now);
        }
        b.record_success(now);
        assert!(!b.record_failure(now));
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[test]
    fn test_half_open_admits_one_probe() {
        let now = Utc::now();
        let mut b = breaker(now);
        trip(&mut b, now);

        let later = now + Duration::seconds(60);
        assert!(b.allows_dispatch(later));
        assert_eq!(b.state(), CircuitState::HalfOpen);
        b.on_dispatch(&TaskId::new("probe"));
        assert!(!b.allows_dispatch(later));

        b.release_probe(&TaskId::new("probe"));
        assert!(b.allows_dispatch(later));
    }

    #[test]
    fn test_probe_success_closes_and_resets_cooldown() {
        let now = Utc::now();
        let mut b = breaker(now);
        trip(&mut b, now);
        let t = now + Duration::seconds(60);
        b.allows_dispatch(t);
        b.record_failure(t);
        assert_eq!(b.current_cooldown(), Duration::seconds(120));

        let t = t + Duration::seconds(120);
        assert!(b.allows_dispatch(t));
        b.record_success(t);
        assert_eq!(b.state(), CircuitState::Closed);
        assert_eq!(b.current_cooldown(), Duration::seconds(60));
    }

    #[test]
    fn test_failed_probes_double_cooldown_up_to_cap() {
        let mut now = Utc::now();
        let mut b = breaker(now);
        trip(&mut b, now);

        let mut cooldowns = Vec::new();
        for _ in 0..6 {
            now += b.current_cooldown();
            assert!(b.allows_dispatch(now));
            b.record_failure(now);
            cooldowns.push(b.current_cooldown().num_seconds());
        }
        assert_eq!(cooldowns, vec![120, 240, 480, 600, 600, 600]);
    }
}

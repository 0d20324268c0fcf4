//! Circuit breaker shared by the model and search clients
//!
//! Each operation label ("coordinate", "search", ...) has its own
//! breaker so one failing call site does not block the others.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Reset timeout elapsed; the next call is a probe
    HalfOpen,
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: BreakerState,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: usize,
    pub reset_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            reset_timeout: Duration::from_secs(30),
        }
    }
}

/// Per-operation circuit breaker
pub struct CircuitBreaker {
    entries: Mutex<HashMap<String, BreakerEntry>>,
    config: CircuitBreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            config,
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, BreakerEntry>> {
        // A panic while holding the lock leaves plain counters behind; keep using them.
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Whether calls for `operation` should be rejected right now
    pub fn is_open(&self, operation: &str) -> bool {
        let mut entries = self.entries();
        let entry = entries.entry(operation.to_string()).or_default();

        match entry.state {
            BreakerState::Closed | BreakerState::HalfOpen => false,
            BreakerState::Open => match entry.opened_at {
                Some(opened_at) if opened_at.elapsed() >= self.config.reset_timeout => {
                    entry.state = BreakerState::HalfOpen;
                    false
                }
                _ => true,
            },
        }
    }

    pub fn mark_success(&self, operation: &str) {
        let mut entries = self.entries();
        entries.insert(operation.to_string(), BreakerEntry::default());
    }

    pub fn mark_failure(&self, operation: &str) {
        let mut entries = self.entries();
        let entry = entries.entry(operation.to_string()).or_default();

        entry.consecutive_failures += 1;

        // A failed probe reopens immediately
        if entry.state == BreakerState::HalfOpen
            || entry.consecutive_failures >= self.config.failure_threshold
        {
            entry.state = BreakerState::Open;
            entry.opened_at = Some(Instant::now());
        }
    }

    pub fn state(&self, operation: &str) -> BreakerState {
        self.entries()
            .get(operation)
            .map(|e| e.state)
            .unwrap_or(BreakerState::Closed)
    }

    pub fn failure_count(&self, operation: &str) -> usize {
        self.entries()
            .get(operation)
            .map(|e| e.consecutive_failures)
            .unwrap_or(0)
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}

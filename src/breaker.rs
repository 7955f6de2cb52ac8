//! Per-agent circuit breakers.
//!
//! An agent whose votes fail `failure_threshold` times in a row (errors,
//! timeouts, mis-signed votes) is skipped: it abstains without being called
//! until `cooldown_ms` has passed. The next call after the cooldown is a
//! single trial. A successful trial closes the circuit; a failed one opens
//! it again for another cooldown.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// State change worth reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitTransition {
    Opened {
        consecutive_failures: u32,
        retry_at_ms: i64,
    },
    Closed,
}

#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    cooldown_ms: i64,
    state: CircuitState,
    consecutive_failures: u32,
    opened_at_ms: i64,
    trial_in_flight: bool,
}

impl CircuitBreaker {
    pub fn new(config: &BreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold.max(1),
            cooldown_ms: i64::try_from(config.cooldown_ms).unwrap_or(i64::MAX),
            state: CircuitState::Closed,
            consecutive_failures: 0,
            opened_at_ms: 0,
            trial_in_flight: false,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn retry_at_ms(&self) -> i64 {
        self.opened_at_ms.saturating_add(self.cooldown_ms)
    }

    /// Whether the agent may be called now. Moves an expired open circuit
    /// to half-open and hands out its one trial call.
    pub fn allow(&mut self, now_ms: i64) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open if now_ms >= self.retry_at_ms() => {
                self.state = CircuitState::HalfOpen;
                self.trial_in_flight = true;
                true
            }
            CircuitState::Open => false,
            CircuitState::HalfOpen if !self.trial_in_flight => {
                self.trial_in_flight = true;
                true
            }
            CircuitState::HalfOpen => false,
        }
    }

    pub fn record_success(&mut self) -> Option<CircuitTransition> {
        let was = self.state;
        self.state = CircuitState::Closed;
        self.consecutive_failures = 0;
        self.trial_in_flight = false;
        (was != CircuitState::Closed).then_some(CircuitTransition::Closed)
    }

    pub fn record_failure(&mut self, now_ms: i64) -> Option<CircuitTransition> {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        let opens = match self.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => self.consecutive_failures >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if !opens {
            return None;
        }
        self.state = CircuitState::Open;
        self.opened_at_ms = now_ms;
        self.trial_in_flight = false;
        Some(CircuitTransition::Opened {
            consecutive_failures: self.consecutive_failures,
            retry_at_ms: self.retry_at_ms(),
        })
    }

    /// The trial call was abandoned without a result; allow another.
    pub fn release_trial(&mut self) {
        self.trial_in_flight = false;
    }
}

/// Breakers for every agent the engine has called, keyed by agent id.
#[derive(Debug, Clone)]
pub struct BreakerBoard {
    config: BreakerConfig,
    breakers: BTreeMap<String, CircuitBreaker>,
}

impl BreakerBoard {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: BTreeMap::new(),
        }
    }

    fn breaker(&mut self, agent_id: &str) -> &mut CircuitBreaker {
        let config = &self.config;
        self.breakers
            .entry(agent_id.to_string())
            .or_insert_with(|| CircuitBreaker::new(config))
    }

    pub fn allow(&mut self, agent_id: &str, now_ms: i64) -> bool {
        !self.config.enabled || self.breaker(agent_id).allow(now_ms)
    }

    pub fn record(&mut self, agent_id: &str, ok: bool, now_ms: i64) -> Option<CircuitTransition> {
        if !self.config.enabled {
            return None;
        }
        let breaker = self.breaker(agent_id);
        if ok {
            breaker.record_success()
        } else {
            breaker.record_failure(now_ms)
        }
    }

    pub fn release_trial(&mut self, agent_id: &str) {
        if let Some(breaker) = self.breakers.get_mut(agent_id) {
            breaker.release_trial();
        }
    }

    pub fn state(&self, agent_id: &str) -> CircuitState {
        self.breakers
            .get(agent_id)
            .map_or(CircuitState::Closed, CircuitBreaker::state)
    }
}

//! Per-endpoint failure isolation.
//!
//! Each endpoint gets its own breaker so one misbehaving endpoint cannot
//! sink throughput on the others. Failures tracked in the sliding window are
//! transport errors and 5xx; throttling (429) is the rate limiter's concern
//! and any completed response counts toward health.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use log::{debug, info, warn};

#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Sliding window length, in requests.
    pub window: usize,
    /// Outcomes required before the ratio is meaningful.
    pub min_samples: usize,
    /// Failure ratio that trips CLOSED -> OPEN.
    pub failure_threshold: f64,
    /// How long OPEN rejects before allowing a probe.
    pub open_cooloff: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            window: 20,
            min_samples: 8,
            failure_threshold: 0.5,
            open_cooloff: Duration::from_secs(30),
        }
    }
}

#[derive(Clone, Copy, Debug)]
enum State {
    Closed,
    Open { until: Instant },
    HalfOpen { probe_in_flight: bool },
}

struct EndpointBreaker {
    state: State,
    /// true = success. Bounded to `window`.
    outcomes: VecDeque<bool>,
}

impl EndpointBreaker {
    fn new() -> Self {
        EndpointBreaker { state: State::Closed, outcomes: VecDeque::new() }
    }

    fn push(&mut self, success: bool, window: usize) {
        self.outcomes.push_back(success);
        while self.outcomes.len() > window {
            self.outcomes.pop_front();
        }
    }

    fn failure_ratio(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let failures = self.outcomes.iter().filter(|ok| !**ok).count();
        failures as f64 / self.outcomes.len() as f64
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// The single half-open trial request.
    Probe,
    Rejected,
}

pub struct BreakerRegistry {
    config: BreakerConfig,
    breakers: Mutex<HashMap<String, EndpointBreaker>>,
}

impl BreakerRegistry {
    pub fn new(config: BreakerConfig) -> Self {
        BreakerRegistry { config, breakers: Mutex::new(HashMap::new()) }
    }

    pub fn admit(&self, endpoint: &str) -> Admission {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = map.entry(endpoint.to_string()).or_insert_with(EndpointBreaker::new);
        match breaker.state {
            State::Closed => Admission::Allowed,
            State::Open { until } => {
                if Instant::now() >= until {
                    debug!("breaker '{}': cool-off elapsed, admitting probe", endpoint);
                    breaker.state = State::HalfOpen { probe_in_flight: true };
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            State::HalfOpen { probe_in_flight: true } => Admission::Rejected,
            State::HalfOpen { probe_in_flight: false } => {
                breaker.state = State::HalfOpen { probe_in_flight: true };
                Admission::Probe
            }
        }
    }

    pub fn record_success(&self, endpoint: &str) {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = map.entry(endpoint.to_string()).or_insert_with(EndpointBreaker::new);
        match breaker.state {
            State::HalfOpen { .. } => {
                info!("breaker '{}': probe succeeded, closing", endpoint);
                breaker.state = State::Closed;
                breaker.outcomes.clear();
            }
            State::Closed => breaker.push(true, self.config.window),
            State::Open { .. } => {}
        }
    }

    pub fn record_failure(&self, endpoint: &str) {
        let mut map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        let breaker = map.entry(endpoint.to_string()).or_insert_with(EndpointBreaker::new);
        match breaker.state {
            State::HalfOpen { .. } => {
                warn!("breaker '{}': probe failed, reopening", endpoint);
                breaker.state = State::Open { until: Instant::now() + self.config.open_cooloff };
                breaker.outcomes.clear();
            }
            State::Closed => {
                breaker.push(false, self.config.window);
                if breaker.outcomes.len() >= self.config.min_samples
                    && breaker.failure_ratio() > self.config.failure_threshold
                {
                    warn!(
                        "breaker '{}': failure ratio {:.0}% over last {} requests, opening for {:?}",
                        endpoint,
                        breaker.failure_ratio() * 100.0,
                        breaker.outcomes.len(),
                        self.config.open_cooloff
                    );
                    breaker.state = State::Open { until: Instant::now() + self.config.open_cooloff };
                    breaker.outcomes.clear();
                }
            }
            State::Open { .. } => {}
        }
    }

    #[cfg(test)]
    pub fn is_open(&self, endpoint: &str) -> bool {
        let map = self.breakers.lock().unwrap_or_else(|e| e.into_inner());
        matches!(
            map.get(endpoint).map(|b| b.state),
            Some(State::Open { .. }) | Some(State::HalfOpen { .. })
        )
    }
}

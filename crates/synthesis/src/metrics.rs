//! Observability sink for synthesis governance.
//!
//! Exporters plug in by implementing [`SynthesisMetrics`]. The governor only
//! talks to the trait, so an operator without a metrics pipeline runs with
//! [`NoopMetrics`].

use parking_lot::Mutex;
use std::collections::HashMap;

/// Recorded outcome of a synthesis request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestStatus {
    Success,
    Failed,
    RateLimited,
    QuotaExceeded,
    Rejected,
}

impl RequestStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failed => "failed",
            Self::RateLimited => "rate_limited",
            Self::QuotaExceeded => "quota_exceeded",
            Self::Rejected => "rejected",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenDirection {
    Input,
    Output,
}

impl TokenDirection {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
        }
    }
}

pub trait SynthesisMetrics: Send + Sync {
    fn record_request(&self, namespace: &str, status: RequestStatus);
    fn record_tokens(&self, namespace: &str, direction: TokenDirection, tokens: u64);
    fn record_cost(&self, namespace: &str, amount: f64);
    fn record_rate_limited(&self, namespace: &str);
    /// `kind` is `"cost"` or `"attempts"`
    fn record_quota_exceeded(&self, namespace: &str, kind: &str);
    fn set_quota_remaining(&self, namespace: &str, kind: &str, value: f64);
    fn observe_duration(&self, namespace: &str, status: RequestStatus, seconds: f64);
}

/// Discards every observation.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl SynthesisMetrics for NoopMetrics {
    fn record_request(&self, _namespace: &str, _status: RequestStatus) {}
    fn record_tokens(&self, _namespace: &str, _direction: TokenDirection, _tokens: u64) {}
    fn record_cost(&self, _namespace: &str, _amount: f64) {}
    fn record_rate_limited(&self, _namespace: &str) {}
    fn record_quota_exceeded(&self, _namespace: &str, _kind: &str) {}
    fn set_quota_remaining(&self, _namespace: &str, _kind: &str, _value: f64) {}
    fn observe_duration(&self, _namespace: &str, _status: RequestStatus, _seconds: f64) {}
}

#[derive(Debug, Default)]
struct Counters {
    requests: HashMap<(String, RequestStatus), u64>,
    tokens: HashMap<(String, TokenDirection), u64>,
    cost: HashMap<String, f64>,
    rate_limited: HashMap<String, u64>,
    quota_exceeded: HashMap<(String, String), u64>,
    quota_remaining: HashMap<(String, String), f64>,
    /// Observation count and total seconds
    durations: HashMap<(String, RequestStatus), (u64, f64)>,
}

/// Keeps every observation in memory for inspection.
#[derive(Debug, Default)]
pub struct InMemoryMetrics {
    counters: Mutex<Counters>,
}

impl InMemoryMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn requests(&self, namespace: &str, status: RequestStatus) -> u64 {
        self.counters
            .lock()
            .requests
            .get(&(namespace.to_string(), status))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn tokens(&self, namespace: &str, direction: TokenDirection) -> u64 {
        self.counters
            .lock()
            .tokens
            .get(&(namespace.to_string(), direction))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn cost(&self, namespace: &str) -> f64 {
        self.counters
            .lock()
            .cost
            .get(namespace)
            .copied()
            .unwrap_or(0.0)
    }

    #[must_use]
    pub fn rate_limited(&self, namespace: &str) -> u64 {
        self.counters
            .lock()
            .rate_limited
            .get(namespace)
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn quota_exceeded(&self, namespace: &str, kind: &str) -> u64 {
        self.counters
            .lock()
            .quota_exceeded
            .get(&(namespace.to_string(), kind.to_string()))
            .copied()
            .unwrap_or(0)
    }

    #[must_use]
    pub fn quota_remaining(&self, namespace: &str, kind: &str) -> Option<f64> {
        self.counters
            .lock()
            .quota_remaining
            .get(&(namespace.to_string(), kind.to_string()))
            .copied()
    }

    #[must_use]
    pub fn duration_count(&self, namespace: &str) -> u64 {
        self.counters
            .lock()
            .durations
            .iter()
            .filter(|((ns, _), _)| ns == namespace)
            .map(|(_, (count, _))| count)
            .sum()
    }

    /// Total observed seconds for one outcome
    #[must_use]
    pub fn duration_sum(&self, namespace: &str, status: RequestStatus) -> f64 {
        self.counters
            .lock()
            .durations
            .get(&(namespace.to_string(), status))
            .map_or(0.0, |(_, sum)| *sum)
    }
}

impl SynthesisMetrics for InMemoryMetrics {
    fn record_request(&self, namespace: &str, status: RequestStatus) {
        *self
            .counters
            .lock()
            .requests
            .entry((namespace.to_string(), status))
            .or_insert(0) += 1;
    }

    fn record_tokens(&self, namespace: &str, direction: TokenDirection, tokens: u64) {
        *self
            .counters
            .lock()
            .tokens
            .entry((namespace.to_string(), direction))
            .or_insert(0) += tokens;
    }

    fn record_cost(&self, namespace: &str, amount: f64) {
        *self
            .counters
            .lock()
            .cost
            .entry(namespace.to_string())
            .or_insert(0.0) += amount;
    }

    fn record_rate_limited(&self, namespace: &str) {
        *self
            .counters
            .lock()
            .rate_limited
            .entry(namespace.to_string())
            .or_insert(0) += 1;
    }

    fn record_quota_exceeded(&self, namespace: &str, kind: &str) {
        *self
            .counters
            .lock()
            .quota_exceeded
            .entry((namespace.to_string(), kind.to_string()))
            .or_insert(0) += 1;
    }

    fn set_quota_remaining(&self, namespace: &str, kind: &str, value: f64) {
        self.counters
            .lock()
            .quota_remaining
            .insert((namespace.to_string(), kind.to_string()), value);
    }

    fn observe_duration(&self, namespace: &str, status: RequestStatus, seconds: f64) {
        let mut counters = self.counters.lock();
        let (count, sum) = counters
            .durations
            .entry((namespace.to_string(), status))
            .or_insert((0, 0.0));
        *count += 1;
        *sum += seconds;
    }
}

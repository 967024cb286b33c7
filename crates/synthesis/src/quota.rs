//! # Synthesis Quota Management
//!
//! Per-namespace daily budgets for synthesis cost and attempt counts.
//!
//! Each namespace owns a pair of `(counter, deadline)` windows. When the clock
//! passes a deadline the counter is zeroed, the deadline moves 24 hours past
//! now and history older than seven days is pruned. That rollover always runs
//! under the namespace's exclusive lock, including from read paths such as
//! [`QuotaManager::remaining_quota`], so a concurrent reader never sees a
//! zeroed counter paired with a stale deadline (or the reverse).
//!
//! Checks and records are separate calls: `record_cost` and `record_attempt`
//! always add to the totals and never re-check the limit. Callers check first.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::{debug, info};

use crate::clock::{SharedClock, SystemClock};
use crate::config::QuotaConfig;
use crate::cost::SynthesisCost;
use crate::error::{QuotaViolation, Result};

const WINDOW: Duration = Duration::hours(24);
const HISTORY_RETENTION: Duration = Duration::days(7);

/// A single recorded synthesis cost
#[derive(Debug, Clone, PartialEq)]
pub struct CostEntry {
    pub timestamp: DateTime<Utc>,
    pub cost: f64,
    pub agent_name: String,
    pub currency: String,
}

/// A single recorded synthesis attempt
#[derive(Debug, Clone, PartialEq)]
pub struct AttemptEntry {
    pub timestamp: DateTime<Utc>,
    pub agent_name: String,
    pub success: bool,
    pub error_message: Option<String>,
}

/// Quota usage for one namespace
#[derive(Debug, Clone)]
pub struct NamespaceQuota {
    daily_cost: f64,
    daily_reset_at: DateTime<Utc>,
    cost_history: Vec<CostEntry>,

    daily_attempts: u32,
    attempts_reset_at: DateTime<Utc>,
    attempt_history: Vec<AttemptEntry>,
}

impl NamespaceQuota {
    #[must_use]
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            daily_cost: 0.0,
            daily_reset_at: now + WINDOW,
            cost_history: Vec::new(),
            daily_attempts: 0,
            attempts_reset_at: now + WINDOW,
            attempt_history: Vec::new(),
        }
    }

    /// Roll over any window whose deadline has passed.
    fn reset_if_needed(&mut self, now: DateTime<Utc>) {
        let cutoff = now - HISTORY_RETENTION;

        if now > self.daily_reset_at {
            self.daily_cost = 0.0;
            self.daily_reset_at = now + WINDOW;
            self.cost_history.retain(|entry| entry.timestamp > cutoff);
        }

        if now > self.attempts_reset_at {
            self.daily_attempts = 0;
            self.attempts_reset_at = now + WINDOW;
            self.attempt_history.retain(|entry| entry.timestamp > cutoff);
        }
    }
}

/// Raw counters for one namespace
#[derive(Debug, Clone, PartialEq)]
pub struct QuotaStats {
    pub daily_cost: f64,
    pub daily_reset_at: DateTime<Utc>,
    pub daily_attempts: u32,
    pub attempts_reset_at: DateTime<Utc>,
    pub cost_history_len: usize,
    pub attempt_history_len: usize,
}

/// Budget left in the current window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RemainingQuota {
    pub cost: f64,
    pub attempts: u32,
}

/// Tracks synthesis quotas and costs per namespace
pub struct QuotaManager {
    max_cost_per_day: f64,
    max_attempts_per_day: u32,
    currency: String,
    namespaces: DashMap<String, Arc<Mutex<NamespaceQuota>>>,
    clock: SharedClock,
}

impl QuotaManager {
    /// Create a new quota manager backed by the system clock
    #[must_use]
    pub fn new(max_cost_per_day: f64, max_attempts_per_day: u32, currency: impl Into<String>) -> Self {
        Self::with_clock(
            max_cost_per_day,
            max_attempts_per_day,
            currency,
            Arc::new(SystemClock),
        )
    }

    #[must_use]
    pub fn with_clock(
        max_cost_per_day: f64,
        max_attempts_per_day: u32,
        currency: impl Into<String>,
        clock: SharedClock,
    ) -> Self {
        Self {
            max_cost_per_day,
            max_attempts_per_day,
            currency: currency.into(),
            namespaces: DashMap::new(),
            clock,
        }
    }

    #[must_use]
    pub fn from_config(config: &QuotaConfig, clock: SharedClock) -> Self {
        Self::with_clock(
            config.max_cost_per_day,
            config.max_attempts_per_day,
            config.currency.clone(),
            clock,
        )
    }

    #[must_use]
    pub fn currency(&self) -> &str {
        &self.currency
    }

    fn quota(&self, namespace: &str) -> Arc<Mutex<NamespaceQuota>> {
        if let Some(existing) = self.namespaces.get(namespace) {
            return Arc::clone(existing.value());
        }

        let entry = self
            .namespaces
            .entry(namespace.to_string())
            .or_insert_with(|| {
                debug!(namespace, "Creating namespace quota tracker");
                Arc::new(Mutex::new(NamespaceQuota::new(self.clock.now())))
            });
        Arc::clone(entry.value())
    }

    /// Run `f` against the namespace state after rolling over expired windows.
    fn with_quota<T>(&self, namespace: &str, f: impl FnOnce(&mut NamespaceQuota, DateTime<Utc>) -> T) -> T {
        let quota = self.quota(namespace);
        let mut quota = quota.lock();
        let now = self.clock.now();
        quota.reset_if_needed(now);
        f(&mut *quota, now)
    }

    /// Check whether spending `estimated_cost` would exceed the daily cost quota
    pub fn check_cost_quota(&self, namespace: &str, estimated_cost: f64) -> Result<()> {
        self.with_quota(namespace, |quota, _| {
            let projected = quota.daily_cost + estimated_cost;
            if projected > self.max_cost_per_day {
                info!(
                    namespace,
                    current_cost = quota.daily_cost,
                    estimated_cost,
                    projected_cost = projected,
                    limit = self.max_cost_per_day,
                    currency = %self.currency,
                    "Cost quota would be exceeded"
                );
                return Err(QuotaViolation::Cost {
                    namespace: namespace.to_string(),
                    current: quota.daily_cost,
                    estimated: estimated_cost,
                    projected,
                    limit: self.max_cost_per_day,
                    currency: self.currency.clone(),
                    reset_at: quota.daily_reset_at,
                }
                .into());
            }
            Ok(())
        })
    }

    /// Check whether another attempt fits in the daily attempt quota
    pub fn check_attempt_quota(&self, namespace: &str) -> Result<()> {
        self.with_quota(namespace, |quota, _| {
            if quota.daily_attempts >= self.max_attempts_per_day {
                info!(
                    namespace,
                    attempts = quota.daily_attempts,
                    limit = self.max_attempts_per_day,
                    "Attempt quota exceeded"
                );
                return Err(QuotaViolation::Attempts {
                    namespace: namespace.to_string(),
                    attempts: quota.daily_attempts,
                    limit: self.max_attempts_per_day,
                    reset_at: quota.attempts_reset_at,
                }
                .into());
            }
            Ok(())
        })
    }

    /// Add an actual synthesis cost to the namespace's daily total
    pub fn record_cost(&self, namespace: &str, agent_name: &str, cost: &SynthesisCost) {
        // Negative amounts would let the counter drift below zero.
        let amount = if cost.total_cost.is_finite() {
            cost.total_cost.max(0.0)
        } else {
            0.0
        };

        self.with_quota(namespace, |quota, now| {
            quota.daily_cost += amount;
            quota.cost_history.push(CostEntry {
                timestamp: now,
                cost: amount,
                agent_name: agent_name.to_string(),
                currency: cost.currency.clone(),
            });

            info!(
                namespace,
                agent = agent_name,
                cost = amount,
                currency = %cost.currency,
                daily_total = quota.daily_cost,
                limit = self.max_cost_per_day,
                "Synthesis cost recorded"
            );
        });
    }

    /// Count a synthesis attempt against the namespace's daily attempts
    pub fn record_attempt(
        &self,
        namespace: &str,
        agent_name: &str,
        success: bool,
        error_message: Option<&str>,
    ) {
        self.with_quota(namespace, |quota, now| {
            quota.daily_attempts = quota.daily_attempts.saturating_add(1);
            quota.attempt_history.push(AttemptEntry {
                timestamp: now,
                agent_name: agent_name.to_string(),
                success,
                error_message: error_message.map(ToString::to_string),
            });

            debug!(
                namespace,
                agent = agent_name,
                success,
                daily_attempts = quota.daily_attempts,
                limit = self.max_attempts_per_day,
                "Synthesis attempt recorded"
            );
        });
    }

    /// Budget left for a namespace, never negative
    #[must_use]
    pub fn remaining_quota(&self, namespace: &str) -> RemainingQuota {
        self.with_quota(namespace, |quota, _| RemainingQuota {
            cost: (self.max_cost_per_day - quota.daily_cost).max(0.0),
            attempts: self.max_attempts_per_day.saturating_sub(quota.daily_attempts),
        })
    }

    /// Current counters for a namespace, if it has been seen
    #[must_use]
    pub fn namespace_stats(&self, namespace: &str) -> Option<QuotaStats> {
        let quota = Arc::clone(self.namespaces.get(namespace)?.value());
        let mut quota = quota.lock();
        quota.reset_if_needed(self.clock.now());

        Some(QuotaStats {
            daily_cost: quota.daily_cost,
            daily_reset_at: quota.daily_reset_at,
            daily_attempts: quota.daily_attempts,
            attempts_reset_at: quota.attempts_reset_at,
            cost_history_len: quota.cost_history.len(),
            attempt_history_len: quota.attempt_history.len(),
        })
    }

    /// Recent attempts for a namespace, oldest first
    #[must_use]
    pub fn attempt_history(&self, namespace: &str) -> Vec<AttemptEntry> {
        let Some(quota) = self
            .namespaces
            .get(namespace)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return Vec::new();
        };
        let mut quota = quota.lock();
        quota.reset_if_needed(self.clock.now());
        quota.attempt_history.clone()
    }

    /// Clear all quota state
    pub fn reset(&self) {
        let before = self.namespaces.len();
        self.namespaces.clear();
        info!("Reset quota state for {} namespaces", before);
    }
}

//! Per-client request budgets.
//!
//! Unlike the category windows, a client budget counts every attempt,
//! including rejected ones: the attempt is recorded first and the count is
//! compared against the limit afterwards. A client that keeps hammering
//! stays locked out until it backs off for a full window. Only the newest
//! `max_requests + 1` attempts are kept, which is enough to reach the same
//! verdict as keeping all of them.

use dashmap::DashMap;
use std::collections::VecDeque;
use std::hash::Hash;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use super::rules::WindowRule;

/// Sliding-window budget keyed by client (user id, IP address, ...).
pub struct KeyedRateLimiter<K: Eq + Hash> {
    max_requests: usize,
    window_size: Duration,
    requests: DashMap<K, VecDeque<Instant>>,
}

impl<K: Eq + Hash> KeyedRateLimiter<K> {
    /// Create an empty limiter.
    pub fn new(max_requests: usize, window_size: Duration) -> Self {
        Self {
            max_requests,
            window_size,
            requests: DashMap::new(),
        }
    }

    /// Create an empty limiter from a configured rule.
    pub fn from_rule(rule: &WindowRule) -> Self {
        Self::new(rule.max_requests, rule.window())
    }

    /// Record an attempt by `key` and report whether it is within budget.
    pub fn check(&self, key: K) -> bool {
        self.check_at(key, Instant::now())
    }

    /// [`KeyedRateLimiter::check`] at an explicit instant.
    pub fn check_at(&self, key: K, now: Instant) -> bool {
        let mut attempts = self.requests.entry(key).or_default();
        evict(&mut attempts, self.window_size, now);
        attempts.push_back(now);
        // Only the newest max_requests + 1 attempts can change a verdict.
        while attempts.len() > self.max_requests.saturating_add(1) {
            attempts.pop_front();
        }

        let within = attempts.len() <= self.max_requests;
        if !within {
            debug!(
                attempts = attempts.len(),
                limit = self.max_requests,
                "Client over budget"
            );
        }
        within
    }

    /// Drop clients with no attempts left inside the window.
    ///
    /// Returns the number of clients removed.
    pub fn purge(&self) -> usize {
        self.purge_at(Instant::now())
    }

    /// [`KeyedRateLimiter::purge`] at an explicit instant.
    pub fn purge_at(&self, now: Instant) -> usize {
        let before = self.requests.len();
        let window_size = self.window_size;
        self.requests.retain(|_, attempts| {
            evict(attempts, window_size, now);
            !attempts.is_empty()
        });
        before.saturating_sub(self.requests.len())
    }

    /// Forget every client.
    pub fn clear(&self) {
        self.requests.clear();
    }

    /// Number of clients currently tracked.
    pub fn tracked_keys(&self) -> usize {
        self.requests.len()
    }
}

fn evict(attempts: &mut VecDeque<Instant>, window_size: Duration, now: Instant) {
    while let Some(&oldest) = attempts.front() {
        if now.saturating_duration_since(oldest) < window_size {
            break;
        }
        attempts.pop_front();
    }
}

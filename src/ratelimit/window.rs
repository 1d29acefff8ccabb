//! Sliding-window request accounting.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

use super::rules::WindowRule;

/// A trailing time window over one operation category.
///
/// Timestamps are kept oldest-first. Entries whose age has reached the
/// window length are dropped from the front before every capacity check,
/// so the deque never holds more than `max_requests` live entries.
///
/// All mutation goes through an internal mutex; the evict-check-record
/// sequence of [`RateWindow::try_acquire_at`] runs under a single lock so
/// concurrent callers can never both take the last slot.
#[derive(Debug)]
pub struct RateWindow {
    /// Length of the trailing window
    window_size: Duration,
    /// Maximum actions inside any window-long interval
    max_requests: usize,
    /// Recorded actions, oldest first
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateWindow {
    /// Create an empty window.
    ///
    /// `max_requests` must be at least 1: a zero limit never grants.
    /// [`WindowRule::validate`] checks this for configured rules, and
    /// `RateLimiter::with_rules` refuses rules that fail it.
    pub fn new(max_requests: usize, window_size: Duration) -> Self {
        Self {
            window_size,
            max_requests,
            timestamps: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    /// Create an empty window from a configured rule.
    pub fn from_rule(rule: &WindowRule) -> Self {
        Self::new(rule.max_requests, rule.window())
    }

    /// Get the window length.
    pub fn window_size(&self) -> Duration {
        self.window_size
    }

    /// Get the limit for this window.
    pub fn max_requests(&self) -> usize {
        self.max_requests
    }

    /// Check whether an action may start now, without recording it.
    ///
    /// Returns `(true, 0)` when a slot is free, otherwise `(false, wait)`
    /// where `wait` is the time until the oldest entry leaves the window.
    pub fn can_proceed(&self) -> (bool, Duration) {
        self.can_proceed_at(Instant::now())
    }

    /// [`RateWindow::can_proceed`] evaluated at an explicit instant.
    pub fn can_proceed_at(&self, now: Instant) -> (bool, Duration) {
        let mut timestamps = self.timestamps.lock();
        self.evict(&mut timestamps, now);
        match self.wait_for_slot(&timestamps, now) {
            None => (true, Duration::ZERO),
            Some(wait) => (false, wait),
        }
    }

    /// Record an action starting now.
    ///
    /// Callers using [`RateWindow::can_proceed`] must call this after an
    /// allowed result, otherwise nothing is counted.
    pub fn record(&self) {
        self.record_at(Instant::now());
    }

    /// [`RateWindow::record`] at an explicit instant.
    pub fn record_at(&self, now: Instant) {
        self.timestamps.lock().push_back(now);
    }

    /// Evict, check and record in one step.
    ///
    /// Returns `Err(wait)` without recording when the window is full.
    pub fn try_acquire(&self) -> Result<(), Duration> {
        self.try_acquire_at(Instant::now())
    }

    /// [`RateWindow::try_acquire`] at an explicit instant.
    pub fn try_acquire_at(&self, now: Instant) -> Result<(), Duration> {
        let mut timestamps = self.timestamps.lock();
        self.evict(&mut timestamps, now);
        if let Some(wait) = self.wait_for_slot(&timestamps, now) {
            return Err(wait);
        }
        timestamps.push_back(now);
        Ok(())
    }

    /// Number of live entries.
    pub fn in_window(&self) -> usize {
        self.in_window_at(Instant::now())
    }

    /// [`RateWindow::in_window`] at an explicit instant.
    pub fn in_window_at(&self, now: Instant) -> usize {
        let mut timestamps = self.timestamps.lock();
        self.evict(&mut timestamps, now);
        timestamps.len()
    }

    /// Live entry count and time until a slot frees up, taken under one lock.
    pub fn snapshot_at(&self, now: Instant) -> (usize, Duration) {
        let mut timestamps = self.timestamps.lock();
        self.evict(&mut timestamps, now);
        let wait = self.wait_for_slot(&timestamps, now).unwrap_or(Duration::ZERO);
        (timestamps.len(), wait)
    }

    /// Get the remaining quota.
    pub fn remaining(&self) -> usize {
        self.max_requests.saturating_sub(self.in_window())
    }

    fn evict(&self, timestamps: &mut VecDeque<Instant>, now: Instant) {
        while let Some(&oldest) = timestamps.front() {
            if now.saturating_duration_since(oldest) < self.window_size {
                break;
            }
            timestamps.pop_front();
        }
    }

    /// `None` if a slot is free, otherwise the time until one frees up.
    fn wait_for_slot(&self, timestamps: &VecDeque<Instant>, now: Instant) -> Option<Duration> {
        if timestamps.len() < self.max_requests {
            return None;
        }
        // An empty full window only happens with a zero limit, which rule
        // validation keeps out of the limiter.
        let wait = match timestamps.front() {
            Some(&oldest) => (oldest + self.window_size).saturating_duration_since(now),
            None => self.window_size,
        };
        Some(wait)
    }
}

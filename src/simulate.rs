//! Event dispatch through the limiter, and a burst simulator on top of it.
//!
//! The dispatcher plays the part of a bot's message handler. Replies to the
//! same user are spaced by the response cooldown first; events that get past
//! it are charged to the sender's request budget, and the outbound call
//! itself waits for a slot in its operation category.

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, instrument};

use crate::ratelimit::{KeyedRateLimiter, Throttle};

/// What happened to one inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// A slot was granted and the reply went out
    Sent,
    /// The user was answered too recently
    Suppressed,
    /// The user exhausted their request budget
    OverBudget,
    /// No slot freed up within the allowed wait
    TimedOut,
}

/// Routes events through a budget, a cooldown and a throttle.
pub struct Dispatcher<T: Throttle + ?Sized> {
    throttle: Arc<T>,
    budget: Arc<KeyedRateLimiter<i64>>,
    operation: String,
    cooldown: Duration,
    max_wait: Option<Duration>,
}

impl<T: Throttle + ?Sized> Dispatcher<T> {
    /// Create a dispatcher for replies of kind `operation`.
    pub fn new(
        throttle: Arc<T>,
        budget: Arc<KeyedRateLimiter<i64>>,
        operation: impl Into<String>,
        cooldown: Duration,
    ) -> Self {
        Self {
            throttle,
            budget,
            operation: operation.into(),
            cooldown,
            max_wait: None,
        }
    }

    /// Give up on an event after waiting `max_wait` for a slot.
    pub fn with_max_wait(mut self, max_wait: Option<Duration>) -> Self {
        self.max_wait = max_wait;
        self
    }

    /// Handle one inbound event from `user_id`.
    #[instrument(skip(self), fields(operation = %self.operation))]
    pub async fn handle(&self, user_id: i64) -> Outcome {
        // Suppressed replies never reach the budget.
        if !self.throttle.can_respond_to_user(user_id, self.cooldown) {
            return Outcome::Suppressed;
        }
        if !self.budget.check(user_id) {
            return Outcome::OverBudget;
        }

        let acquire = self.throttle.acquire(&self.operation);
        let outcome = match self.max_wait {
            None => {
                acquire.await;
                Outcome::Sent
            }
            Some(max_wait) => match tokio::time::timeout(max_wait, acquire).await {
                Ok(_) => Outcome::Sent,
                Err(_) => Outcome::TimedOut,
            },
        };

        debug!(outcome = ?outcome, "Event handled");
        outcome
    }

    /// Handle a batch of `(user_id, arrival_delay)` events concurrently.
    pub async fn run_events(&self, events: Vec<(i64, Duration)>) -> Tally {
        let start = Instant::now();
        let outcomes = futures::future::join_all(events.into_iter().map(|(user_id, delay)| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            self.handle(user_id).await
        }))
        .await;

        let mut tally = Tally::default();
        for outcome in outcomes {
            tally.add(outcome);
        }
        tally.elapsed_ms = start.elapsed().as_millis() as u64;
        tally
    }
}

/// Counts of event outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Tally {
    pub sent: usize,
    pub suppressed: usize,
    pub over_budget: usize,
    pub timed_out: usize,
    pub elapsed_ms: u64,
}

impl Tally {
    fn add(&mut self, outcome: Outcome) {
        match outcome {
            Outcome::Sent => self.sent += 1,
            Outcome::Suppressed => self.suppressed += 1,
            Outcome::OverBudget => self.over_budget += 1,
            Outcome::TimedOut => self.timed_out += 1,
        }
    }

    /// Total number of events counted.
    pub fn total(&self) -> usize {
        self.sent + self.suppressed + self.over_budget + self.timed_out
    }
}

/// Parameters of a random burst.
#[derive(Debug, Clone)]
pub struct BurstOptions {
    /// Number of inbound events
    pub events: usize,
    /// Number of distinct users the events are spread over
    pub users: u32,
    /// Upper bound of the random arrival delay of each event
    pub jitter: Duration,
}

impl BurstOptions {
    /// Number of users events are drawn from, at least one.
    pub fn user_count(&self) -> u32 {
        self.users.max(1)
    }
}

/// Result of a simulated burst.
#[derive(Debug, Clone, Serialize)]
pub struct BurstReport {
    pub started_at: String,
    pub operation: String,
    pub events: usize,
    pub users: u32,
    #[serde(flatten)]
    pub tally: Tally,
}

/// Generate `(user_id, delay)` pairs for a burst.
pub fn random_events(options: &BurstOptions) -> Vec<(i64, Duration)> {
    let mut rng = rand::thread_rng();
    let users = options.user_count();
    let jitter_ms = options.jitter.as_millis() as u64;

    (0..options.events)
        .map(|_| {
            let user_id = rng.gen_range(0..users) as i64;
            let delay = Duration::from_millis(rng.gen_range(0..=jitter_ms));
            (user_id, delay)
        })
        .collect()
}

/// Play a random burst through `dispatcher`.
pub async fn run_burst<T: Throttle + ?Sized>(
    dispatcher: &Dispatcher<T>,
    options: &BurstOptions,
) -> BurstReport {
    let started_at = Utc::now().to_rfc3339();
    info!(
        events = options.events,
        users = options.user_count(),
        operation = %dispatcher.operation,
        "Starting burst"
    );

    let tally = dispatcher.run_events(random_events(options)).await;

    info!(
        sent = tally.sent,
        suppressed = tally.suppressed,
        over_budget = tally.over_budget,
        timed_out = tally.timed_out,
        elapsed_ms = tally.elapsed_ms,
        "Burst finished"
    );

    BurstReport {
        started_at,
        operation: dispatcher.operation.clone(),
        events: options.events,
        users: options.user_count(),
        tally,
    }
}

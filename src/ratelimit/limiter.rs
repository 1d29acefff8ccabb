//! Core rate limiter implementation.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::backend::Throttle;
use super::cooldown::ResponseCooldown;
use super::rules::{default_operations, WindowRule};
use super::window::RateWindow;
use crate::config::LimiterConfig;
use crate::error::{FloodgateError, Result};

/// Default minimum time between two replies to the same user.
pub const DEFAULT_RESPONSE_COOLDOWN: Duration = Duration::from_secs(2);

/// The process-wide rate limiter for outbound bot actions.
///
/// The set of operation categories is fixed at construction. Operations
/// not in the table are never limited. Share it behind an `Arc`.
///
/// Accounting is optimistic: a slot is recorded when an action is allowed
/// to start, and is never given back if the action later fails.
pub struct RateLimiter {
    /// One window per operation category
    windows: HashMap<String, RateWindow>,
    /// Per-user reply times
    cooldown: ResponseCooldown,
    /// Cooldown used by `can_respond_to_user_default`
    default_cooldown: Duration,
}

/// Point-in-time view of one category window.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowUsage {
    pub operation: String,
    pub in_window: usize,
    pub max_requests: usize,
    pub remaining: usize,
    /// Zero when a slot is free right now
    pub retry_after_ms: u64,
}

impl RateLimiter {
    /// Create a rate limiter with the built-in operation table.
    pub fn new() -> Self {
        // The built-in table is valid by construction.
        Self::from_windows(
            default_operations()
                .into_iter()
                .map(|(name, rule)| (name, RateWindow::from_rule(&rule)))
                .collect(),
        )
    }

    /// Create a rate limiter with the given operation table.
    ///
    /// Fails if any rule could never grant a request.
    pub fn with_rules<I, S>(rules: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, WindowRule)>,
        S: Into<String>,
    {
        let mut windows = HashMap::new();
        for (name, rule) in rules {
            let name = name.into();
            rule.validate(&name)?;
            debug!(
                operation = %name,
                limit = rule.max_requests,
                window_secs = rule.window_secs,
                "Registering rate window"
            );
            windows.insert(name, RateWindow::from_rule(&rule));
        }
        Ok(Self::from_windows(windows))
    }

    /// Create a rate limiter from loaded configuration.
    pub fn from_config(config: &LimiterConfig) -> Result<Self> {
        Ok(Self::with_rules(config.operations.clone())?
            .with_response_cooldown(config.response_cooldown()))
    }

    fn from_windows(windows: HashMap<String, RateWindow>) -> Self {
        Self {
            windows,
            cooldown: ResponseCooldown::new(),
            default_cooldown: DEFAULT_RESPONSE_COOLDOWN,
        }
    }

    /// Override the default response cooldown.
    pub fn with_response_cooldown(mut self, cooldown: Duration) -> Self {
        self.default_cooldown = cooldown;
        self
    }

    /// Wait until `operation` may proceed, then record it.
    ///
    /// Unknown operations return `true` immediately without touching any
    /// state. For known ones this suspends the calling task (never holding a
    /// lock) until a slot frees up. There is no upper bound on the wait; use
    /// [`RateLimiter::acquire_with_timeout`] for one.
    ///
    /// Dropping the returned future mid-wait leaves no trace, since the slot
    /// is only recorded at the moment it is granted.
    pub async fn acquire(&self, operation: &str) -> bool {
        let Some(window) = self.windows.get(operation) else {
            trace!(operation, "Operation not limited");
            return true;
        };

        loop {
            match window.try_acquire() {
                Ok(()) => {
                    trace!(operation, "Rate limit slot granted");
                    return true;
                }
                Err(wait) => {
                    warn!(
                        operation,
                        wait_ms = wait.as_millis() as u64,
                        "Rate limit reached, waiting"
                    );
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Like [`RateLimiter::acquire`] but gives up after `max_wait`.
    pub async fn acquire_with_timeout(&self, operation: &str, max_wait: Duration) -> Result<()> {
        match tokio::time::timeout(max_wait, self.acquire(operation)).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    operation,
                    waited_ms = max_wait.as_millis() as u64,
                    "Gave up waiting for rate limit slot"
                );
                Err(FloodgateError::WaitTimeout {
                    operation: operation.to_string(),
                    waited: max_wait,
                })
            }
        }
    }

    /// Take a slot only if one is free right now.
    pub fn try_acquire(&self, operation: &str) -> bool {
        match self.windows.get(operation) {
            Some(window) => window.try_acquire().is_ok(),
            None => true,
        }
    }

    /// Acquire a slot for `operation`, then run `action`.
    ///
    /// The slot stays counted whatever `action` returns.
    pub async fn throttled<F>(&self, operation: &str, action: F) -> F::Output
    where
        F: Future,
    {
        self.acquire(operation).await;
        action.await
    }

    /// Whether a reply to `user_id` is allowed, stamping the user if so.
    ///
    /// A user never replied to always passes. A suppressed check does not
    /// move the stored reply time.
    pub fn can_respond_to_user(&self, user_id: i64, cooldown: Duration) -> bool {
        self.cooldown.can_respond(user_id, cooldown)
    }

    /// [`RateLimiter::can_respond_to_user`] with the configured cooldown.
    pub fn can_respond_to_user_default(&self, user_id: i64) -> bool {
        self.cooldown.can_respond(user_id, self.default_cooldown)
    }

    /// Forget users not replied to within `max_age`.
    pub fn prune_cooldowns(&self, max_age: Duration) -> usize {
        let removed = self.cooldown.prune(max_age);
        if removed > 0 {
            debug!(removed, "Pruned response cooldowns");
        }
        removed
    }

    /// Snapshot of one category window, `None` for unknown operations.
    pub fn usage(&self, operation: &str) -> Option<WindowUsage> {
        let window = self.windows.get(operation)?;
        let (in_window, wait) = window.snapshot_at(Instant::now());

        Some(WindowUsage {
            operation: operation.to_string(),
            in_window,
            max_requests: window.max_requests(),
            remaining: window.max_requests().saturating_sub(in_window),
            retry_after_ms: wait.as_millis() as u64,
        })
    }

    /// Get the window for an operation.
    pub fn window(&self, operation: &str) -> Option<&RateWindow> {
        self.windows.get(operation)
    }

    /// Names of the limited operations.
    pub fn operations(&self) -> impl Iterator<Item = &str> {
        self.windows.keys().map(String::as_str)
    }

    /// The cooldown used by `can_respond_to_user_default`.
    pub fn default_cooldown(&self) -> Duration {
        self.default_cooldown
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Throttle for RateLimiter {
    async fn acquire(&self, operation: &str) -> bool {
        RateLimiter::acquire(self, operation).await
    }

    fn can_respond_to_user(&self, user_id: i64, cooldown: Duration) -> bool {
        RateLimiter::can_respond_to_user(self, user_id, cooldown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::rules::{ANSWER_CALLBACK, EDIT_MESSAGE, SEND_MESSAGE};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio_test::{assert_pending, assert_ready};

    fn limiter(max_requests: usize, window_secs: u64) -> RateLimiter {
        RateLimiter::with_rules([(SEND_MESSAGE, WindowRule::new(max_requests, window_secs))]).unwrap()
    }

    #[test]
    fn test_rate_limiter_creation() {
        let limiter = RateLimiter::new();
        let mut ops: Vec<&str> = limiter.operations().collect();
        ops.sort();
        assert_eq!(ops, vec![ANSWER_CALLBACK, EDIT_MESSAGE, SEND_MESSAGE]);
        assert_eq!(limiter.default_cooldown(), DEFAULT_RESPONSE_COOLDOWN);
    }

    #[test]
    fn test_from_config() {
        let mut config = LimiterConfig::default();
        config.response_cooldown_ms = 500;
        config.operations.remove(ANSWER_CALLBACK);

        let limiter = RateLimiter::from_config(&config).unwrap();
        assert!(limiter.window(ANSWER_CALLBACK).is_none());
        assert_eq!(limiter.window(EDIT_MESSAGE).unwrap().max_requests(), 10);
        assert_eq!(limiter.default_cooldown(), Duration::from_millis(500));
    }

    #[test]
    fn test_with_rules_rejects_unusable_rules() {
        let err = RateLimiter::with_rules([(SEND_MESSAGE, WindowRule::new(0, 5))])
            .err()
            .expect("zero limit accepted");
        assert!(matches!(err, FloodgateError::Config(_)));

        assert!(RateLimiter::with_rules([(SEND_MESSAGE, WindowRule::new(0, 0))]).is_err());
        assert!(RateLimiter::with_rules([
            (SEND_MESSAGE, WindowRule::new(10, 5)),
            (EDIT_MESSAGE, WindowRule::new(5, 0)),
        ])
        .is_err());
    }

    #[test]
    fn test_from_config_rejects_unusable_rules() {
        let mut config = LimiterConfig::default();
        config
            .operations
            .insert(SEND_MESSAGE.to_string(), WindowRule::new(0, 5));
        assert!(RateLimiter::from_config(&config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_after_partial_expiry() {
        let limiter = limiter(2, 5);
        assert!(limiter.try_acquire(SEND_MESSAGE));
        tokio::time::advance(Duration::from_secs(3)).await;
        assert!(limiter.try_acquire(SEND_MESSAGE));

        let usage = limiter.usage(SEND_MESSAGE).unwrap();
        assert_eq!(usage.in_window, 2);
        assert_eq!(usage.remaining, 0);
        assert_eq!(usage.retry_after_ms, 2000);

        tokio::time::advance(Duration::from_secs(2)).await;
        let usage = limiter.usage(SEND_MESSAGE).unwrap();
        assert_eq!(usage.in_window, 1);
        assert_eq!(usage.remaining, 1);
        assert_eq!(usage.retry_after_ms, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_within_limit() {
        let limiter = limiter(5, 5);
        for _ in 0..5 {
            assert!(limiter.acquire(SEND_MESSAGE).await);
        }
        let usage = limiter.usage(SEND_MESSAGE).unwrap();
        assert_eq!(usage.in_window, 5);
        assert_eq!(usage.remaining, 0);
        assert_eq!(usage.retry_after_ms, 5000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unknown_operation_fails_open() {
        let limiter = RateLimiter::new();
        for _ in 0..100 {
            assert!(limiter.acquire("unregistered_op").await);
            assert!(limiter.try_acquire("unregistered_op"));
        }
        assert!(limiter.usage("unregistered_op").is_none());
        for op in [EDIT_MESSAGE, SEND_MESSAGE, ANSWER_CALLBACK] {
            assert_eq!(limiter.usage(op).unwrap().in_window, 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_oldest_to_expire() {
        let limiter = limiter(2, 5);
        assert!(limiter.acquire(SEND_MESSAGE).await);
        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.acquire(SEND_MESSAGE).await);

        let start = Instant::now();
        assert!(limiter.acquire(SEND_MESSAGE).await);
        let waited = start.elapsed();
        assert!(waited >= Duration::from_secs(4), "waited {:?}", waited);
        assert!(waited < Duration::from_secs(5), "waited {:?}", waited);
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_does_not_block_other_callers() {
        let limiter = RateLimiter::with_rules([
            (SEND_MESSAGE, WindowRule::new(1, 10)),
            (EDIT_MESSAGE, WindowRule::new(1, 10)),
        ])
        .unwrap();
        assert!(limiter.acquire(SEND_MESSAGE).await);

        let mut blocked = tokio_test::task::spawn(limiter.acquire(SEND_MESSAGE));
        assert_pending!(blocked.poll());

        // Other categories and the cooldown are unaffected by the waiter.
        assert!(limiter.try_acquire(EDIT_MESSAGE));
        assert!(limiter.can_respond_to_user(9, DEFAULT_RESPONSE_COOLDOWN));
        assert_pending!(blocked.poll());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_callers_never_exceed_capacity() {
        let limiter = limiter(5, 5);
        // Two slots used, three left.
        assert!(limiter.try_acquire(SEND_MESSAGE));
        assert!(limiter.try_acquire(SEND_MESSAGE));

        let mut tasks: Vec<_> = (0..6)
            .map(|_| tokio_test::task::spawn(limiter.acquire(SEND_MESSAGE)))
            .collect();

        let mut granted = 0;
        for task in tasks.iter_mut() {
            if task.poll().is_ready() {
                granted += 1;
            } else {
                assert_pending!(task.poll());
            }
        }

        assert_eq!(granted, 3);
        assert_eq!(limiter.usage(SEND_MESSAGE).unwrap().in_window, 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_try_acquire_no_double_grant() {
        let limiter = Arc::new(limiter(10, 60));
        let granted = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..64)
            .map(|_| {
                let limiter = limiter.clone();
                let granted = granted.clone();
                tokio::spawn(async move {
                    if limiter.try_acquire(SEND_MESSAGE) {
                        granted.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in futures::future::join_all(handles).await {
            handle.unwrap();
        }

        assert_eq!(granted.load(Ordering::SeqCst), 10);
        assert_eq!(limiter.usage(SEND_MESSAGE).unwrap().in_window, 10);
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_waiters_all_complete() {
        let limiter = Arc::new(limiter(2, 5));
        let start = Instant::now();

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire(SEND_MESSAGE).await })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            assert!(result.unwrap());
        }

        // Three batches of two: at 0s, 5s and 10s.
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(10), "elapsed {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(11), "elapsed {:?}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_with_timeout() {
        let limiter = limiter(1, 10);
        assert!(limiter
            .acquire_with_timeout(SEND_MESSAGE, Duration::from_secs(1))
            .await
            .is_ok());

        let err = limiter
            .acquire_with_timeout(SEND_MESSAGE, Duration::from_secs(1))
            .await
            .unwrap_err();
        match err {
            FloodgateError::WaitTimeout { operation, waited } => {
                assert_eq!(operation, SEND_MESSAGE);
                assert_eq!(waited, Duration::from_secs(1));
            }
            other => panic!("unexpected error: {}", other),
        }
        // The timed-out attempt left nothing behind.
        assert_eq!(limiter.usage(SEND_MESSAGE).unwrap().in_window, 1);

        assert!(limiter
            .acquire_with_timeout(SEND_MESSAGE, Duration::from_secs(20))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_counts_failed_actions() {
        let limiter = limiter(5, 5);

        let sent = limiter.throttled(SEND_MESSAGE, async { 7 }).await;
        assert_eq!(sent, 7);

        let failed: std::result::Result<(), &str> = limiter
            .throttled(SEND_MESSAGE, async { Err("chat not found") })
            .await;
        assert!(failed.is_err());

        assert_eq!(limiter.usage(SEND_MESSAGE).unwrap().in_window, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_can_respond_to_user_cooldown() {
        let limiter = RateLimiter::new();
        assert!(limiter.can_respond_to_user(42, DEFAULT_RESPONSE_COOLDOWN));
        assert!(!limiter.can_respond_to_user(42, DEFAULT_RESPONSE_COOLDOWN));

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(limiter.can_respond_to_user(42, DEFAULT_RESPONSE_COOLDOWN));
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_cooldown_and_prune() {
        let limiter = RateLimiter::new().with_response_cooldown(Duration::from_secs(1));
        assert!(limiter.can_respond_to_user_default(1));
        assert!(!limiter.can_respond_to_user_default(1));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(limiter.can_respond_to_user_default(1));
        assert!(limiter.can_respond_to_user_default(2));

        tokio::time::advance(Duration::from_secs(30)).await;
        assert_eq!(limiter.prune_cooldowns(Duration::from_secs(10)), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttle_trait_object() {
        let throttle: Arc<dyn Throttle> = Arc::new(limiter(1, 5));
        assert!(throttle.acquire(SEND_MESSAGE).await);

        let mut second = tokio_test::task::spawn(throttle.acquire(SEND_MESSAGE));
        assert_pending!(second.poll());

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(assert_ready!(second.poll()));
    }
}

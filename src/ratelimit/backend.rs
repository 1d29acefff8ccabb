//! Throttle trait for abstracting the real limiter and a pass-through.

use async_trait::async_trait;
use std::time::Duration;

/// What message-sending collaborators depend on.
///
/// This trait abstracts over the `RateLimiter` and `Unthrottled` so that
/// senders work the same whether rate limiting is enabled or not.
#[async_trait]
pub trait Throttle: Send + Sync {
    /// Wait until an `operation` may proceed. Always eventually `true`.
    async fn acquire(&self, operation: &str) -> bool;

    /// Whether a reply to `user_id` is allowed given `cooldown`.
    fn can_respond_to_user(&self, user_id: i64, cooldown: Duration) -> bool;
}

/// A throttle that grants everything immediately.
#[derive(Debug, Default, Clone, Copy)]
pub struct Unthrottled;

#[async_trait]
impl Throttle for Unthrottled {
    async fn acquire(&self, _operation: &str) -> bool {
        true
    }

    fn can_respond_to_user(&self, _user_id: i64, _cooldown: Duration) -> bool {
        true
    }
}

//! Per-user response cooldown.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

/// Tracks when each user last got a reply.
///
/// This is independent of the category windows: it answers "did we already
/// reply to this user too recently", not "are we sending too fast overall".
#[derive(Debug, Default)]
pub struct ResponseCooldown {
    last_response: DashMap<i64, Instant>,
}

impl ResponseCooldown {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `true` and stamps the user if at least `cooldown` has passed
    /// since the last stamped reply. A user never seen before always passes.
    /// A rejected check leaves the stored time untouched.
    pub fn can_respond(&self, user_id: i64, cooldown: Duration) -> bool {
        self.can_respond_at(user_id, cooldown, Instant::now())
    }

    /// [`ResponseCooldown::can_respond`] at an explicit instant.
    pub fn can_respond_at(&self, user_id: i64, cooldown: Duration, now: Instant) -> bool {
        match self.last_response.entry(user_id) {
            Entry::Occupied(mut entry) => {
                let elapsed = now.saturating_duration_since(*entry.get());
                if elapsed < cooldown {
                    trace!(user_id, elapsed_ms = elapsed.as_millis() as u64, "Response suppressed");
                    return false;
                }
                entry.insert(now);
                true
            }
            Entry::Vacant(entry) => {
                entry.insert(now);
                true
            }
        }
    }

    /// Forget users whose last reply is at least `max_age` old.
    ///
    /// Returns the number of entries removed.
    pub fn prune(&self, max_age: Duration) -> usize {
        self.prune_at(max_age, Instant::now())
    }

    /// [`ResponseCooldown::prune`] at an explicit instant.
    pub fn prune_at(&self, max_age: Duration, now: Instant) -> usize {
        let before = self.last_response.len();
        self.last_response
            .retain(|_, last| now.saturating_duration_since(*last) < max_age);
        before.saturating_sub(self.last_response.len())
    }

    /// Number of users with a stored reply time.
    pub fn tracked_users(&self) -> usize {
        self.last_response.len()
    }
}

//! Window rules for operation categories.
//!
//! A rule pairs a request limit with the length of the trailing window it
//! applies to. The default table keeps each category safely under the
//! messaging platform's documented flood-control thresholds.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::error::{FloodgateError, Result};

/// Editing an already sent message.
pub const EDIT_MESSAGE: &str = "edit_message";
/// Sending a new message.
pub const SEND_MESSAGE: &str = "send_message";
/// Acknowledging a callback query.
pub const ANSWER_CALLBACK: &str = "answer_callback";

/// A sliding-window limit: at most `max_requests` actions in any
/// `window_secs`-long interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowRule {
    /// Maximum actions permitted inside the window
    pub max_requests: usize,
    /// Window length in seconds
    pub window_secs: u64,
}

impl WindowRule {
    /// Create a new rule.
    pub const fn new(max_requests: usize, window_secs: u64) -> Self {
        Self {
            max_requests,
            window_secs,
        }
    }

    /// The window length as a `Duration`.
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }

    /// Reject rules that could never grant a request.
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.max_requests == 0 {
            return Err(FloodgateError::Config(format!(
                "rule '{}': max_requests must be at least 1",
                name
            )));
        }
        if self.window_secs == 0 {
            return Err(FloodgateError::Config(format!(
                "rule '{}': window_secs must be at least 1",
                name
            )));
        }
        Ok(())
    }
}

/// The built-in operation table.
pub fn default_operations() -> BTreeMap<String, WindowRule> {
    BTreeMap::from([
        (EDIT_MESSAGE.to_string(), WindowRule::new(10, 5)),
        (SEND_MESSAGE.to_string(), WindowRule::new(10, 5)),
        (ANSWER_CALLBACK.to_string(), WindowRule::new(15, 3)),
    ])
}

/// Per-user request budget used by the bot's request handlers.
pub fn default_client_budget() -> WindowRule {
    WindowRule::new(20, 60)
}

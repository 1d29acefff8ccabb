//! Rate limiting logic and state management.

mod backend;
mod cooldown;
mod keyed;
mod limiter;
pub mod rules;
mod window;

pub use backend::{Throttle, Unthrottled};
pub use cooldown::ResponseCooldown;
pub use keyed::KeyedRateLimiter;
pub use limiter::{RateLimiter, WindowUsage, DEFAULT_RESPONSE_COOLDOWN};
pub use rules::WindowRule;
pub use window::RateWindow;

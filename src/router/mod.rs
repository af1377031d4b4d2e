//! Message router
//!
//! Chooses transports for locally originated messages and decides, for
//! every inbound message, whether to deliver it locally and whether to
//! relay it further.

mod rate_limiter;
#[allow(clippy::module_inception)]
mod router;
mod types;

pub use rate_limiter::RelayRateLimiter;
pub use router::Router;
pub use types::{DropReason, ReceiveOutcome, RouteOutcome, RouterConfig, RouterEvent, RouterStats};

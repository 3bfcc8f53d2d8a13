//! Browser automation module
//!
//! Pools long-lived Chromium processes and hands out short-lived isolated
//! sessions, one per monitoring pass or booking attempt, each with its own
//! fingerprint and proxy.

mod errors;
mod pool;
mod session;

pub use errors::BrowserError;
pub use pool::{PoolConfig, SessionPool};
pub use session::{NavigationResult, Session, DEFAULT_NAV_TIMEOUT_SECS};

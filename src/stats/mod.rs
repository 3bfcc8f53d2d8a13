//! Statistics module
//!
//! Lock-free monitoring statistics using atomic operations.

mod atomic;

pub use atomic::{MonitorStats, MonitorStatsSnapshot};

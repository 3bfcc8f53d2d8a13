//! Lock-free monitoring statistics using atomic operations
//!
//! Shared by every pass without mutex contention.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::monitor::PassStatus;

/// Counters aggregated across all monitoring passes
#[derive(Debug, Default)]
pub struct MonitorStats {
    pub passes: AtomicU64,
    pub slots_found: AtomicU64,
    pub no_slots: AtomicU64,
    pub blocked: AtomicU64,
    pub captchas: AtomicU64,
    pub errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub total_latency_ms: AtomicU64,
    pub active_sessions: AtomicU64,
    pub start_time: AtomicU64,
}

impl MonitorStats {
    pub fn new() -> Self {
        Self {
            start_time: AtomicU64::new(now_secs()),
            ..Default::default()
        }
    }

    /// Record a finished pass
    pub fn record_pass(&self, status: PassStatus, latency_ms: u64) {
        self.passes.fetch_add(1, Ordering::Relaxed);
        self.total_latency_ms.fetch_add(latency_ms, Ordering::Relaxed);
        let counter = match status {
            PassStatus::SlotsFound => &self.slots_found,
            PassStatus::NoSlots => &self.no_slots,
            PassStatus::Blocked => &self.blocked,
            PassStatus::Captcha => &self.captchas,
            PassStatus::Error => &self.errors,
            PassStatus::Timeout => &self.timeouts,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment active sessions
    pub fn add_session(&self) {
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement active sessions
    pub fn remove_session(&self) {
        self.active_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn pass_count(&self) -> u64 {
        self.passes.load(Ordering::Relaxed)
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    /// Average pass duration in milliseconds
    pub fn average_latency_ms(&self) -> f64 {
        let passes = self.passes.load(Ordering::Relaxed);
        if passes == 0 {
            return 0.0;
        }
        self.total_latency_ms.load(Ordering::Relaxed) as f64 / passes as f64
    }

    /// Share of passes that read the page without interference (0.0 - 1.0)
    pub fn clean_pass_rate(&self) -> f64 {
        let total = self.passes.load(Ordering::Relaxed);
        if total == 0 {
            return 1.0;
        }
        let clean = self.slots_found.load(Ordering::Relaxed)
            + self.no_slots.load(Ordering::Relaxed);
        clean as f64 / total as f64
    }

    /// Passes per hour since start or last reset
    pub fn passes_per_hour(&self) -> f64 {
        let elapsed_hours =
            (now_secs().saturating_sub(self.start_time.load(Ordering::Relaxed))) as f64 / 3600.0;
        if elapsed_hours < 0.001 {
            return 0.0;
        }
        self.passes.load(Ordering::Relaxed) as f64 / elapsed_hours
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.passes.store(0, Ordering::Relaxed);
        self.slots_found.store(0, Ordering::Relaxed);
        self.no_slots.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
        self.captchas.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.timeouts.store(0, Ordering::Relaxed);
        self.total_latency_ms.store(0, Ordering::Relaxed);
        self.start_time.store(now_secs(), Ordering::Relaxed);
    }

    /// Get snapshot for serialization
    pub fn snapshot(&self) -> MonitorStatsSnapshot {
        MonitorStatsSnapshot {
            passes: self.passes.load(Ordering::Relaxed),
            slots_found: self.slots_found.load(Ordering::Relaxed),
            no_slots: self.no_slots.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            captchas: self.captchas.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            average_latency_ms: self.average_latency_ms(),
            clean_pass_rate: self.clean_pass_rate(),
            passes_per_hour: self.passes_per_hour(),
            active_sessions: self.active_sessions.load(Ordering::Relaxed),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Serializable snapshot of monitoring stats
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStatsSnapshot {
    pub passes: u64,
    pub slots_found: u64,
    pub no_slots: u64,
    pub blocked: u64,
    pub captchas: u64,
    pub errors: u64,
    pub timeouts: u64,
    pub average_latency_ms: f64,
    pub clean_pass_rate: f64,
    pub passes_per_hour: f64,
    pub active_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_pass_routes_to_the_right_counter() {
        let stats = MonitorStats::new();
        stats.record_pass(PassStatus::SlotsFound, 1200);
        stats.record_pass(PassStatus::NoSlots, 800);
        stats.record_pass(PassStatus::Blocked, 400);

        assert_eq!(stats.pass_count(), 3);
        assert_eq!(stats.slots_found.load(Ordering::Relaxed), 1);
        assert_eq!(stats.blocked.load(Ordering::Relaxed), 1);
        assert!((stats.average_latency_ms() - 800.0).abs() < f64::EPSILON);
    }

    #[test]
    fn clean_pass_rate_ignores_interference_free_passes_only() {
        let stats = MonitorStats::new();
        stats.record_pass(PassStatus::NoSlots, 100);
        stats.record_pass(PassStatus::Captcha, 100);
        assert!((stats.clean_pass_rate() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn snapshot_reflects_counters() {
        let stats = MonitorStats::new();
        stats.record_pass(PassStatus::Timeout, 30_000);
        stats.add_session();
        let snap = stats.snapshot();
        assert_eq!(snap.timeouts, 1);
        assert_eq!(snap.active_sessions, 1);
    }
}

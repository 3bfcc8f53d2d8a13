//! Monitoring pass outcomes

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal status of one monitoring pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PassStatus {
    /// The portal refused the visit (HTTP 4xx or a denial phrase)
    Blocked,
    /// Navigation or automation error
    Error,
    /// The pass exceeded its time budget
    Timeout,
    /// A challenge stopped the pass and could not be resolved
    Captcha,
    NoSlots,
    SlotsFound,
}

impl PassStatus {
    /// Whether this status counts against the proxy used for the pass
    pub fn is_proxy_failure(&self) -> bool {
        matches!(self, Self::Blocked | Self::Error | Self::Timeout | Self::Captcha)
    }
}

/// Full record of one monitoring pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PassOutcome {
    pub target_id: String,
    pub target_url: String,
    pub status: PassStatus,
    /// HTTP status of the final navigation, 0 when navigation never completed
    pub http_status: u16,
    /// Matched slot elements when status is `SlotsFound`, otherwise 0
    pub slot_count: u32,
    /// Date of the first available slot, read via the target's locator
    pub slot_date: Option<String>,
    /// Time of the first available slot, read via the target's locator
    pub slot_time: Option<String>,
    pub detail: Option<String>,
    /// Path of the captured screenshot, when evidence was taken
    pub evidence: Option<String>,
    pub proxy: Option<String>,
    pub duration_ms: u64,
    pub at: DateTime<Utc>,
}

impl PassOutcome {
    pub fn new(target_id: &str, target_url: &str, status: PassStatus) -> Self {
        Self {
            target_id: target_id.to_string(),
            target_url: target_url.to_string(),
            status,
            http_status: 0,
            slot_count: 0,
            slot_date: None,
            slot_time: None,
            detail: None,
            evidence: None,
            proxy: None,
            duration_ms: 0,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// Receiver for pass outcomes. Implementations must not block.
pub trait OutcomeSink: Send + Sync {
    fn on_outcome(&self, outcome: &PassOutcome);
}

/// Sink that only logs, for headless operation
pub struct LogSink;

impl OutcomeSink for LogSink {
    fn on_outcome(&self, outcome: &PassOutcome) {
        match outcome.status {
            PassStatus::SlotsFound => tracing::info!(
                "[{}] {} slots on {} ({}ms)",
                outcome.target_id,
                outcome.slot_count,
                outcome.target_url,
                outcome.duration_ms
            ),
            PassStatus::NoSlots => tracing::debug!(
                "[{}] no slots ({}ms)",
                outcome.target_id,
                outcome.duration_ms
            ),
            _ => tracing::warn!(
                "[{}] {:?}: {} ({}ms)",
                outcome.target_id,
                outcome.status,
                outcome.detail.as_deref().unwrap_or("-"),
                outcome.duration_ms
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_negative_statuses_count_against_the_proxy() {
        assert!(PassStatus::Blocked.is_proxy_failure());
        assert!(PassStatus::Timeout.is_proxy_failure());
        assert!(PassStatus::Captcha.is_proxy_failure());
        assert!(!PassStatus::NoSlots.is_proxy_failure());
        assert!(!PassStatus::SlotsFound.is_proxy_failure());
    }

    #[test]
    fn status_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&PassStatus::SlotsFound).unwrap(),
            "\"slotsFound\""
        );
        assert_eq!(
            serde_json::to_string(&PassStatus::NoSlots).unwrap(),
            "\"noSlots\""
        );
    }

    #[test]
    fn outcome_carries_the_detected_slot_date_and_time() {
        let mut outcome = PassOutcome::new("t1", "https://rdv.example.gouv.fr/", PassStatus::SlotsFound);
        outcome.slot_date = Some("2026-09-15".to_string());
        outcome.slot_time = Some("09:30".to_string());
        let json = serde_json::to_string(&outcome).unwrap();
        assert!(json.contains("\"slotDate\":\"2026-09-15\""));
        assert!(json.contains("\"slotTime\":\"09:30\""));
    }
}

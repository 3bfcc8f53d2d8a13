//! Booking domain types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::browser::BrowserError;
use crate::monitor::Target;

/// Person a booking is made for
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientRecord {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub phone: Option<String>,
    /// Formatted as the portal expects, usually JJ/MM/AAAA
    pub birth_date: Option<String>,
    /// AGDREF number for residence permit procedures
    pub foreign_id: Option<String>,
    pub nationality: Option<String>,
}

/// Procedure families, matched by the wording in dropdown options
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcedureCategory {
    TitreDeSejour,
    Naturalisation,
    CarteIdentite,
    Passeport,
    PermisDeConduire,
    Other,
}

impl ProcedureCategory {
    /// Wording that identifies the category in option labels
    pub fn keywords(&self) -> &'static [&'static str] {
        match self {
            Self::TitreDeSejour => &["titre de séjour", "séjour", "agdref", "récépissé"],
            Self::Naturalisation => &["naturalisation", "nationalité"],
            Self::CarteIdentite => &["carte d'identité", "carte nationale", "cni"],
            Self::Passeport => &["passeport"],
            Self::PermisDeConduire => &["permis de conduire", "permis"],
            Self::Other => &[],
        }
    }

    /// Whether an option label belongs to this category
    pub fn matches(&self, label: &str) -> bool {
        let lower = label.to_lowercase();
        self.keywords().iter().any(|k| lower.contains(k))
    }
}

/// Booking workflow state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BookingStatus {
    Idle,
    OpeningPage,
    ProcedureSelected,
    FormFilled,
    DateSelected,
    CaptchaWait,
    Submitted,
    Booked,
    Failed,
}

impl BookingStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Booked | Self::Failed)
    }
}

/// One step in the booking audit trail
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingAction {
    pub action: String,
    pub detail: Option<String>,
    pub at: DateTime<Utc>,
}

impl BookingAction {
    pub fn new(action: &str) -> Self {
        Self {
            action: action.to_string(),
            detail: None,
            at: Utc::now(),
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// A booking to attempt, built from a monitoring pass that found slots
#[derive(Debug, Clone)]
pub struct BookingRequest {
    pub id: String,
    pub target: Target,
    pub client: ClientRecord,
    pub category: ProcedureCategory,
    /// Date of the detected slot, as the portal prints it
    pub slot_date: String,
    /// Time of the detected slot, when the portal offers one
    pub slot_time: Option<String>,
}

/// What the workflow produced
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BookingResult {
    pub booking_id: String,
    pub status: BookingStatus,
    pub reference: Option<String>,
    pub actions: Vec<BookingAction>,
    pub evidence: Option<String>,
}

/// Receives status transitions and audit actions as the workflow runs.
/// Implementations must not block.
pub trait BookingObserver: Send + Sync {
    fn on_status(&self, booking_id: &str, status: BookingStatus);
    fn on_action(&self, booking_id: &str, action: &BookingAction);
}

/// Observer for headless runs
pub struct LogObserver;

impl BookingObserver for LogObserver {
    fn on_status(&self, booking_id: &str, status: BookingStatus) {
        tracing::info!("[booking {}] -> {:?}", booking_id, status);
    }

    fn on_action(&self, booking_id: &str, action: &BookingAction) {
        tracing::debug!(
            "[booking {}] {} {}",
            booking_id,
            action.action,
            action.detail.as_deref().unwrap_or("")
        );
    }
}

/// Booking workflow errors
#[derive(Debug, thiserror::Error)]
pub enum BookingError {
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Step {step} failed: {reason}")]
    StepFailed { step: String, reason: String },

    #[error("Challenge blocked the booking: {0}")]
    ChallengeBlocked(String),
}

impl From<BookingError> for String {
    fn from(e: BookingError) -> Self {
        e.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn category_matches_dropdown_wording() {
        assert!(ProcedureCategory::TitreDeSejour.matches("Renouvellement de Titre de Séjour"));
        assert!(ProcedureCategory::CarteIdentite.matches("Première demande CNI"));
        assert!(!ProcedureCategory::Passeport.matches("Permis de conduire international"));
    }

    #[test]
    fn terminal_statuses_end_the_machine() {
        assert!(BookingStatus::Booked.is_terminal());
        assert!(BookingStatus::Failed.is_terminal());
        assert!(!BookingStatus::Submitted.is_terminal());
    }

    #[test]
    fn status_serializes_camel_case() {
        assert_eq!(
            serde_json::to_string(&BookingStatus::CaptchaWait).unwrap(),
            "\"captchaWait\""
        );
    }

    #[test]
    fn http_error_pages_surface_as_browser_errors() {
        let err = BookingError::from(BrowserError::NavigationHttpError(503));
        assert!(err.to_string().contains("HTTP 503"));
    }
}

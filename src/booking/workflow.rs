//! Booking automation workflow
//!
//! Drives a booking end to end: open the page, pick the procedure, fill the
//! client's details, take a date, clear whatever challenge stands in the way
//! and submit. Every step lands in the audit trail; any failure turns into a
//! `Failed` result with evidence instead of an error surfacing to the caller.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, info, warn};

use crate::browser::{BrowserError, Session, SessionPool, DEFAULT_NAV_TIMEOUT_SECS};
use crate::captcha::{detect_challenge, ChallengePipeline, ChallengeResolution};
use crate::monitor::EvidenceStore;

use super::fields::fill_client_fields;
use super::types::{
    BookingAction, BookingError, BookingObserver, BookingRequest, BookingResult, BookingStatus,
};

// Audit trail action names
const ACTION_PAGE_LOADED: &str = "PAGE_LOADED";
const ACTION_PROCEDURE_SELECTED: &str = "PROCEDURE_SELECTED";
const ACTION_FORM_FILLED: &str = "FORM_FILLED";
const ACTION_DATE_SELECTED: &str = "DATE_SELECTED";
const ACTION_CAPTCHA_SOLVED: &str = "CAPTCHA_SOLVED";
const ACTION_SUBMITTED: &str = "SUBMITTED";
const ACTION_ERROR: &str = "ERROR";

/// Delay after submission before the confirmation page is read
const SUBMIT_SETTLE: Duration = Duration::from_secs(3);

/// Inputs that accept the slot date directly
const NATIVE_DATE_INPUTS: &str = "input[type='date'], input[name*='date' i], .date-picker input";

/// Date cells tried in order when neither a native input nor the exact
/// slot-date cell exists
const DATE_SELECTORS: &[&str] = &[
    "td[data-date]:not(.disabled) a",
    "td[data-date]:not(.disabled)",
    "td.available",
    "a[data-date]",
    ".fc-day-future",
];

/// Calendar cells carrying the requested slot date
fn date_cell_selector(slot_date: &str) -> String {
    format!(
        "td[data-date=\"{d}\"], a[data-date=\"{d}\"], .available-date[data-date=\"{d}\"]",
        d = slot_date
    )
}

/// Time slot dropdowns
const TIME_SELECT_SELECTORS: &[&str] = &[
    "select[name*='heure' i]",
    "select[id*='heure' i]",
    "select[name*='time' i]",
    "select[id*='creneau' i]",
];

/// Submit button wording on French portals
const SUBMIT_LABELS: &[&str] = &["confirmer", "valider", "réserver", "envoyer"];

/// Terms-of-use checkbox that must be ticked before submission
const TERMS_CHECKBOX: &str = "input[type='checkbox'][name*='condition' i], \
     input[type='checkbox'][name*='accept' i], input[type='checkbox'][id*='consent' i]";

/// Inline image captchas next to booking forms
const IMAGE_CAPTCHA_SELECTOR: &str = "img[src*='captcha' i]";
const IMAGE_CAPTCHA_INPUT: &str = "input[name*='captcha' i], input[id*='captcha' i]";

/// Booking reference wording, most explicit first. The short ref/réf forms
/// demand a separator so they never fire on the front of a longer word like
/// "reference" and capture its tail.
static REFERENCE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)référence(?:\s+de\s+(?:votre\s+)?(?:réservation|rendez-vous|dossier))?\s*:\s*([A-Z0-9][A-Z0-9-]{3,})",
        r"(?i)numéro\s+de\s+(?:dossier|réservation|rendez-vous|confirmation)\s*:\s*([A-Z0-9][A-Z0-9-]{3,})",
        r"(?i)booking\s+ref(?:erence)?\s*:\s*([A-Z0-9][A-Z0-9-]{3,})",
        r"(?i)confirmation\s*(?:n°|#|:)\s*:?\s*([A-Z0-9][A-Z0-9-]{3,})",
        r"(?i)\bréf\.?\s*[:#]\s*([A-Z0-9][A-Z0-9-]{3,})",
        r"(?i)\bref\.?\s*[:#]\s*([A-Z0-9][A-Z0-9-]{3,})",
        r"(?i)n°\s*:?\s*([A-Z0-9][A-Z0-9-]{5,})",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("valid regex"))
    .collect()
});

/// Wording that confirms the booking went through
const CONFIRMATION_PHRASES: &[&str] = &[
    "rendez-vous est confirmé",
    "rendez-vous a été enregistré",
    "votre réservation est confirmée",
    "demande a été enregistrée",
    "confirmation de votre rendez-vous",
];

pub struct BookingWorkflow {
    pool: Arc<SessionPool>,
    pipeline: Arc<ChallengePipeline>,
    evidence: EvidenceStore,
    observer: Arc<dyn BookingObserver>,
}

impl BookingWorkflow {
    pub fn new(
        pool: Arc<SessionPool>,
        pipeline: Arc<ChallengePipeline>,
        evidence: EvidenceStore,
        observer: Arc<dyn BookingObserver>,
    ) -> Self {
        Self {
            pool,
            pipeline,
            evidence,
            observer,
        }
    }

    /// Run one booking attempt. Never panics out of a step; everything
    /// terminal becomes a `BookingResult`.
    pub async fn run(&self, request: &BookingRequest) -> BookingResult {
        let mut trail = Trail::new(&request.id, self.observer.clone());
        trail.status(BookingStatus::OpeningPage);

        let session = match self.pool.acquire(&request.target.domain()).await {
            Ok(session) => session,
            Err(e) => {
                trail.error(format!("session unavailable: {}", e));
                return trail.failed(None);
            }
        };

        let result = self.drive(&session, request, &mut trail).await;
        let outcome = match result {
            Ok(reference) => {
                trail.status(BookingStatus::Booked);
                info!(
                    "[booking {}] booked, reference {:?}",
                    request.id, reference
                );
                let evidence = self.capture(&session, request, "booked").await;
                trail.finished(BookingStatus::Booked, reference, evidence)
            }
            Err(e) => {
                warn!("[booking {}] failed: {}", request.id, e);
                trail.error(e.to_string());
                let evidence = self.capture(&session, request, "failed").await;
                trail.failed(evidence)
            }
        };
        self.pool.release(session).await;
        outcome
    }

    async fn drive(
        &self,
        session: &Session,
        request: &BookingRequest,
        trail: &mut Trail,
    ) -> Result<Option<String>, BookingError> {
        let nav = session
            .navigate(&request.target.url, DEFAULT_NAV_TIMEOUT_SECS)
            .await?;
        if nav.status >= 400 {
            return Err(BrowserError::NavigationHttpError(nav.status).into());
        }
        trail.action(
            BookingAction::new(ACTION_PAGE_LOADED)
                .with_detail(format!("HTTP {} {}", nav.status, nav.final_url)),
        );
        session
            .dismiss_consent(request.target.locators.cookie_accept.as_deref())
            .await;

        self.clear_challenge(session, trail, "after page load").await?;

        if let Some(select) = &request.target.locators.procedure_select {
            let selected = session
                .select_option_containing(select, request.category.keywords())
                .await
                .map_err(|e| step_failed("procedure selection", e))?;
            match selected {
                Some(option) => {
                    trail.action(
                        BookingAction::new(ACTION_PROCEDURE_SELECTED).with_detail(option),
                    );
                    session
                        .click_by_text(&["suivant", "continuer", "next"])
                        .await
                        .ok();
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                None => {
                    return Err(BookingError::StepFailed {
                        step: "procedure selection".to_string(),
                        reason: format!("no option matched {:?}", request.category),
                    })
                }
            }
        }
        trail.status(BookingStatus::ProcedureSelected);

        let filled = fill_client_fields(session, &request.client)
            .await
            .map_err(|e| step_failed("form fill", e))?;
        trail.action(
            BookingAction::new(ACTION_FORM_FILLED).with_detail(format!("{} field(s)", filled)),
        );
        trail.status(BookingStatus::FormFilled);

        let date = self
            .select_date(session, &request.slot_date, request.slot_time.as_deref())
            .await?;
        trail.action(BookingAction::new(ACTION_DATE_SELECTED).with_detail(date));
        trail.status(BookingStatus::DateSelected);

        self.solve_image_captcha(session, trail).await?;
        self.clear_challenge(session, trail, "before submission").await?;

        if session.check_checkbox(TERMS_CHECKBOX).await.unwrap_or(false) {
            debug!("[booking {}] conditions checkbox ticked", request.id);
        }

        if !session
            .click_by_text(SUBMIT_LABELS)
            .await
            .map_err(|e| step_failed("submission", e))?
        {
            return Err(BookingError::StepFailed {
                step: "submission".to_string(),
                reason: "no submit button found".to_string(),
            });
        }
        trail.action(BookingAction::new(ACTION_SUBMITTED));
        trail.status(BookingStatus::Submitted);
        tokio::time::sleep(SUBMIT_SETTLE).await;

        // Submission went through; a missing reference downgrades to a
        // warning, it never fails the booking
        let text = session
            .body_text()
            .await
            .map_err(|e| step_failed("confirmation read", e))?;
        if let Some(reference) = extract_reference(&text) {
            return Ok(Some(reference));
        }
        let lower = text.to_lowercase();
        if CONFIRMATION_PHRASES.iter().any(|p| lower.contains(p)) {
            warn!("[booking {}] confirmed without a readable reference", request.id);
        } else {
            warn!(
                "[booking {}] no confirmation wording found, reference left unset",
                request.id
            );
        }
        Ok(None)
    }

    /// Detect and resolve a widget challenge; unresolved challenges abort
    async fn clear_challenge(
        &self,
        session: &Session,
        trail: &mut Trail,
        stage: &str,
    ) -> Result<(), BookingError> {
        let html = session
            .content()
            .await
            .map_err(|e| step_failed("challenge check", e))?;
        let Some(detection) = detect_challenge(&html) else {
            return Ok(());
        };

        trail.status(BookingStatus::CaptchaWait);
        debug!("Challenge {:?} detected {}", detection.kind, stage);
        match self.pipeline.resolve(session, &detection).await {
            ChallengeResolution::Resolved { solve_time_ms } => {
                trail.action(
                    BookingAction::new(ACTION_CAPTCHA_SOLVED)
                        .with_detail(format!("{}ms {}", solve_time_ms, stage)),
                );
                Ok(())
            }
            ChallengeResolution::Unresolved { reason } => {
                Err(BookingError::ChallengeBlocked(format!("{} {}", reason, stage)))
            }
        }
    }

    /// Solve an inline image captcha when the form carries one
    async fn solve_image_captcha(
        &self,
        session: &Session,
        trail: &mut Trail,
    ) -> Result<(), BookingError> {
        if !session
            .is_visible(IMAGE_CAPTCHA_SELECTOR)
            .await
            .unwrap_or(false)
        {
            return Ok(());
        }
        trail.status(BookingStatus::CaptchaWait);
        match self
            .pipeline
            .solve_image_field(session, IMAGE_CAPTCHA_SELECTOR, IMAGE_CAPTCHA_INPUT)
            .await
        {
            ChallengeResolution::Resolved { solve_time_ms } => {
                trail.action(
                    BookingAction::new(ACTION_CAPTCHA_SOLVED)
                        .with_detail(format!("image {}ms", solve_time_ms)),
                );
                Ok(())
            }
            ChallengeResolution::Unresolved { reason } => {
                Err(BookingError::ChallengeBlocked(reason))
            }
        }
    }

    /// Pick the detected slot date, then its time when one was detected.
    ///
    /// A native date input gets the date written into it; otherwise the
    /// calendar cell carrying that exact date is clicked. The generic cell
    /// selectors are a last resort for calendars without data-date markup.
    async fn select_date(
        &self,
        session: &Session,
        slot_date: &str,
        slot_time: Option<&str>,
    ) -> Result<String, BookingError> {
        let mut detail = format!("date {}", slot_date);
        if session.is_visible(NATIVE_DATE_INPUTS).await.unwrap_or(false) {
            session
                .set_field_value(NATIVE_DATE_INPUTS, slot_date)
                .await
                .map_err(|e| step_failed("date selection", e))?;
            detail.push_str(" via input");
        } else if session
            .click_if_visible(&date_cell_selector(slot_date))
            .await
            .unwrap_or(false)
        {
            detail.push_str(" via calendar cell");
        } else {
            let mut clicked = None;
            for selector in DATE_SELECTORS {
                if session.click_if_visible(selector).await.unwrap_or(false) {
                    clicked = Some(*selector);
                    break;
                }
            }
            let Some(selector) = clicked else {
                return Err(BookingError::StepFailed {
                    step: "date selection".to_string(),
                    reason: format!("no control accepts date {}", slot_date),
                });
            };
            detail = format!("first available cell via {}", selector);
        }
        tokio::time::sleep(Duration::from_millis(800)).await;

        if let Some(time) = slot_time {
            for select in TIME_SELECT_SELECTORS {
                match session.select_option_containing(select, &[time]).await {
                    Ok(Some(option)) => {
                        detail.push_str(&format!(", time {}", option));
                        break;
                    }
                    _ => continue,
                }
            }
        }
        Ok(detail)
    }

    async fn capture(
        &self,
        session: &Session,
        request: &BookingRequest,
        reason: &str,
    ) -> Option<String> {
        match session.screenshot().await {
            Ok(png) => self
                .evidence
                .save(&request.id, reason, &png)
                .await
                .map(|p| p.display().to_string()),
            Err(e) => {
                warn!("[booking {}] screenshot failed: {}", request.id, e);
                None
            }
        }
    }
}

fn step_failed(step: &str, e: impl std::fmt::Display) -> BookingError {
    BookingError::StepFailed {
        step: step.to_string(),
        reason: e.to_string(),
    }
}

/// Pull a booking reference out of confirmation text
pub(crate) fn extract_reference(text: &str) -> Option<String> {
    for pattern in REFERENCE_PATTERNS.iter() {
        if let Some(captures) = pattern.captures(text) {
            return Some(captures[1].to_string());
        }
    }
    None
}

/// Collects the audit trail and forwards events to the observer
struct Trail {
    booking_id: String,
    observer: Arc<dyn BookingObserver>,
    actions: Vec<BookingAction>,
}

impl Trail {
    fn new(booking_id: &str, observer: Arc<dyn BookingObserver>) -> Self {
        Self {
            booking_id: booking_id.to_string(),
            observer,
            actions: Vec::new(),
        }
    }

    fn status(&self, status: BookingStatus) {
        self.observer.on_status(&self.booking_id, status);
    }

    fn action(&mut self, action: BookingAction) {
        self.observer.on_action(&self.booking_id, &action);
        self.actions.push(action);
    }

    fn error(&mut self, detail: String) {
        self.action(BookingAction::new(ACTION_ERROR).with_detail(detail));
    }

    fn finished(
        self,
        status: BookingStatus,
        reference: Option<String>,
        evidence: Option<String>,
    ) -> BookingResult {
        BookingResult {
            booking_id: self.booking_id,
            status,
            reference,
            actions: self.actions,
            evidence,
        }
    }

    fn failed(self, evidence: Option<String>) -> BookingResult {
        self.status(BookingStatus::Failed);
        self.finished(BookingStatus::Failed, None, evidence)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reference_is_extracted_from_french_wording() {
        let text = "Votre rendez-vous est confirmé.\nRéférence de votre réservation : ABC-12345";
        assert_eq!(extract_reference(text).as_deref(), Some("ABC-12345"));
    }

    #[test]
    fn numero_de_dossier_is_recognized() {
        let text = "Numéro de dossier : 75X99201";
        assert_eq!(extract_reference(text).as_deref(), Some("75X99201"));
    }

    #[test]
    fn explicit_wording_wins_over_generic_ref() {
        let text = "ref: ZZZZ9\nRéférence de votre rendez-vous : GOOD-1234";
        assert_eq!(extract_reference(text).as_deref(), Some("GOOD-1234"));
    }

    #[test]
    fn text_without_reference_yields_none() {
        assert_eq!(extract_reference("Merci de votre visite."), None);
    }

    #[test]
    fn booking_ref_english_wording_is_covered() {
        let text = "Booking reference: FR2026-0831";
        assert_eq!(extract_reference(text).as_deref(), Some("FR2026-0831"));
    }

    #[test]
    fn prose_mentioning_a_reference_is_not_captured() {
        // "ref"/"référence" without a separator must not swallow the tail of
        // the word or the next word of the sentence
        assert_eq!(
            extract_reference("Votre référence sera envoyée par email."),
            None
        );
        assert_eq!(
            extract_reference("Your booking reference will be emailed shortly."),
            None
        );
    }

    #[test]
    fn ref_with_separator_is_still_recognized() {
        assert_eq!(
            extract_reference("Réf: 2026-RDV-881").as_deref(),
            Some("2026-RDV-881")
        );
    }

    #[test]
    fn date_cells_are_matched_on_the_exact_slot_date() {
        let selector = date_cell_selector("2026-09-15");
        assert!(selector.contains(r#"td[data-date="2026-09-15"]"#));
        assert!(selector.contains(r#"a[data-date="2026-09-15"]"#));
        assert!(selector.contains(r#".available-date[data-date="2026-09-15"]"#));
    }

    #[test]
    fn confirmation_page_without_reference_yields_none_not_an_error() {
        // The portal wording is recognized even when no reference is printed;
        // the workflow books with an unset reference in that case
        let text = "Votre rendez-vous est confirmé. Merci de votre visite.";
        assert_eq!(extract_reference(text), None);
        let lower = text.to_lowercase();
        assert!(CONFIRMATION_PHRASES.iter().any(|p| lower.contains(p)));
    }
}

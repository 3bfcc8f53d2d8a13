//! Pass classification
//!
//! Pure rules over a page snapshot so the decision logic stays testable
//! without a browser. Rules apply first-match-wins: transport-level refusal
//! beats content, denial wording beats challenges, challenges beat slot
//! reading, and an explicit "nothing available" beats any slot matches left
//! in the markup.

use crate::captcha::{detect_challenge, ChallengeDetection};

use super::target::TargetLocators;

/// Everything classification needs from a loaded page
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub http_status: u16,
    pub html: String,
    /// Rendered body text, lowercased matching happens here
    pub text: String,
    pub slot_matches: u32,
    pub no_slot_matches: u32,
    pub challenge_matches: u32,
}

/// Decision for one snapshot
#[derive(Debug, Clone)]
pub enum Classification {
    Blocked { detail: String },
    Error { detail: String },
    Challenge(ChallengeDetection),
    NoSlots,
    SlotsFound { count: u32 },
}

/// Classify a page snapshot against a target's locators
pub fn classify(snapshot: &PageSnapshot, locators: &TargetLocators) -> Classification {
    if snapshot.http_status >= 400 {
        // Only an explicit 403 is a block at the transport level; 429 and the
        // rest are retryable errors unless a denial phrase says otherwise
        return match snapshot.http_status {
            403 => Classification::Blocked {
                detail: format!("HTTP {}", snapshot.http_status),
            },
            status => Classification::Error {
                detail: format!("HTTP {}", status),
            },
        };
    }

    let text = snapshot.text.to_lowercase();

    if let Some(phrase) = locators
        .denial_phrases
        .iter()
        .find(|p| text.contains(&p.to_lowercase()))
    {
        return Classification::Blocked {
            detail: format!("denial phrase: {}", phrase),
        };
    }

    if let Some(detection) = detect_challenge(&snapshot.html) {
        return Classification::Challenge(detection);
    }
    if snapshot.challenge_matches > 0 {
        // Locator hit without recognizable markup still stops the pass
        return Classification::Challenge(ChallengeDetection {
            kind: crate::captcha::ChallengeKind::Unknown,
            sitekey: None,
        });
    }

    if snapshot.no_slot_matches > 0 {
        return Classification::NoSlots;
    }
    if locators
        .no_slot_phrases
        .iter()
        .any(|p| text.contains(&p.to_lowercase()))
    {
        return Classification::NoSlots;
    }

    if snapshot.slot_matches > 0 {
        return Classification::SlotsFound {
            count: snapshot.slot_matches,
        };
    }

    // Nothing matched either way; without a positive slot signal the safe
    // reading is "nothing available"
    Classification::NoSlots
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(status: u16, text: &str) -> PageSnapshot {
        PageSnapshot {
            http_status: status,
            html: format!("<body>{}</body>", text),
            text: text.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn http_403_is_blocked_even_with_slot_matches() {
        let mut snap = snapshot(403, "des créneaux sont disponibles");
        snap.slot_matches = 5;
        let result = classify(&snap, &TargetLocators::default());
        assert!(matches!(result, Classification::Blocked { .. }));
    }

    #[test]
    fn http_429_is_an_error_not_a_block() {
        let snap = snapshot(429, "");
        assert!(matches!(
            classify(&snap, &TargetLocators::default()),
            Classification::Error { .. }
        ));
    }

    #[test]
    fn http_500_is_an_error_not_a_block() {
        let snap = snapshot(500, "");
        assert!(matches!(
            classify(&snap, &TargetLocators::default()),
            Classification::Error { .. }
        ));
    }

    #[test]
    fn denial_phrase_beats_slot_matches() {
        let mut snap = snapshot(200, "Accès refusé - votre adresse IP a été bloquée");
        snap.slot_matches = 3;
        assert!(matches!(
            classify(&snap, &TargetLocators::default()),
            Classification::Blocked { .. }
        ));
    }

    #[test]
    fn no_slot_phrase_beats_stale_slot_markup() {
        let mut snap = snapshot(200, "Aucun créneau disponible pour cette démarche.");
        snap.slot_matches = 2;
        let result = classify(&snap, &TargetLocators::default());
        assert!(matches!(result, Classification::NoSlots));
    }

    #[test]
    fn slot_matches_alone_mean_slots_found() {
        let mut snap = snapshot(200, "Choisissez votre créneau");
        snap.slot_matches = 4;
        match classify(&snap, &TargetLocators::default()) {
            Classification::SlotsFound { count } => assert_eq!(count, 4),
            other => panic!("unexpected classification: {:?}", other),
        }
    }

    #[test]
    fn challenge_markup_interrupts_slot_reading() {
        let mut snap = snapshot(200, "vérification en cours");
        snap.html = r#"<div class="g-recaptcha" data-sitekey="6LdKeyForTesting12345"></div>"#
            .to_string();
        snap.slot_matches = 1;
        assert!(matches!(
            classify(&snap, &TargetLocators::default()),
            Classification::Challenge(_)
        ));
    }

    #[test]
    fn quiet_page_defaults_to_no_slots() {
        let snap = snapshot(200, "Bienvenue sur le service de prise de rendez-vous");
        assert!(matches!(
            classify(&snap, &TargetLocators::default()),
            Classification::NoSlots
        ));
    }
}

//! Monitored targets and their locator configuration

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Scan frequency tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum Tier {
    /// Slots vanish within minutes
    Critical,
    High,
    #[default]
    Standard,
}

impl Tier {
    /// Interval between monitoring passes for this tier
    pub fn interval(&self) -> Duration {
        match self {
            Tier::Critical => Duration::from_secs(2 * 60),
            Tier::High => Duration::from_secs(5 * 60),
            Tier::Standard => Duration::from_secs(15 * 60),
        }
    }
}

/// CSS locators and phrase lists used to read a target's pages.
///
/// Phrase lists default to the wording French booking portals actually use;
/// per-target overrides replace the defaults entirely.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TargetLocators {
    /// Elements that represent an available slot
    pub slot: Option<String>,
    /// Element shown when no slots are open
    pub no_slot: Option<String>,
    /// Element that hosts a challenge widget
    pub challenge: Option<String>,
    /// Procedure dropdown on multi-procedure portals
    pub procedure_select: Option<String>,
    /// Element carrying the date of the first available slot
    pub slot_date: Option<String>,
    /// Element carrying the time of the first available slot
    pub slot_time: Option<String>,
    /// Cookie banner accept button, tried before the built-in list
    pub cookie_accept: Option<String>,
    /// Button advancing a multi-step form, tried before the built-in list
    pub next_button: Option<String>,
    /// Phrases meaning "no appointments available"
    pub no_slot_phrases: Vec<String>,
    /// Phrases meaning the portal refused the visit
    pub denial_phrases: Vec<String>,
}

impl Default for TargetLocators {
    fn default() -> Self {
        Self {
            slot: None,
            no_slot: None,
            challenge: None,
            procedure_select: None,
            slot_date: None,
            slot_time: None,
            cookie_accept: None,
            next_button: None,
            no_slot_phrases: default_no_slot_phrases(),
            denial_phrases: default_denial_phrases(),
        }
    }
}

fn default_no_slot_phrases() -> Vec<String> {
    [
        "aucun créneau disponible",
        "aucune plage horaire",
        "aucun rendez-vous",
        "indisponible",
        "complet",
        "il n'existe plus de plage horaire",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

fn default_denial_phrases() -> Vec<String> {
    [
        "access denied",
        "accès refusé",
        "accès interdit",
        "forbidden",
        "vous avez été bloqué",
        "too many requests",
        "rate limit",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// One monitored booking page
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    pub id: String,
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub locators: TargetLocators,
    /// French department number, enables generated fallback URLs
    #[serde(default)]
    pub department: Option<String>,
    /// Alternate URLs probed when the primary one drifts away
    #[serde(default)]
    pub fallback_urls: Vec<String>,
    /// URL the target was originally configured with, kept when drift
    /// adoption rewrites `url`
    #[serde(default)]
    pub original_url: Option<String>,
    /// Failed passes in a row, including rejected drift destinations
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub last_checked_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_slot_found_at: Option<DateTime<Utc>>,
}

fn default_enabled() -> bool {
    true
}

impl Target {
    pub fn new(id: impl Into<String>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            url: url.into(),
            tier: Tier::default(),
            enabled: true,
            locators: TargetLocators::default(),
            department: None,
            fallback_urls: Vec::new(),
            original_url: None,
            consecutive_failures: 0,
            last_checked_at: None,
            last_slot_found_at: None,
        }
    }

    /// Host component of the target URL, used as the proxy health domain
    pub fn domain(&self) -> String {
        url::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_else(|| self.url.clone())
    }

    /// Move monitoring to a replacement URL. The originally configured URL
    /// is preserved across any number of moves, and the failure streak
    /// starts over on the new address.
    pub fn adopt_url(&mut self, url: String) {
        if self.original_url.is_none() {
            self.original_url = Some(self.url.clone());
        }
        self.url = url;
        self.consecutive_failures = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_intervals_are_ordered() {
        assert!(Tier::Critical.interval() < Tier::High.interval());
        assert!(Tier::High.interval() < Tier::Standard.interval());
        assert_eq!(Tier::Critical.interval(), Duration::from_secs(120));
    }

    #[test]
    fn domain_comes_from_the_url_host() {
        let target = Target::new("t1", "Préfecture 75", "https://rdv.prefecture75.example.fr/creneaux?type=cni");
        assert_eq!(target.domain(), "rdv.prefecture75.example.fr");
    }

    #[test]
    fn default_phrases_cover_the_common_wording() {
        let locators = TargetLocators::default();
        assert!(locators
            .no_slot_phrases
            .iter()
            .any(|p| p.contains("aucun créneau")));
        assert!(locators.denial_phrases.iter().any(|p| p == "access denied"));
    }

    #[test]
    fn target_deserializes_with_minimal_fields() {
        let json = r#"{"id":"t2","name":"Sub-préfecture","url":"https://rdv.example.gouv.fr/"}"#;
        let target: Target = serde_json::from_str(json).unwrap();
        assert!(target.enabled);
        assert_eq!(target.tier, Tier::Standard);
        assert!(!target.locators.no_slot_phrases.is_empty());
        assert!(target.locators.cookie_accept.is_none());
        assert!(target.locators.next_button.is_none());
        assert_eq!(target.consecutive_failures, 0);
        assert!(target.last_checked_at.is_none());
    }

    #[test]
    fn adoption_preserves_the_first_configured_url() {
        let mut target = Target::new("t1", "Préfecture", "https://old.gouv.fr/rdv");
        target.consecutive_failures = 4;

        target.adopt_url("https://new.gouv.fr/rdv".to_string());
        assert_eq!(target.url, "https://new.gouv.fr/rdv");
        assert_eq!(target.original_url.as_deref(), Some("https://old.gouv.fr/rdv"));
        assert_eq!(target.consecutive_failures, 0);

        // A second move keeps pointing at the original, not the first adoption
        target.adopt_url("https://newer.gouv.fr/rdv".to_string());
        assert_eq!(target.original_url.as_deref(), Some("https://old.gouv.fr/rdv"));
    }
}

//! URL drift detection
//!
//! Booking portals move: pages get renamed, redirected to new paths, or
//! replaced by maintenance shells. When a monitored URL stops landing where
//! it used to, the detector scores the destination and either adopts it,
//! parks it for operator review, or rejects it. The scoring is pure so every
//! threshold stays unit-testable.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::monitor::Target;

/// Candidates at or above this confidence replace the target URL unattended
pub const AUTO_ADOPT_THRESHOLD: f64 = 0.8;
/// Candidates at or above this confidence wait for operator approval
pub const PENDING_THRESHOLD: f64 = 0.6;
/// Fallback URLs need this much confidence before monitoring moves to one
pub const FALLBACK_ADOPT_THRESHOLD: f64 = 0.7;

/// Words a live booking page is expected to carry
const BOOKING_KEYWORDS: &[&str] = &[
    "rendez-vous",
    "créneau",
    "disponibilité",
    "réservation",
    "calendrier",
    "horaire",
    "démarche",
];

/// Words that mark a page as a maintenance shell
const MAINTENANCE_KEYWORDS: &[&str] = &[
    "site en maintenance",
    "maintenance en cours",
    "temporairement indisponible",
    "service indisponible",
    "en cours de maintenance",
];

/// Hosts (or host suffixes, leading dot) that booking portals live on
const TRUSTED_DOMAINS: &[&str] = &[
    ".gouv.fr",
    "rdv-titres.apps.paris.fr",
    "doctolib.fr",
    "prefenligne.fr",
];

/// Signals extracted from a candidate destination page
#[derive(Debug, Clone, Default)]
pub struct DriftSignals {
    /// Final navigation returned HTTP 200
    pub http_ok: bool,
    /// HTTP status, used to zero out failed loads
    pub http_status: u16,
    /// Booking keywords found in the page text
    pub keyword_hits: u32,
    /// Target locators that still match on the candidate page
    pub locator_hits: u32,
    /// Target locators that were checked (0 when the target has none)
    pub locators_checked: u32,
    /// Candidate host is on a known booking domain
    pub trusted_domain: bool,
    /// Page text carries a maintenance marker
    pub maintenance: bool,
}

impl DriftSignals {
    /// Derive signals from a candidate page
    pub fn from_page(url: &str, http_status: u16, text: &str) -> Self {
        let lower = text.to_lowercase();
        let host = url::Url::parse(url)
            .ok()
            .and_then(|u| u.host_str().map(|h| h.to_string()))
            .unwrap_or_default();
        Self {
            http_ok: http_status == 200,
            http_status,
            keyword_hits: keyword_hits(&lower),
            locator_hits: 0,
            locators_checked: 0,
            trusted_domain: is_trusted_domain(&host),
            maintenance: MAINTENANCE_KEYWORDS.iter().any(|m| lower.contains(m)),
        }
    }

    pub fn with_locators(mut self, hits: u32, checked: u32) -> Self {
        self.locator_hits = hits;
        self.locators_checked = checked;
        self
    }
}

/// Count booking keywords present in lowercased page text
pub fn keyword_hits(lower_text: &str) -> u32 {
    BOOKING_KEYWORDS
        .iter()
        .filter(|k| lower_text.contains(*k))
        .count() as u32
}

/// Whether a host belongs to a known booking domain
pub fn is_trusted_domain(host: &str) -> bool {
    TRUSTED_DOMAINS.iter().any(|d| {
        if let Some(suffix) = d.strip_prefix('.') {
            host == suffix || host.ends_with(*d)
        } else {
            host == *d || host.ends_with(&format!(".{}", d))
        }
    })
}

/// Score a candidate destination in [0, 1].
///
/// Failed loads and maintenance shells score zero outright. Otherwise the
/// signals stack: HTTP 200 contributes 0.20, booking keywords 0.125 each up
/// to 0.25, surviving locators 0.15 each up to 0.30 (a flat 0.15 when the
/// target has no locators to check), and a trusted domain 0.25.
pub fn confidence_score(signals: &DriftSignals) -> f64 {
    if signals.http_status >= 400 || signals.maintenance {
        return 0.0;
    }

    let mut score = 0.0;
    if signals.http_ok {
        score += 0.20;
    }
    score += (signals.keyword_hits as f64 * 0.125).min(0.25);
    score += if signals.locators_checked == 0 {
        0.15
    } else {
        (signals.locator_hits as f64 * 0.15).min(0.30)
    };
    if signals.trusted_domain {
        score += 0.25;
    }
    score.clamp(0.0, 1.0)
}

/// Candidate URLs following the naming conventions French prefectures use,
/// built from the target's department number and the department name taken
/// from the target id (`paris_75` -> `paris`). The target's current URL is
/// filtered out.
pub fn generate_fallback_urls(target: &Target) -> Vec<String> {
    let Some(department) = target.department.as_deref() else {
        return Vec::new();
    };
    let dept_name = target
        .id
        .split(['_', '-'])
        .next()
        .unwrap_or(target.id.as_str());

    [
        format!("https://www.{}.gouv.fr/booking/create", dept_name),
        format!("https://www.{}.gouv.fr/booking/create/{}", dept_name, department),
        format!("https://www.{}.gouv.fr/prendre-rendez-vous", dept_name),
        format!("https://www.{}.gouv.fr/demarches/rendez-vous", dept_name),
        format!(
            "https://rdv-prefecture.interieur.gouv.fr/rdvpref/reservation/demarche/{}/",
            department
        ),
    ]
    .into_iter()
    .filter(|url| *url != target.url)
    .collect()
}

/// Verdict on a drifted URL
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "verdict")]
pub enum DriftVerdict {
    /// Confident enough to monitor the new URL immediately
    Adopted { url: String, confidence: f64 },
    /// Plausible but parked until an operator approves it
    Pending { url: String, confidence: f64 },
    Rejected { url: String, confidence: f64 },
}

impl DriftVerdict {
    fn from_score(url: String, confidence: f64) -> Self {
        if confidence >= AUTO_ADOPT_THRESHOLD {
            Self::Adopted { url, confidence }
        } else if confidence >= PENDING_THRESHOLD {
            Self::Pending { url, confidence }
        } else {
            Self::Rejected { url, confidence }
        }
    }
}

/// A candidate awaiting operator review
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingDrift {
    pub target_id: String,
    pub old_url: String,
    pub candidate_url: String,
    pub confidence: f64,
}

/// Tracks drifted URLs per target and holds the pending review queue
#[derive(Debug, Default)]
pub struct DriftDetector {
    pending: DashMap<String, PendingDrift>,
    /// Adopted replacements waiting for the target's loop to pick them up
    adopted: DashMap<String, String>,
    /// Rejected destinations per target since the loop last drained them;
    /// each one counts as a failed pass for the target
    rejections: DashMap<String, u32>,
}

impl DriftDetector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Score a destination the target's URL now lands on. Adoption and
    /// rejection are returned to the caller; pending candidates are also
    /// queued for review, replacing any earlier candidate for the target.
    pub fn handle_url_change(
        &self,
        target: &Target,
        final_url: &str,
        signals: &DriftSignals,
    ) -> DriftVerdict {
        let confidence = confidence_score(signals);
        let verdict = DriftVerdict::from_score(final_url.to_string(), confidence);
        match &verdict {
            DriftVerdict::Adopted { url, confidence } => {
                info!(
                    "[{}] URL drift adopted: {} -> {} (confidence {:.2})",
                    target.id, target.url, url, confidence
                );
                self.pending.remove(&target.id);
                self.adopted.insert(target.id.clone(), url.clone());
            }
            DriftVerdict::Pending { url, confidence } => {
                warn!(
                    "[{}] URL drift pending review: {} -> {} (confidence {:.2})",
                    target.id, target.url, url, confidence
                );
                self.pending.insert(
                    target.id.clone(),
                    PendingDrift {
                        target_id: target.id.clone(),
                        old_url: target.url.clone(),
                        candidate_url: url.clone(),
                        confidence: *confidence,
                    },
                );
            }
            DriftVerdict::Rejected { url, confidence } => {
                warn!(
                    "[{}] URL drift rejected: {} (confidence {:.2})",
                    target.id, url, confidence
                );
                *self.rejections.entry(target.id.clone()).or_insert(0) += 1;
            }
        }
        verdict
    }

    /// Pick the first fallback URL whose probe clears the adoption bar
    pub fn select_fallback<'a>(
        &self,
        target: &Target,
        probes: impl IntoIterator<Item = (&'a str, DriftSignals)>,
    ) -> Option<(String, f64)> {
        for (url, signals) in probes {
            let confidence = confidence_score(&signals);
            if confidence >= FALLBACK_ADOPT_THRESHOLD {
                info!(
                    "[{}] fallback URL adopted: {} (confidence {:.2})",
                    target.id, url, confidence
                );
                return Some((url.to_string(), confidence));
            }
        }
        None
    }

    /// Approve a pending candidate; returns the URL the target should move to
    pub fn approve(&self, target_id: &str) -> Option<String> {
        self.pending.remove(target_id).map(|(_, p)| {
            info!("[{}] pending drift approved: {}", target_id, p.candidate_url);
            self.adopted
                .insert(target_id.to_string(), p.candidate_url.clone());
            p.candidate_url
        })
    }

    /// Record an operator-supplied replacement URL (full confidence)
    pub fn manual_update(&self, target_id: &str, url: &str) {
        info!("[{}] URL manually updated to {}", target_id, url);
        self.pending.remove(target_id);
        self.adopted.insert(target_id.to_string(), url.to_string());
    }

    /// Take the adopted replacement for a target, if one is waiting
    pub fn take_adopted(&self, target_id: &str) -> Option<String> {
        self.adopted.remove(target_id).map(|(_, url)| url)
    }

    /// Drain the rejected-destination count for a target
    pub fn take_rejections(&self, target_id: &str) -> u32 {
        self.rejections
            .remove(target_id)
            .map(|(_, n)| n)
            .unwrap_or(0)
    }

    /// Discard a pending candidate
    pub fn reject(&self, target_id: &str) -> bool {
        self.pending.remove(target_id).is_some()
    }

    pub fn pending_for(&self, target_id: &str) -> Option<PendingDrift> {
        self.pending.get(target_id).map(|p| p.clone())
    }

    pub fn pending_list(&self) -> Vec<PendingDrift> {
        self.pending.iter().map(|p| p.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_signals() -> DriftSignals {
        DriftSignals {
            http_ok: true,
            http_status: 200,
            keyword_hits: 0,
            locator_hits: 0,
            locators_checked: 0,
            trusted_domain: false,
            maintenance: false,
        }
    }

    #[test]
    fn confidence_stays_in_unit_interval() {
        let maxed = DriftSignals {
            keyword_hits: 10,
            locator_hits: 10,
            locators_checked: 10,
            trusted_domain: true,
            ..base_signals()
        };
        let score = confidence_score(&maxed);
        assert!((0.0..=1.0).contains(&score));
        assert!(score >= AUTO_ADOPT_THRESHOLD);
    }

    #[test]
    fn confidence_is_monotonic_in_each_signal() {
        let base = base_signals();
        let with_keywords = DriftSignals {
            keyword_hits: 1,
            ..base.clone()
        };
        let with_trust = DriftSignals {
            trusted_domain: true,
            ..base.clone()
        };
        let with_locators = DriftSignals {
            locator_hits: 1,
            locators_checked: 2,
            ..base.clone()
        };
        assert!(confidence_score(&with_keywords) > confidence_score(&base));
        assert!(confidence_score(&with_trust) > confidence_score(&base));
        // One surviving locator of two checked beats the no-locator flat credit
        assert!(confidence_score(&with_locators) >= confidence_score(&base));
    }

    #[test]
    fn trusted_redirect_with_keywords_clears_auto_adoption() {
        // HTTP 200 on a trusted host, two booking keywords, no locators
        // configured: 0.20 + 0.25 + 0.15 + 0.25
        let signals = DriftSignals {
            keyword_hits: 2,
            trusted_domain: true,
            ..base_signals()
        };
        let score = confidence_score(&signals);
        assert!(score >= AUTO_ADOPT_THRESHOLD, "score was {}", score);
    }

    #[test]
    fn http_500_scores_zero() {
        let signals = DriftSignals {
            http_ok: false,
            http_status: 500,
            keyword_hits: 5,
            trusted_domain: true,
            ..base_signals()
        };
        assert_eq!(confidence_score(&signals), 0.0);
    }

    #[test]
    fn maintenance_shell_scores_zero() {
        let signals = DriftSignals::from_page(
            "https://rdv.prefecture.gouv.fr/",
            200,
            "Site en maintenance, merci de revenir plus tard. Rendez-vous impossible.",
        );
        assert!(signals.maintenance);
        assert_eq!(confidence_score(&signals), 0.0);
    }

    #[test]
    fn gouv_fr_subdomains_are_trusted() {
        assert!(is_trusted_domain("rdv.prefecture-75.gouv.fr"));
        assert!(is_trusted_domain("rdv-prefecture.interieur.gouv.fr"));
        assert!(is_trusted_domain("www.doctolib.fr"));
        assert!(!is_trusted_domain("rdv-gouv-fr.example.com"));
    }

    #[test]
    fn generated_fallbacks_follow_prefecture_conventions() {
        let mut target = Target::new(
            "paris_75",
            "Préfecture de Paris",
            "https://www.paris.gouv.fr/booking/create",
        );
        target.department = Some("75".to_string());
        let urls = generate_fallback_urls(&target);
        assert!(!urls.contains(&"https://www.paris.gouv.fr/booking/create".to_string()));
        assert!(urls.contains(&"https://www.paris.gouv.fr/booking/create/75".to_string()));
        assert!(urls.iter().any(|u| u.contains("rdv-prefecture.interieur.gouv.fr")));
    }

    #[test]
    fn no_department_means_no_generated_fallbacks() {
        let target = Target::new("t1", "Préfecture", "https://old.gouv.fr/rdv");
        assert!(generate_fallback_urls(&target).is_empty());
    }

    #[test]
    fn pending_candidates_wait_for_approval() {
        let detector = DriftDetector::new();
        let target = Target::new("t1", "Préfecture", "https://old.gouv.fr/rdv");
        // 0.20 + 0.25 (trusted) + 0.15 (no locators) = 0.60 -> pending
        let signals = DriftSignals {
            trusted_domain: true,
            ..base_signals()
        };
        let verdict = detector.handle_url_change(&target, "https://new.gouv.fr/rdv", &signals);
        assert!(matches!(verdict, DriftVerdict::Pending { .. }));
        assert!(detector.pending_for("t1").is_some());

        let approved = detector.approve("t1").unwrap();
        assert_eq!(approved, "https://new.gouv.fr/rdv");
        assert!(detector.pending_for("t1").is_none());
        assert_eq!(
            detector.take_adopted("t1").as_deref(),
            Some("https://new.gouv.fr/rdv")
        );
        assert!(detector.take_adopted("t1").is_none());
    }

    #[test]
    fn manual_update_supersedes_pending_review() {
        let detector = DriftDetector::new();
        let target = Target::new("t1", "Préfecture", "https://old.gouv.fr/rdv");
        let signals = DriftSignals {
            trusted_domain: true,
            ..base_signals()
        };
        detector.handle_url_change(&target, "https://new.gouv.fr/rdv", &signals);
        detector.manual_update("t1", "https://operator.gouv.fr/rdv");
        assert!(detector.pending_for("t1").is_none());
        assert_eq!(
            detector.take_adopted("t1").as_deref(),
            Some("https://operator.gouv.fr/rdv")
        );
    }

    #[test]
    fn rejected_candidates_are_not_queued() {
        let detector = DriftDetector::new();
        let target = Target::new("t1", "Préfecture", "https://old.gouv.fr/rdv");
        let signals = DriftSignals {
            http_ok: false,
            http_status: 404,
            ..base_signals()
        };
        let verdict = detector.handle_url_change(&target, "https://elsewhere.example.com", &signals);
        assert!(matches!(verdict, DriftVerdict::Rejected { .. }));
        assert!(detector.pending_for("t1").is_none());
    }

    #[test]
    fn rejections_accumulate_until_drained() {
        let detector = DriftDetector::new();
        let target = Target::new("t1", "Préfecture", "https://old.gouv.fr/rdv");
        let signals = DriftSignals {
            http_ok: false,
            http_status: 404,
            ..base_signals()
        };
        detector.handle_url_change(&target, "https://bad.example.com/a", &signals);
        detector.handle_url_change(&target, "https://bad.example.com/b", &signals);
        assert_eq!(detector.take_rejections("t1"), 2);
        assert_eq!(detector.take_rejections("t1"), 0);
    }

    #[test]
    fn first_qualifying_fallback_wins() {
        let detector = DriftDetector::new();
        let target = Target::new("t1", "Préfecture", "https://old.gouv.fr/rdv");
        let weak = DriftSignals {
            http_ok: false,
            http_status: 404,
            ..base_signals()
        };
        // 0.20 + 0.125 + 0.15 + 0.25 = 0.725 >= 0.7
        let strong = DriftSignals {
            keyword_hits: 1,
            trusted_domain: true,
            ..base_signals()
        };
        let picked = detector.select_fallback(
            &target,
            vec![
                ("https://a.gouv.fr/rdv", weak),
                ("https://b.gouv.fr/rdv", strong),
            ],
        );
        assert_eq!(picked.unwrap().0, "https://b.gouv.fr/rdv");
    }
}

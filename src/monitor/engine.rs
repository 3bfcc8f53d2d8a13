//! Monitoring pass engine
//!
//! One pass: borrow a session from the pool, load the target, clear the
//! usual obstacles (cookie banners, procedure dropdowns, challenges), read
//! the page and classify it. The engine never crashes a pass into the
//! caller; everything terminal becomes a `PassOutcome`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::browser::{BrowserError, Session, SessionPool, DEFAULT_NAV_TIMEOUT_SECS};
use crate::captcha::ChallengePipeline;
use crate::drift::{generate_fallback_urls, DriftDetector, DriftSignals};
use crate::proxy::ProxyTracker;
use crate::stats::MonitorStats;

use super::classify::{classify, Classification, PageSnapshot};
use super::evidence::EvidenceStore;
use super::outcome::{OutcomeSink, PassOutcome, PassStatus};
use super::target::Target;

/// Whole-pass time budget, navigation included
const PASS_BUDGET_SECS: u64 = 90;

/// Challenge resolution rounds per pass before giving up
const MAX_CHALLENGE_ROUNDS: u32 = 2;

/// Failed passes in a row before fallback URLs get probed
const FALLBACK_PROBE_AFTER: u32 = 3;

/// Buttons that advance a multi-step form after procedure selection
const NEXT_SELECTORS: &[&str] = &[
    "button[type='submit']",
    "input[type='submit']",
    "button[class*='suivant']",
    "a[class*='suivant']",
];

pub struct MonitorEngine {
    pool: Arc<SessionPool>,
    proxy_tracker: Arc<ProxyTracker>,
    pipeline: Arc<ChallengePipeline>,
    drift: Arc<DriftDetector>,
    evidence: EvidenceStore,
    stats: Arc<MonitorStats>,
    sink: Arc<dyn OutcomeSink>,
}

impl MonitorEngine {
    pub fn new(
        pool: Arc<SessionPool>,
        proxy_tracker: Arc<ProxyTracker>,
        pipeline: Arc<ChallengePipeline>,
        drift: Arc<DriftDetector>,
        evidence: EvidenceStore,
        stats: Arc<MonitorStats>,
        sink: Arc<dyn OutcomeSink>,
    ) -> Self {
        Self {
            pool,
            proxy_tracker,
            pipeline,
            drift,
            evidence,
            stats,
            sink,
        }
    }

    pub fn drift(&self) -> &Arc<DriftDetector> {
        &self.drift
    }

    pub fn stats(&self) -> &Arc<MonitorStats> {
        &self.stats
    }

    /// Run one monitoring pass against a target.
    ///
    /// A starved session pool is the one condition that escalates to the
    /// caller: it says nothing about the target, so the pass is skipped
    /// instead of recorded.
    pub async fn run_pass(&self, target: &Target) -> Result<PassOutcome, BrowserError> {
        let started = Instant::now();
        let domain = target.domain();

        let session = match self.pool.acquire(&domain).await {
            Ok(session) => session,
            Err(e @ BrowserError::PoolExhausted(_)) => return Err(e),
            Err(e) => {
                let mut outcome = PassOutcome::new(&target.id, &target.url, PassStatus::Error)
                    .with_detail(format!("session unavailable: {}", e));
                outcome.duration_ms = started.elapsed().as_millis() as u64;
                return Ok(self.finish(outcome));
            }
        };

        self.stats.add_session();
        let budget = Duration::from_secs(PASS_BUDGET_SECS);
        let mut outcome =
            match tokio::time::timeout(budget, self.execute(&session, target)).await {
                Ok(outcome) => outcome,
                Err(_) => PassOutcome::new(&target.id, &target.url, PassStatus::Timeout)
                    .with_detail(format!("pass exceeded {}s budget", PASS_BUDGET_SECS)),
            };
        outcome.duration_ms = started.elapsed().as_millis() as u64;

        if let Some(proxy) = session.proxy() {
            outcome.proxy = Some(proxy.key());
            if outcome.status.is_proxy_failure() {
                self.proxy_tracker.report_failure(proxy, &domain);
            } else {
                self.proxy_tracker.report_success(proxy, &domain);
            }
        }

        self.pool.release(session).await;
        self.stats.remove_session();
        Ok(self.finish(outcome))
    }

    fn finish(&self, outcome: PassOutcome) -> PassOutcome {
        self.stats
            .record_pass(outcome.status, outcome.duration_ms);
        self.sink.on_outcome(&outcome);
        outcome
    }

    async fn execute(&self, session: &Session, target: &Target) -> PassOutcome {
        let nav = match session.navigate(&target.url, DEFAULT_NAV_TIMEOUT_SECS).await {
            Ok(nav) => nav,
            Err(BrowserError::NavigationTimeout(secs)) => {
                return PassOutcome::new(&target.id, &target.url, PassStatus::Timeout)
                    .with_detail(format!("navigation timed out after {}s", secs));
            }
            Err(e) => {
                return PassOutcome::new(&target.id, &target.url, PassStatus::Error)
                    .with_detail(e.to_string());
            }
        };

        session
            .dismiss_consent(target.locators.cookie_accept.as_deref())
            .await;
        let procedure_selected = self.select_procedure(session, target).await;
        self.advance_step(session, target, procedure_selected).await;

        let mut snapshot = match self.take_snapshot(session, target, nav.status).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                return PassOutcome::new(&target.id, &target.url, PassStatus::Error)
                    .with_detail(format!("page unreadable: {}", e));
            }
        };

        if url_moved(&target.url, &nav.final_url) {
            let signals = DriftSignals::from_page(&nav.final_url, nav.status, &snapshot.text)
                .with_locators(snapshot.slot_matches.min(1), locators_checked(target));
            self.drift.handle_url_change(target, &nav.final_url, &signals);
        }

        let mut rounds = 0;
        loop {
            match classify(&snapshot, &target.locators) {
                Classification::Blocked { detail } => {
                    let mut outcome =
                        PassOutcome::new(&target.id, &target.url, PassStatus::Blocked)
                            .with_detail(detail);
                    outcome.http_status = nav.status;
                    outcome.evidence = self.capture(session, target, "blocked").await;
                    return outcome;
                }
                Classification::Error { detail } => {
                    let mut outcome = PassOutcome::new(&target.id, &target.url, PassStatus::Error)
                        .with_detail(detail);
                    outcome.http_status = nav.status;
                    return outcome;
                }
                Classification::Challenge(detection) => {
                    rounds += 1;
                    if rounds >= MAX_CHALLENGE_ROUNDS {
                        let mut outcome =
                            PassOutcome::new(&target.id, &target.url, PassStatus::Captcha)
                                .with_detail("challenge persisted after resolution");
                        outcome.http_status = nav.status;
                        outcome.evidence = self.capture(session, target, "captcha").await;
                        return outcome;
                    }
                    let resolution = self.pipeline.resolve(session, &detection).await;
                    if !resolution.is_resolved() {
                        let detail = match resolution {
                            crate::captcha::ChallengeResolution::Unresolved { reason } => reason,
                            _ => String::new(),
                        };
                        let mut outcome =
                            PassOutcome::new(&target.id, &target.url, PassStatus::Captcha)
                                .with_detail(detail);
                        outcome.http_status = nav.status;
                        outcome.evidence = self.capture(session, target, "captcha").await;
                        return outcome;
                    }
                    debug!("[{}] challenge resolved, re-reading page", target.id);
                    snapshot = match self.take_snapshot(session, target, nav.status).await {
                        Ok(snapshot) => snapshot,
                        Err(e) => {
                            return PassOutcome::new(&target.id, &target.url, PassStatus::Error)
                                .with_detail(format!("page unreadable: {}", e));
                        }
                    };
                }
                Classification::NoSlots => {
                    let mut outcome =
                        PassOutcome::new(&target.id, &target.url, PassStatus::NoSlots);
                    outcome.http_status = nav.status;
                    return outcome;
                }
                Classification::SlotsFound { count } => {
                    info!("[{}] {} slot(s) found on {}", target.id, count, target.url);
                    let mut outcome =
                        PassOutcome::new(&target.id, &target.url, PassStatus::SlotsFound);
                    outcome.http_status = nav.status;
                    outcome.slot_count = count;
                    if let Some(selector) = &target.locators.slot_date {
                        outcome.slot_date = session.text_of(selector).await.ok().flatten();
                    }
                    if let Some(selector) = &target.locators.slot_time {
                        outcome.slot_time = session.text_of(selector).await.ok().flatten();
                    }
                    outcome.evidence = self.capture(session, target, "slotsFound").await;
                    return outcome;
                }
            }
        }
    }

    /// Run a target's monitoring loop until shutdown is signalled.
    ///
    /// Applies adopted drift replacements between passes and probes fallback
    /// URLs after repeated failed passes.
    pub async fn run_target_loop(
        self: Arc<Self>,
        mut target: Target,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(
            "[{}] monitoring {} every {:?}",
            target.id,
            target.url,
            target.tier.interval()
        );
        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Some(url) = self.drift.take_adopted(&target.id) {
                info!("[{}] switching to adopted URL {}", target.id, url);
                target.adopt_url(url);
            }

            match self.run_pass(&target).await {
                Ok(outcome) => {
                    target.last_checked_at = Some(outcome.at);
                    match outcome.status {
                        PassStatus::Error | PassStatus::Blocked | PassStatus::Timeout => {
                            target.consecutive_failures += 1;
                        }
                        PassStatus::SlotsFound => {
                            target.last_slot_found_at = Some(outcome.at);
                            target.consecutive_failures = 0;
                        }
                        _ => target.consecutive_failures = 0,
                    }
                }
                // Pool starvation says nothing about the target; skip the
                // pass without touching the failure streak
                Err(e) => warn!("[{}] pass skipped: {}", target.id, e),
            }
            target.consecutive_failures += self.drift.take_rejections(&target.id);

            if target.consecutive_failures >= FALLBACK_PROBE_AFTER {
                if let Some((url, confidence)) = self.probe_fallbacks(&target).await {
                    info!(
                        "[{}] moving to fallback {} (confidence {:.2})",
                        target.id, url, confidence
                    );
                    target.adopt_url(url);
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(target.tier.interval()) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("[{}] monitoring loop stopped", target.id);
    }

    /// Probe the target's fallback URLs, configured ones first and then the
    /// candidates generated from prefecture naming conventions, and return
    /// the first trustworthy one.
    pub async fn probe_fallbacks(&self, target: &Target) -> Option<(String, f64)> {
        let mut candidates = target.fallback_urls.clone();
        for url in generate_fallback_urls(target) {
            if !candidates.contains(&url) {
                candidates.push(url);
            }
        }
        if candidates.is_empty() {
            return None;
        }
        let domain = target.domain();
        let session = match self.pool.acquire(&domain).await {
            Ok(session) => session,
            Err(e) => {
                warn!("[{}] fallback probe has no session: {}", target.id, e);
                return None;
            }
        };

        let mut probes = Vec::new();
        for url in &candidates {
            match session.navigate(url, DEFAULT_NAV_TIMEOUT_SECS).await {
                Ok(nav) => {
                    let text = session.body_text().await.unwrap_or_default();
                    probes.push((
                        url.as_str(),
                        DriftSignals::from_page(&nav.final_url, nav.status, &text),
                    ));
                }
                Err(e) => debug!("[{}] fallback {} unreachable: {}", target.id, url, e),
            }
        }

        let picked = self.drift.select_fallback(target, probes);
        self.pool.release(session).await;
        picked
    }

    async fn select_procedure(&self, session: &Session, target: &Target) -> bool {
        let Some(select) = &target.locators.procedure_select else {
            return false;
        };
        let name = target.name.to_lowercase();
        let keywords: Vec<&str> = name.split_whitespace().filter(|w| w.len() > 3).collect();
        match session.select_option_containing(select, &keywords).await {
            Ok(Some(option)) => {
                debug!("[{}] procedure selected: {}", target.id, option);
                true
            }
            Ok(None) => {
                debug!("[{}] no matching procedure option", target.id);
                false
            }
            Err(e) => {
                debug!("[{}] procedure selection failed: {}", target.id, e);
                false
            }
        }
    }

    /// Advance past the first step of a multi-step form. A configured next
    /// button is tried regardless of the dropdown; the generic submit
    /// selectors only after a procedure was actually picked, so a plain
    /// search form is not submitted blind.
    async fn advance_step(&self, session: &Session, target: &Target, procedure_selected: bool) {
        if let Some(selector) = &target.locators.next_button {
            if session.click_if_visible(selector).await.unwrap_or(false) {
                debug!("[{}] advanced via configured next button", target.id);
                tokio::time::sleep(Duration::from_secs(1)).await;
                return;
            }
        }
        if !procedure_selected {
            return;
        }
        for selector in NEXT_SELECTORS {
            if session.click_if_visible(selector).await.unwrap_or(false) {
                tokio::time::sleep(Duration::from_secs(1)).await;
                break;
            }
        }
    }

    async fn take_snapshot(
        &self,
        session: &Session,
        target: &Target,
        http_status: u16,
    ) -> Result<PageSnapshot, BrowserError> {
        let html = session.content().await?;
        let text = session.body_text().await.unwrap_or_default();

        let mut snapshot = PageSnapshot {
            http_status,
            html,
            text,
            ..Default::default()
        };
        if let Some(selector) = &target.locators.slot {
            snapshot.slot_matches = session.count_matches(selector).await.unwrap_or(0);
        }
        if let Some(selector) = &target.locators.no_slot {
            snapshot.no_slot_matches = session.count_matches(selector).await.unwrap_or(0);
        }
        if let Some(selector) = &target.locators.challenge {
            snapshot.challenge_matches = session.count_matches(selector).await.unwrap_or(0);
        }
        Ok(snapshot)
    }

    async fn capture(&self, session: &Session, target: &Target, reason: &str) -> Option<String> {
        match session.screenshot().await {
            Ok(png) => self
                .evidence
                .save(&target.id, reason, &png)
                .await
                .map(|p| p.display().to_string()),
            Err(e) => {
                warn!("[{}] screenshot failed: {}", target.id, e);
                None
            }
        }
    }
}

/// Compare URLs ignoring query and fragment; hosts and paths both count
fn url_moved(configured: &str, landed: &str) -> bool {
    let parse = |raw: &str| {
        url::Url::parse(raw).ok().map(|u| {
            (
                u.host_str().unwrap_or_default().to_string(),
                u.path().trim_end_matches('/').to_string(),
            )
        })
    };
    match (parse(configured), parse(landed)) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

fn locators_checked(target: &Target) -> u32 {
    [
        target.locators.slot.as_ref(),
        target.locators.no_slot.as_ref(),
    ]
    .iter()
    .flatten()
    .count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::super::outcome::LogSink;
    use crate::browser::PoolConfig;

    fn engine_with_pool(pool: Arc<SessionPool>) -> MonitorEngine {
        MonitorEngine::new(
            pool,
            Arc::new(ProxyTracker::disabled()),
            Arc::new(ChallengePipeline::from_api_key(None)),
            Arc::new(DriftDetector::new()),
            EvidenceStore::new(std::env::temp_dir()),
            Arc::new(MonitorStats::new()),
            Arc::new(LogSink),
        )
    }

    #[tokio::test]
    async fn starved_pool_escalates_instead_of_blaming_the_target() {
        let config = PoolConfig {
            max_sessions: 1,
            acquire_timeout_secs: 1,
            ..Default::default()
        };
        let pool = Arc::new(SessionPool::new(config, Arc::new(ProxyTracker::disabled())));
        let _held = pool.hold_slot().await;

        let engine = engine_with_pool(pool);
        let target = Target::new("t1", "Préfecture", "https://rdv.example.gouv.fr/");

        let result = engine.run_pass(&target).await;
        assert!(matches!(result, Err(BrowserError::PoolExhausted(_))));
        // A skipped pass must not be recorded as a target failure
        assert_eq!(engine.stats().pass_count(), 0);
    }

    #[test]
    fn query_changes_are_not_drift() {
        assert!(!url_moved(
            "https://rdv.example.gouv.fr/creneaux?type=cni",
            "https://rdv.example.gouv.fr/creneaux?type=cni&session=abc"
        ));
    }

    #[test]
    fn path_and_host_changes_are_drift() {
        assert!(url_moved(
            "https://rdv.example.gouv.fr/creneaux",
            "https://rdv.example.gouv.fr/nouvelle-page"
        ));
        assert!(url_moved(
            "https://rdv.example.gouv.fr/creneaux",
            "https://rdv2.example.gouv.fr/creneaux"
        ));
    }

    #[test]
    fn trailing_slashes_do_not_count_as_drift() {
        assert!(!url_moved(
            "https://rdv.example.gouv.fr/creneaux/",
            "https://rdv.example.gouv.fr/creneaux"
        ));
    }
}

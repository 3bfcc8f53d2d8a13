//! Proxy rotation and per-domain health tracking
//!
//! Provides thread-safe proxy selection biased away from endpoints that
//! recently failed for the target domain. Includes a local auth relay so
//! Chrome can use authenticated upstream proxies.

mod config;
mod health;
mod relay;

pub use config::{ProxyConfig, ProxyEndpoint};
pub use health::{selection_weight, PairHealth, COOLDOWN, MAX_CONSECUTIVE_FAILURES};
pub use relay::ProxyAuthRelay;

use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;
use rand::Rng;
use tracing::{debug, info, warn};

/// Proxy health tracker shared by all monitoring passes.
///
/// Selection is weighted random over the endpoints not currently in cooldown
/// for the requested domain; the weight decreases with each recent failure.
pub struct ProxyTracker {
    inner: RwLock<TrackerInner>,
    /// Tallies keyed by (proxy key, target domain)
    health: DashMap<(String, String), PairHealth>,
}

struct TrackerInner {
    endpoints: Vec<ProxyEndpoint>,
    enabled: bool,
}

impl std::fmt::Debug for ProxyTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("ProxyTracker")
            .field("enabled", &inner.enabled)
            .field("endpoints", &inner.endpoints.len())
            .finish()
    }
}

impl ProxyTracker {
    /// Create a tracker from configuration
    pub fn new(config: ProxyConfig) -> Self {
        let endpoints = config.parse_endpoints();
        let enabled = config.enabled && !endpoints.is_empty();
        info!(
            "ProxyTracker initialized (enabled: {}, endpoints: {})",
            enabled,
            endpoints.len()
        );
        Self {
            inner: RwLock::new(TrackerInner { endpoints, enabled }),
            health: DashMap::new(),
        }
    }

    /// Create a disabled tracker
    pub fn disabled() -> Self {
        Self {
            inner: RwLock::new(TrackerInner {
                endpoints: Vec::new(),
                enabled: false,
            }),
            health: DashMap::new(),
        }
    }

    /// Replace the endpoint list at runtime
    pub fn configure(&self, config: ProxyConfig) {
        let endpoints = config.parse_endpoints();
        let enabled = config.enabled && !endpoints.is_empty();
        let mut inner = self.inner.write();
        inner.endpoints = endpoints;
        inner.enabled = enabled;
        info!("ProxyTracker reconfigured (enabled: {})", enabled);
    }

    /// Disable proxy rotation at runtime
    pub fn disable(&self) {
        self.inner.write().enabled = false;
        info!("ProxyTracker disabled");
    }

    /// Check if proxy rotation is enabled
    pub fn is_enabled(&self) -> bool {
        self.inner.read().enabled
    }

    /// Select a proxy for a target domain, or `None` when disabled.
    ///
    /// Endpoints in cooldown for this domain are skipped; if every endpoint
    /// is cooling, the one whose cooldown ends soonest is returned anyway so
    /// monitoring degrades instead of stopping.
    pub fn select(&self, target_domain: &str) -> Option<ProxyEndpoint> {
        let inner = self.inner.read();
        if !inner.enabled || inner.endpoints.is_empty() {
            return None;
        }

        let now = Instant::now();
        let mut candidates: Vec<(ProxyEndpoint, f64)> = Vec::new();
        let mut cooling: Vec<(ProxyEndpoint, Instant)> = Vec::new();

        for endpoint in &inner.endpoints {
            let key = (endpoint.key(), target_domain.to_string());
            match self.health.get_mut(&key) {
                Some(mut entry) => {
                    entry.reset_if_expired(now);
                    if entry.is_cooling(now) {
                        if let Some(until) = entry.cooldown_until {
                            cooling.push((endpoint.clone(), until));
                        }
                        continue;
                    }
                    candidates.push((
                        endpoint.clone(),
                        selection_weight(entry.consecutive_failures),
                    ));
                }
                None => candidates.push((endpoint.clone(), selection_weight(0))),
            }
        }

        if candidates.is_empty() {
            if let Some((endpoint, _)) = cooling.into_iter().min_by_key(|(_, until)| *until) {
                warn!(
                    "All proxies cooling down for {}, returning {} anyway",
                    target_domain,
                    endpoint.key()
                );
                return Some(endpoint);
            }
            return None;
        }

        Some(weighted_pick(&candidates, &mut rand::thread_rng()))
    }

    /// Record a successful pass through a proxy for a domain. Clears the
    /// pair's tally so the proxy returns to full weight.
    pub fn report_success(&self, endpoint: &ProxyEndpoint, target_domain: &str) {
        let key = (endpoint.key(), target_domain.to_string());
        self.health.remove(&key);
        debug!("Proxy {} healthy for {}", endpoint.key(), target_domain);
    }

    /// Record a failed pass through a proxy for a domain
    pub fn report_failure(&self, endpoint: &ProxyEndpoint, target_domain: &str) {
        let key = (endpoint.key(), target_domain.to_string());
        let mut entry = self.health.entry(key).or_default();
        entry.record_failure();
        if entry.is_cooling(Instant::now()) {
            warn!(
                "Proxy {} entering cooldown for {} ({} consecutive failures)",
                endpoint.key(),
                target_domain,
                entry.consecutive_failures
            );
        }
    }

    /// Current consecutive-failure count for a pair (0 when untracked)
    pub fn consecutive_failures(&self, endpoint: &ProxyEndpoint, target_domain: &str) -> u32 {
        self.health
            .get(&(endpoint.key(), target_domain.to_string()))
            .map(|h| h.consecutive_failures)
            .unwrap_or(0)
    }
}

/// Weighted random pick; weights are positive by construction
fn weighted_pick<R: Rng + ?Sized>(
    candidates: &[(ProxyEndpoint, f64)],
    rng: &mut R,
) -> ProxyEndpoint {
    let total: f64 = candidates.iter().map(|(_, w)| w).sum();
    let mut remaining = rng.gen_range(0.0..total);
    for (endpoint, weight) in candidates {
        if remaining < *weight {
            return endpoint.clone();
        }
        remaining -= weight;
    }
    candidates[candidates.len() - 1].0.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker_with(endpoints: &[&str]) -> ProxyTracker {
        let config = ProxyConfig {
            endpoints: endpoints.iter().map(|s| s.to_string()).collect(),
            enabled: true,
        };
        ProxyTracker::new(config)
    }

    #[test]
    fn disabled_tracker_selects_none() {
        let tracker = ProxyTracker::disabled();
        assert!(tracker.select("example.org").is_none());
    }

    #[test]
    fn failures_bias_selection_away() {
        let tracker = tracker_with(&["a.example.com:8080:u:p", "b.example.com:8080:u:p"]);
        let bad = ProxyEndpoint::parse("a.example.com:8080:u:p").unwrap();

        tracker.report_failure(&bad, "rdv.example.org");
        tracker.report_failure(&bad, "rdv.example.org");

        let mut bad_picked = 0;
        for _ in 0..400 {
            let picked = tracker.select("rdv.example.org").unwrap();
            if picked.key() == bad.key() {
                bad_picked += 1;
            }
        }
        // Weight 1/3 vs 1, so the failing proxy should land well under half
        assert!(bad_picked < 200, "bad proxy picked {} of 400", bad_picked);
    }

    #[test]
    fn health_is_per_domain() {
        let tracker = tracker_with(&["a.example.com:8080:u:p"]);
        let proxy = ProxyEndpoint::parse("a.example.com:8080:u:p").unwrap();

        tracker.report_failure(&proxy, "one.example.org");
        assert_eq!(tracker.consecutive_failures(&proxy, "one.example.org"), 1);
        assert_eq!(tracker.consecutive_failures(&proxy, "two.example.org"), 0);
    }

    #[test]
    fn cooldown_pairs_are_skipped_until_exhausted() {
        let tracker = tracker_with(&["a.example.com:8080:u:p", "b.example.com:8080:u:p"]);
        let bad = ProxyEndpoint::parse("a.example.com:8080:u:p").unwrap();

        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            tracker.report_failure(&bad, "rdv.example.org");
        }
        for _ in 0..50 {
            let picked = tracker.select("rdv.example.org").unwrap();
            assert_ne!(picked.key(), bad.key(), "cooling proxy must be skipped");
        }
    }

    #[test]
    fn all_cooling_still_returns_a_proxy() {
        let tracker = tracker_with(&["a.example.com:8080:u:p"]);
        let proxy = ProxyEndpoint::parse("a.example.com:8080:u:p").unwrap();
        for _ in 0..MAX_CONSECUTIVE_FAILURES {
            tracker.report_failure(&proxy, "rdv.example.org");
        }
        assert!(tracker.select("rdv.example.org").is_some());
    }

    #[test]
    fn success_clears_the_tally() {
        let tracker = tracker_with(&["a.example.com:8080:u:p"]);
        let proxy = ProxyEndpoint::parse("a.example.com:8080:u:p").unwrap();
        tracker.report_failure(&proxy, "rdv.example.org");
        tracker.report_success(&proxy, "rdv.example.org");
        assert_eq!(tracker.consecutive_failures(&proxy, "rdv.example.org"), 0);
    }
}

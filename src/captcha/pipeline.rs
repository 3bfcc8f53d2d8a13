//! Challenge resolution pipeline
//!
//! Glues detection, the solving provider, and token injection together.
//! Resolution failures are a normal monitoring outcome, not an error: the
//! pipeline reports why it stopped and the caller records a captcha pass.

use std::time::Duration;

use tracing::{info, warn};

use crate::browser::Session;

use super::detect::detect_challenge;
use super::solver::CaptchaSolver;
use super::types::{CaptchaRequest, ChallengeDetection, ChallengeKind};

/// Delay after token injection before the page is re-inspected
const SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Outcome of a resolution attempt
#[derive(Debug)]
pub enum ChallengeResolution {
    Resolved { solve_time_ms: u64 },
    Unresolved { reason: String },
}

impl ChallengeResolution {
    pub fn is_resolved(&self) -> bool {
        matches!(self, Self::Resolved { .. })
    }

    fn unresolved(reason: impl Into<String>) -> Self {
        Self::Unresolved {
            reason: reason.into(),
        }
    }
}

/// Detection plus solving plus injection, shared across monitoring passes
pub struct ChallengePipeline {
    solver: Option<CaptchaSolver>,
}

impl ChallengePipeline {
    pub fn new(solver: Option<CaptchaSolver>) -> Self {
        Self { solver }
    }

    /// Build from an optional provider key; an invalid key degrades to
    /// detection-only operation with a warning.
    pub fn from_api_key(api_key: Option<&str>) -> Self {
        let solver = match api_key {
            Some(key) => match CaptchaSolver::new(key) {
                Ok(solver) => Some(solver),
                Err(e) => {
                    warn!("Challenge solver not available: {}", e);
                    None
                }
            },
            None => None,
        };
        Self { solver }
    }

    pub fn is_configured(&self) -> bool {
        self.solver.is_some()
    }

    /// Provider account balance, when a solver is configured and reachable
    pub async fn provider_balance(&self) -> Option<f64> {
        let solver = self.solver.as_ref()?;
        match solver.get_balance().await {
            Ok(balance) => Some(balance),
            Err(e) => {
                warn!("Balance check failed: {}", e);
                None
            }
        }
    }

    /// Attempt to resolve a detected challenge in place on the session's page
    pub async fn resolve(
        &self,
        session: &Session,
        detection: &ChallengeDetection,
    ) -> ChallengeResolution {
        if !detection.solvable() {
            return ChallengeResolution::unresolved("challenge has no solvable widget");
        }
        let Some(solver) = &self.solver else {
            return ChallengeResolution::unresolved("no solving provider configured");
        };

        let page_url = match session.current_url().await {
            Ok(url) => url,
            Err(e) => return ChallengeResolution::unresolved(format!("page URL unavailable: {}", e)),
        };
        let Some(request) = CaptchaRequest::from_detection(detection, &page_url) else {
            return ChallengeResolution::unresolved("challenge has no solvable widget");
        };

        let result = match solver.solve(&request).await {
            Ok(result) => result,
            Err(e) => {
                warn!("Challenge solve failed on {}: {}", page_url, e);
                return ChallengeResolution::unresolved(format!("provider failed: {}", e));
            }
        };

        let injected = match session
            .evaluate(&injection_script(detection.kind, &result.token))
            .await
        {
            Ok(value) => value.as_i64().unwrap_or(0),
            Err(e) => {
                return ChallengeResolution::unresolved(format!("token injection failed: {}", e))
            }
        };
        if injected == 0 {
            return ChallengeResolution::unresolved("no injection point found on page");
        }

        tokio::time::sleep(SETTLE_DELAY).await;

        // A page still sitting on an interstitial after injection means the
        // token was stale or rejected
        match session.content().await {
            Ok(html) => {
                if let Some(after) = detect_challenge(&html) {
                    if after.kind == ChallengeKind::Unknown {
                        return ChallengeResolution::unresolved(
                            "challenge interstitial still present after injection",
                        );
                    }
                }
            }
            Err(e) => {
                return ChallengeResolution::unresolved(format!(
                    "page unreadable after injection: {}",
                    e
                ))
            }
        }

        info!(
            "Challenge on {} resolved in {}ms",
            page_url, result.solve_time_ms
        );
        ChallengeResolution::Resolved {
            solve_time_ms: result.solve_time_ms,
        }
    }

    /// Solve an inline image captcha: screenshot the image element, send it
    /// to the provider, type the answer into the given input.
    pub async fn solve_image_field(
        &self,
        session: &Session,
        image_selector: &str,
        input_selector: &str,
    ) -> ChallengeResolution {
        let Some(solver) = &self.solver else {
            return ChallengeResolution::unresolved("no solving provider configured");
        };
        let png = match session.screenshot_element(image_selector).await {
            Ok(png) => png,
            Err(e) => {
                return ChallengeResolution::unresolved(format!(
                    "captcha image not capturable: {}",
                    e
                ))
            }
        };
        let result = match solver.solve_image(&png).await {
            Ok(result) => result,
            Err(e) => return ChallengeResolution::unresolved(format!("provider failed: {}", e)),
        };
        if let Err(e) = session.set_field_value(input_selector, &result.token).await {
            return ChallengeResolution::unresolved(format!("answer field not fillable: {}", e));
        }
        ChallengeResolution::Resolved {
            solve_time_ms: result.solve_time_ms,
        }
    }
}

/// Script that writes the token into the widget's response fields and fires
/// the widget callback when one is registered. Evaluates to the number of
/// fields touched.
fn injection_script(kind: ChallengeKind, token: &str) -> String {
    let token_js = serde_json::to_string(token).unwrap_or_else(|_| "\"\"".to_string());
    let selectors = match kind {
        ChallengeKind::RecaptchaV2 | ChallengeKind::RecaptchaV3 => {
            "'textarea[name=\"g-recaptcha-response\"], #g-recaptcha-response'"
        }
        ChallengeKind::HCaptcha => {
            "'[name=\"h-captcha-response\"], [name=\"g-recaptcha-response\"]'"
        }
        ChallengeKind::Turnstile => "'input[name=\"cf-turnstile-response\"]'",
        ChallengeKind::Unknown => "''",
    };
    let callback = match kind {
        ChallengeKind::RecaptchaV2 | ChallengeKind::RecaptchaV3 => RECAPTCHA_CALLBACK,
        ChallengeKind::HCaptcha | ChallengeKind::Turnstile => GENERIC_CALLBACK,
        ChallengeKind::Unknown => "",
    };
    format!(
        r#"(() => {{
            const token = {token_js};
            let touched = 0;
            document.querySelectorAll({selectors}).forEach((el) => {{
                el.value = token;
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                touched++;
            }});
            {callback}
            return touched;
        }})()"#
    )
}

/// Walks the grecaptcha client registry for a configured callback
const RECAPTCHA_CALLBACK: &str = r#"
            try {
                const cfg = window.___grecaptcha_cfg;
                if (cfg && cfg.clients) {
                    for (const client of Object.values(cfg.clients)) {
                        for (const outer of Object.values(client)) {
                            if (!outer || typeof outer !== 'object') continue;
                            for (const inner of Object.values(outer)) {
                                if (inner && typeof inner.callback === 'function') {
                                    inner.callback(token);
                                    touched++;
                                }
                            }
                        }
                    }
                }
            } catch (e) {}
"#;

const GENERIC_CALLBACK: &str = r#"
            try {
                if (typeof window.onCaptchaSuccess === 'function') {
                    window.onCaptchaSuccess(token);
                    touched++;
                }
            } catch (e) {}
"#;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unconfigured_pipeline_reports_missing_provider() {
        let pipeline = ChallengePipeline::from_api_key(None);
        assert!(!pipeline.is_configured());
    }

    #[test]
    fn invalid_key_degrades_to_detection_only() {
        let pipeline = ChallengePipeline::from_api_key(Some(""));
        assert!(!pipeline.is_configured());
    }

    #[test]
    fn injection_script_escapes_the_token() {
        let script = injection_script(ChallengeKind::RecaptchaV2, "tok\"with'quotes");
        assert!(script.contains(r#""tok\"with'quotes""#));
        assert!(script.contains("g-recaptcha-response"));
        assert!(script.contains("___grecaptcha_cfg"));
    }

    #[test]
    fn turnstile_injection_targets_turnstile_field() {
        let script = injection_script(ChallengeKind::Turnstile, "tok");
        assert!(script.contains("cf-turnstile-response"));
        assert!(!script.contains("___grecaptcha_cfg"));
    }
}

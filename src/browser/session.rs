//! Browser session management
//!
//! A `Session` is one isolated page on a pooled browser process, bound to a
//! fingerprint and (optionally) a proxy for its whole lifetime. Fingerprint
//! overrides are applied per page at the CDP level before any navigation, so
//! every session can carry a different identity even on a shared process.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chromiumoxide::cdp::browser_protocol::emulation::{
    SetGeolocationOverrideParams, SetTimezoneOverrideParams, SetUserAgentOverrideParams,
};
use chromiumoxide::cdp::browser_protocol::network::{
    Headers, SetBlockedUrLsParams, SetExtraHttpHeadersParams,
};
use chromiumoxide::cdp::browser_protocol::page::{
    AddScriptToEvaluateOnNewDocumentParams, CaptureScreenshotFormat,
};
use chromiumoxide::page::{Page, ScreenshotParams};
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, warn};

use super::BrowserError;
use crate::fingerprint::Fingerprint;
use crate::proxy::ProxyEndpoint;

/// Default main-navigation timeout
pub const DEFAULT_NAV_TIMEOUT_SECS: u64 = 30;

/// URL patterns aborted on every session page.
///
/// Images, fonts, stylesheets and media are never needed to classify a
/// booking page, and they dominate proxy bandwidth.
const BLOCKED_URL_PATTERNS: &[&str] = &[
    "*.png", "*.jpg", "*.jpeg", "*.gif", "*.webp", "*.svg", "*.ico",
    "*.woff", "*.woff2", "*.ttf", "*.otf",
    "*.css",
    "*.mp4", "*.webm", "*.avi", "*.mp3", "*.ogg",
    "fonts.googleapis.com/*",
    "fonts.gstatic.com/*",
    "*.google-analytics.com/*",
    "*.hotjar.com/*",
];

/// Cookie consent buttons seen across French booking portals
const CONSENT_SELECTORS: &[&str] = &[
    "#tarteaucitronPersonalize2",
    "#tarteaucitronAllAllowed",
    "#onetrust-accept-btn-handler",
    "button[id*='accept']",
    "button[class*='consent']",
];

/// Result of a main-document navigation
#[derive(Debug, Clone)]
pub struct NavigationResult {
    /// HTTP status of the main document (0 when no response was captured)
    pub status: u16,
    /// URL after redirects
    pub final_url: String,
    pub redirect_count: u32,
}

/// One isolated browser page bound to a fingerprint and proxy
pub struct Session {
    /// Unique session ID
    pub id: String,
    /// Key of the pooled process this page belongs to
    pub process_key: String,
    page: Page,
    fingerprint: Fingerprint,
    proxy: Option<ProxyEndpoint>,
    target_domain: String,
    closed: AtomicBool,
    /// Live-session count on the owning process; keeps idle reclamation away
    process_refs: Arc<AtomicUsize>,
    // Held for the session's lifetime; dropping it frees a pool slot.
    _permit: OwnedSemaphorePermit,
}

impl Session {
    pub(crate) fn new(
        id: String,
        process_key: String,
        page: Page,
        fingerprint: Fingerprint,
        proxy: Option<ProxyEndpoint>,
        target_domain: String,
        process_refs: Arc<AtomicUsize>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        process_refs.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            process_key,
            page,
            fingerprint,
            proxy,
            target_domain,
            closed: AtomicBool::new(false),
            process_refs,
            _permit: permit,
        }
    }

    /// The fingerprint this session presents
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// The proxy endpoint this session egresses through, if any
    pub fn proxy(&self) -> Option<&ProxyEndpoint> {
        self.proxy.as_ref()
    }

    /// The target domain this session was acquired for
    pub fn target_domain(&self) -> &str {
        &self.target_domain
    }

    /// Apply all fingerprint and interception overrides to a fresh page.
    ///
    /// Must run before the first navigation: user agent + platform +
    /// Accept-Language, timezone, geolocation, blocked URL patterns and the
    /// stealth init script.
    pub(crate) async fn prepare_page(page: &Page, fp: &Fingerprint) -> Result<(), BrowserError> {
        let ua_params = SetUserAgentOverrideParams::builder()
            .user_agent(&fp.user_agent)
            .accept_language(&fp.accept_language)
            .platform(&fp.platform)
            .build()
            .map_err(BrowserError::LaunchFailed)?;
        page.execute(ua_params)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("UA override failed: {}", e)))?;

        page.execute(SetTimezoneOverrideParams::new(&fp.timezone))
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("Timezone override failed: {}", e)))?;

        let geo = SetGeolocationOverrideParams::builder()
            .latitude(fp.latitude)
            .longitude(fp.longitude)
            .accuracy(100.0)
            .build();
        page.execute(geo)
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("Geolocation override failed: {}", e)))?;

        let headers = serde_json::json!({ "Accept-Language": fp.accept_language });
        page.execute(SetExtraHttpHeadersParams::new(Headers::new(headers)))
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("Extra headers failed: {}", e)))?;

        let blocked: Vec<String> = BLOCKED_URL_PATTERNS.iter().map(|s| s.to_string()).collect();
        page.execute(SetBlockedUrLsParams::new(blocked))
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("Resource blocking failed: {}", e)))?;

        page.execute(AddScriptToEvaluateOnNewDocumentParams::new(fp.stealth_script()))
            .await
            .map_err(|e| BrowserError::LaunchFailed(format!("Stealth injection failed: {}", e)))?;

        debug!(
            "Page prepared (ua: {}..., tz: {}, geo: {})",
            &fp.user_agent[..fp.user_agent.len().min(40)],
            fp.timezone,
            fp.city
        );
        Ok(())
    }

    /// Navigate to a URL and wait for the main-document response.
    ///
    /// A timeout surfaces as `NavigationTimeout`, never as a generic fault.
    pub async fn navigate(
        &self,
        url: &str,
        timeout_secs: u64,
    ) -> Result<NavigationResult, BrowserError> {
        debug!("Session {} navigating to: {}", self.id, url);

        let response = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            self.page.goto(url).await?;
            self.page.wait_for_navigation_response().await
        })
        .await
        .map_err(|_| BrowserError::NavigationTimeout(timeout_secs))?
        .map_err(|e| BrowserError::NavigationFailed(e.to_string()))?;

        let status = response
            .as_ref()
            .and_then(|r| r.response.as_ref())
            .map(|r| r.status as u16)
            .unwrap_or(0);
        let redirect_count = response
            .as_ref()
            .map(|r| r.redirect_chain.len() as u32)
            .unwrap_or(0);
        let final_url = self
            .page
            .url()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?
            .unwrap_or_else(|| url.to_string());

        Ok(NavigationResult { status, final_url, redirect_count })
    }

    /// Get the full page HTML
    pub async fn content(&self) -> Result<String, BrowserError> {
        self.page
            .content()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))
    }

    /// Get the rendered body text
    pub async fn body_text(&self) -> Result<String, BrowserError> {
        let value = self
            .evaluate("document.body ? document.body.innerText : ''")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    /// Get the current URL
    pub async fn current_url(&self) -> Result<String, BrowserError> {
        self.page
            .url()
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))?
            .ok_or_else(|| BrowserError::ConnectionLost("No URL".into()))
    }

    /// Execute JavaScript with a bounded timeout, returning the JSON value
    pub async fn evaluate(&self, script: &str) -> Result<serde_json::Value, BrowserError> {
        let result = tokio::time::timeout(Duration::from_secs(10), self.page.evaluate(script))
            .await
            .map_err(|_| BrowserError::Timeout("JavaScript execution timed out".into()))?
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;

        Ok(result
            .into_value::<serde_json::Value>()
            .unwrap_or(serde_json::Value::Null))
    }

    /// Count elements matching a CSS selector
    pub async fn count_matches(&self, selector: &str) -> Result<u32, BrowserError> {
        let script = format!(
            "document.querySelectorAll({}).length",
            js_string(selector)
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_u64().unwrap_or(0) as u32)
    }

    /// Check whether the first match for a selector is currently visible
    pub async fn is_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                const rect = el.getBoundingClientRect();
                const style = getComputedStyle(el);
                return rect.width > 0 && rect.height > 0
                    && style.visibility !== 'hidden' && style.display !== 'none';
            }})()"#,
            sel = js_string(selector)
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Inner text of the first match, if the element exists
    pub async fn text_of(&self, selector: &str) -> Result<Option<String>, BrowserError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                return el ? el.innerText : null;
            }})()"#,
            sel = js_string(selector)
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_str().map(|s| s.trim().to_string()))
    }

    /// Click the first match if it is visible. Returns whether a click happened.
    pub async fn click_if_visible(&self, selector: &str) -> Result<bool, BrowserError> {
        if !self.is_visible(selector).await? {
            return Ok(false);
        }
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;
        element
            .click()
            .await
            .map_err(|e| BrowserError::JavaScriptError(e.to_string()))?;
        Ok(true)
    }

    /// Click the first button or link whose visible text contains any of the
    /// given labels (case-insensitive). Returns whether a click happened.
    pub async fn click_by_text(&self, labels: &[&str]) -> Result<bool, BrowserError> {
        let labels_json = serde_json::to_string(labels).unwrap_or_else(|_| "[]".into());
        let script = format!(
            r#"(() => {{
                const labels = {labels}.map(l => l.toLowerCase());
                const candidates = document.querySelectorAll(
                    "button, input[type='submit'], input[type='button'], a"
                );
                for (const el of candidates) {{
                    const text = (el.textContent || el.value || '').trim().toLowerCase();
                    if (!text) continue;
                    if (labels.some(l => text.includes(l))) {{
                        const rect = el.getBoundingClientRect();
                        if (rect.width === 0 || rect.height === 0) continue;
                        el.click();
                        return true;
                    }}
                }}
                return false;
            }})()"#,
            labels = labels_json
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Dismiss a cookie consent banner if one is showing. A configured
    /// per-target selector is tried before the built-in list. Returns
    /// whether a banner was clicked away.
    pub async fn dismiss_consent(&self, configured: Option<&str>) -> bool {
        for selector in configured.into_iter().chain(CONSENT_SELECTORS.iter().copied()) {
            if self.click_if_visible(selector).await.unwrap_or(false) {
                debug!("Consent dismissed via {}", selector);
                tokio::time::sleep(Duration::from_millis(500)).await;
                return true;
            }
        }
        false
    }

    /// Tick the first matching checkbox if it is not already checked, firing
    /// a change event. Returns whether a matching checkbox exists.
    pub async fn check_checkbox(&self, selector: &str) -> Result<bool, BrowserError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                if (!el.checked) {{
                    el.checked = true;
                    el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                }}
                return true;
            }})()"#,
            sel = js_string(selector)
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    /// Set a form field's value, firing input and change events so framework
    /// listeners see the edit.
    pub async fn set_field_value(&self, selector: &str, value: &str) -> Result<(), BrowserError> {
        let script = format!(
            r#"(() => {{
                const el = document.querySelector({sel});
                if (!el) return false;
                el.value = {val};
                el.dispatchEvent(new Event('input', {{ bubbles: true }}));
                el.dispatchEvent(new Event('change', {{ bubbles: true }}));
                return true;
            }})()"#,
            sel = js_string(selector),
            val = js_string(value)
        );
        let value = self.evaluate(&script).await?;
        if value.as_bool().unwrap_or(false) {
            Ok(())
        } else {
            Err(BrowserError::ElementNotFound(selector.to_string()))
        }
    }

    /// Select the first dropdown option whose text contains any keyword
    /// (case-insensitive). An empty keyword list selects the first option
    /// with a non-empty value. Returns the selected option text.
    pub async fn select_option_containing(
        &self,
        select_selector: &str,
        keywords: &[&str],
    ) -> Result<Option<String>, BrowserError> {
        let keywords_json = serde_json::to_string(keywords).unwrap_or_else(|_| "[]".into());
        let script = format!(
            r#"(() => {{
                const select = document.querySelector({sel});
                if (!select) return null;
                const keywords = {keywords};
                for (const option of select.options) {{
                    const text = option.textContent.toLowerCase();
                    const hit = keywords.length === 0
                        ? option.value !== ''
                        : keywords.some(k => text.includes(k.toLowerCase()));
                    if (hit) {{
                        select.value = option.value;
                        select.dispatchEvent(new Event('change', {{ bubbles: true }}));
                        return option.textContent.trim();
                    }}
                }}
                return null;
            }})()"#,
            sel = js_string(select_selector),
            keywords = keywords_json
        );
        let value = self.evaluate(&script).await?;
        Ok(value.as_str().map(|s| s.to_string()))
    }

    /// Capture a full-page screenshot as PNG bytes
    pub async fn screenshot(&self) -> Result<Vec<u8>, BrowserError> {
        self.page
            .screenshot(
                ScreenshotParams::builder()
                    .format(CaptureScreenshotFormat::Png)
                    .full_page(true)
                    .build(),
            )
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Screenshot failed: {}", e)))
    }

    /// Capture a single element as PNG bytes (used for image challenges)
    pub async fn screenshot_element(&self, selector: &str) -> Result<Vec<u8>, BrowserError> {
        let element = self
            .page
            .find_element(selector)
            .await
            .map_err(|e| BrowserError::ElementNotFound(format!("{}: {}", selector, e)))?;
        element
            .screenshot(CaptureScreenshotFormat::Png)
            .await
            .map_err(|e| BrowserError::JavaScriptError(format!("Element screenshot failed: {}", e)))
    }

    /// Close the session's page. Idempotent; close errors are swallowed so a
    /// failed teardown never blocks the caller's next unit of work.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        if let Err(e) = self.page.clone().close().await {
            warn!("Session {} page close failed (ignored): {}", self.id, e);
        }
        debug!("Session {} closed", self.id);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.closed.store(true, Ordering::Relaxed);
        self.process_refs.fetch_sub(1, Ordering::Relaxed);
    }
}

/// Quote a string as a JS string literal (selectors routinely contain quotes)
fn js_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocked_patterns_cover_static_resource_types() {
        assert!(BLOCKED_URL_PATTERNS.contains(&"*.png"));
        assert!(BLOCKED_URL_PATTERNS.contains(&"*.css"));
        assert!(BLOCKED_URL_PATTERNS.contains(&"*.woff2"));
        assert!(BLOCKED_URL_PATTERNS.contains(&"*.mp4"));
    }

    #[test]
    fn js_string_escapes_quotes() {
        let quoted = js_string(r#"input[name*="nom" i]"#);
        assert_eq!(quoted, r#""input[name*=\"nom\" i]""#);
    }
}

//! Challenge detection over page markup
//!
//! Pure string inspection so it can run on content snapshots without a live
//! page handle. Widget checks run before the generic marker scan: a page that
//! embeds a recognizable widget gets a solvable detection with its site key,
//! anything that only trips the generic markers comes back as `Unknown`.

use once_cell::sync::Lazy;
use regex::Regex;

use super::types::{ChallengeDetection, ChallengeKind};

static SITEKEY_ATTR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"data-sitekey\s*=\s*["']([^"']+)["']"#).expect("valid regex")
});

static SITEKEY_JS_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"['"]?sitekey['"]?\s*[:=]\s*['"]([0-9A-Za-z_-]{20,})['"]"#).expect("valid regex")
});

/// Cloudflare interstitial markers
const CLOUDFLARE_MARKERS: &[&str] = &[
    "cf-browser-verification",
    "cf_chl_opt",
    "_cf_chl",
    "Just a moment...",
    "challenges.cloudflare.com",
];

/// Generic words that indicate a human check without a recognizable widget
const GENERIC_MARKERS: &[&str] = &[
    "captcha",
    "verification humaine",
    "prouvez que vous",
    "are you a robot",
];

/// Inspect page markup for a challenge. Returns `None` when the page shows no
/// challenge markers at all.
pub fn detect_challenge(html: &str) -> Option<ChallengeDetection> {
    let lower = html.to_lowercase();
    let sitekey = extract_sitekey(html);

    if lower.contains("grecaptcha") || lower.contains("g-recaptcha") {
        // An explicit execute call without a rendered widget is the v3 pattern
        let kind = if lower.contains("grecaptcha.execute") && !lower.contains("g-recaptcha-response")
        {
            ChallengeKind::RecaptchaV3
        } else {
            ChallengeKind::RecaptchaV2
        };
        return Some(ChallengeDetection { kind, sitekey });
    }

    if lower.contains("h-captcha") || lower.contains("hcaptcha.com") {
        return Some(ChallengeDetection {
            kind: ChallengeKind::HCaptcha,
            sitekey,
        });
    }

    if CLOUDFLARE_MARKERS
        .iter()
        .any(|m| html.contains(m) || lower.contains(&m.to_lowercase()))
    {
        // Cloudflare pages only get a solvable detection when they expose a
        // Turnstile site key; the managed interstitial has nothing to submit
        return Some(ChallengeDetection {
            kind: if sitekey.is_some() {
                ChallengeKind::Turnstile
            } else {
                ChallengeKind::Unknown
            },
            sitekey,
        });
    }

    if lower.contains("cf-turnstile") {
        return Some(ChallengeDetection {
            kind: ChallengeKind::Turnstile,
            sitekey,
        });
    }

    if GENERIC_MARKERS.iter().any(|m| lower.contains(m)) {
        return Some(ChallengeDetection {
            kind: ChallengeKind::Unknown,
            sitekey: None,
        });
    }

    None
}

/// Pull a site key out of widget markup or inline configuration
fn extract_sitekey(html: &str) -> Option<String> {
    SITEKEY_ATTR_RE
        .captures(html)
        .or_else(|| SITEKEY_JS_RE.captures(html))
        .map(|c| c[1].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recaptcha_v2_widget_is_detected_with_sitekey() {
        let html = r#"<div class="g-recaptcha" data-sitekey="6LdXYZKeyExample12345"></div>
                      <script src="https://www.google.com/recaptcha/api.js"></script>"#;
        let detection = detect_challenge(html).unwrap();
        assert_eq!(detection.kind, ChallengeKind::RecaptchaV2);
        assert_eq!(detection.sitekey.as_deref(), Some("6LdXYZKeyExample12345"));
        assert!(detection.solvable());
    }

    #[test]
    fn grecaptcha_execute_without_widget_is_v3() {
        let html = r#"<script>grecaptcha.execute('6LdV3KeyExample123456', {action: 'submit'});</script>
                      <script>var sitekey = '6LdV3KeyExample123456';</script>"#;
        let detection = detect_challenge(html).unwrap();
        assert_eq!(detection.kind, ChallengeKind::RecaptchaV3);
        assert!(detection.sitekey.is_some());
    }

    #[test]
    fn hcaptcha_widget_is_detected() {
        let html = r#"<div class="h-captcha" data-sitekey="10000000-ffff-ffff-ffff-000000000001"></div>"#;
        let detection = detect_challenge(html).unwrap();
        assert_eq!(detection.kind, ChallengeKind::HCaptcha);
        assert!(detection.solvable());
    }

    #[test]
    fn cloudflare_interstitial_without_sitekey_is_unknown() {
        let html = "<html><head><title>Just a moment...</title></head>\
                    <body><div id=\"cf-browser-verification\"></div></body></html>";
        let detection = detect_challenge(html).unwrap();
        assert_eq!(detection.kind, ChallengeKind::Unknown);
        assert!(!detection.solvable());
    }

    #[test]
    fn cloudflare_page_with_turnstile_sitekey_is_solvable() {
        let html = r#"<script src="https://challenges.cloudflare.com/turnstile/v0/api.js"></script>
                      <div class="cf-turnstile" data-sitekey="0x4AAAAAAAExampleKey00"></div>"#;
        let detection = detect_challenge(html).unwrap();
        assert_eq!(detection.kind, ChallengeKind::Turnstile);
        assert!(detection.solvable());
    }

    #[test]
    fn generic_captcha_word_is_unknown_and_unsolvable() {
        let html = "<p>Veuillez compléter le captcha pour continuer</p>";
        let detection = detect_challenge(html).unwrap();
        assert_eq!(detection.kind, ChallengeKind::Unknown);
        assert!(detection.sitekey.is_none());
    }

    #[test]
    fn plain_page_has_no_detection() {
        let html = "<html><body><h1>Prendre rendez-vous</h1></body></html>";
        assert!(detect_challenge(html).is_none());
    }

    #[test]
    fn sitekey_is_extracted_from_inline_config() {
        let html = r#"<script>turnstile.render('#widget', { sitekey: '0x4AAAAAAAInlineKey000' });</script>
                      <div class="cf-turnstile"></div>"#;
        let detection = detect_challenge(html).unwrap();
        assert_eq!(detection.sitekey.as_deref(), Some("0x4AAAAAAAInlineKey000"));
    }
}

//! Browser fingerprint generation
//!
//! Produces a randomized but internally-consistent browser identity per
//! session: user agent, platform string, screen size, hardware hints, WebGL
//! strings and a geolocation drawn from real city coordinates. The platform
//! string is always derived from the chosen user agent, never randomized on
//! its own.

use rand::Rng;

/// Curated user-agent pool spanning Blink, Gecko and WebKit on Windows and macOS.
///
/// Versioned data — refresh the entries when the monitored sites start
/// rejecting older browser versions.
const USER_AGENTS: &[&str] = &[
    // Chrome on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    // Chrome on macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36",
    // Firefox on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:121.0) Gecko/20100101 Firefox/121.0",
    // Firefox on macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:121.0) Gecko/20100101 Firefox/121.0",
    // Safari on macOS
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.1 Safari/605.1.15",
    // Edge on Windows
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36 Edg/120.0.0.0",
];

/// Common desktop screen resolutions
const SCREEN_SIZES: &[(u32, u32)] = &[
    (1920, 1080),
    (1536, 864),
    (1440, 900),
    (1366, 768),
    (2560, 1440),
];

/// Plausible (device memory GB, logical core count) pairs
const HARDWARE_PROFILES: &[(u32, u32)] = &[(4, 4), (8, 4), (8, 8), (16, 8), (16, 12)];

/// ANGLE WebGL vendor/renderer pairs for Windows hardware
const WEBGL_ANGLE_PAIRS: &[(&str, &str)] = &[
    (
        "Google Inc. (NVIDIA)",
        "ANGLE (NVIDIA, NVIDIA GeForce GTX 1660 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (Intel)",
        "ANGLE (Intel, Intel(R) UHD Graphics 630 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
    (
        "Google Inc. (AMD)",
        "ANGLE (AMD, AMD Radeon RX 580 Direct3D11 vs_5_0 ps_5_0, D3D11)",
    ),
];

/// Real French city coordinates for geolocation overrides
const CITY_COORDINATES: &[(&str, f64, f64)] = &[
    ("Paris", 48.8566, 2.3522),
    ("Lyon", 45.7640, 4.8357),
    ("Marseille", 43.2965, 5.3698),
    ("Toulouse", 43.6047, 1.4442),
    ("Nantes", 47.2184, -1.5536),
];

/// A randomized browser identity for one session
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Fingerprint {
    pub user_agent: String,
    /// navigator.platform value, derived from the user agent
    pub platform: String,
    pub accept_language: String,
    pub timezone: String,
    pub screen_width: u32,
    pub screen_height: u32,
    pub device_memory_gb: u32,
    pub hardware_concurrency: u32,
    pub webgl_vendor: String,
    pub webgl_renderer: String,
    pub city: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Derive the navigator.platform string implied by a user agent.
///
/// A macOS user agent must never be paired with a Win32 platform — detection
/// scripts compare the two.
pub fn platform_for_user_agent(user_agent: &str) -> &'static str {
    if user_agent.contains("Windows NT") {
        "Win32"
    } else if user_agent.contains("Macintosh") {
        "MacIntel"
    } else {
        "Linux x86_64"
    }
}

impl Fingerprint {
    /// Generate a random fingerprint from the thread-local entropy source
    pub fn random() -> Self {
        Self::from_rng(&mut rand::thread_rng())
    }

    /// Generate a fingerprint from a caller-supplied RNG (seedable for tests)
    pub fn from_rng<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let user_agent = USER_AGENTS[rng.gen_range(0..USER_AGENTS.len())].to_string();
        let platform = platform_for_user_agent(&user_agent).to_string();
        let (screen_width, screen_height) = SCREEN_SIZES[rng.gen_range(0..SCREEN_SIZES.len())];
        let (device_memory_gb, hardware_concurrency) =
            HARDWARE_PROFILES[rng.gen_range(0..HARDWARE_PROFILES.len())];

        // Apple hardware reports Apple WebGL strings; everything else gets ANGLE
        let (webgl_vendor, webgl_renderer) = if platform == "MacIntel" {
            ("Apple Inc.".to_string(), "Apple GPU".to_string())
        } else {
            let (v, r) = WEBGL_ANGLE_PAIRS[rng.gen_range(0..WEBGL_ANGLE_PAIRS.len())];
            (v.to_string(), r.to_string())
        };

        let (city, latitude, longitude) =
            CITY_COORDINATES[rng.gen_range(0..CITY_COORDINATES.len())];

        Self {
            user_agent,
            platform,
            accept_language: "fr-FR,fr;q=0.9,en-US;q=0.8,en;q=0.7".to_string(),
            timezone: "Europe/Paris".to_string(),
            screen_width,
            screen_height,
            device_memory_gb,
            hardware_concurrency,
            webgl_vendor,
            webgl_renderer,
            city: city.to_string(),
            latitude,
            longitude,
        }
    }

    /// Build the stealth init script injected before any navigation.
    ///
    /// Masks the automation-detectable surfaces (webdriver flag, empty plugin
    /// list, languages, hardware hints, WebGL strings) with this
    /// fingerprint's values. Runs on every new document.
    pub fn stealth_script(&self) -> String {
        format!(
            r#"(() => {{
    Object.defineProperty(navigator, 'webdriver', {{
        get: () => undefined,
        configurable: true
    }});

    Object.defineProperty(navigator, 'platform', {{
        get: () => '{platform}',
        configurable: true
    }});

    Object.defineProperty(navigator, 'languages', {{
        get: () => ['fr-FR', 'fr', 'en-US', 'en'],
        configurable: true
    }});

    Object.defineProperty(navigator, 'hardwareConcurrency', {{
        get: () => {cores},
        configurable: true
    }});

    Object.defineProperty(navigator, 'deviceMemory', {{
        get: () => {memory},
        configurable: true
    }});

    Object.defineProperty(navigator, 'plugins', {{
        get: () => {{
            const plugins = [
                {{ name: 'Chrome PDF Plugin', filename: 'internal-pdf-viewer' }},
                {{ name: 'Chrome PDF Viewer', filename: 'mhjfbmdgcfjbbpaeojofohoefgiehjai' }},
                {{ name: 'Native Client', filename: 'internal-nacl-plugin' }}
            ];
            plugins.item = (i) => plugins[i];
            plugins.namedItem = (name) => plugins.find(p => p.name === name);
            plugins.refresh = () => {{}};
            return plugins;
        }},
        configurable: true
    }});

    const getParameter = WebGLRenderingContext.prototype.getParameter;
    WebGLRenderingContext.prototype.getParameter = function(parameter) {{
        if (parameter === 37445) return '{webgl_vendor}';
        if (parameter === 37446) return '{webgl_renderer}';
        return getParameter.call(this, parameter);
    }};

    if (!window.chrome) {{
        window.chrome = {{ runtime: {{}} }};
    }}

    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Array;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Promise;
    delete window.cdc_adoQpoasnfa76pfcZLmcfl_Symbol;
}})();"#,
            platform = self.platform,
            cores = self.hardware_concurrency,
            memory = self.device_memory_gb,
            webgl_vendor = self.webgl_vendor,
            webgl_renderer = self.webgl_renderer,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn platform_matches_user_agent() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let fp = Fingerprint::from_rng(&mut rng);
            if fp.user_agent.contains("Windows NT") {
                assert_eq!(fp.platform, "Win32", "ua={}", fp.user_agent);
            } else if fp.user_agent.contains("Macintosh") {
                assert_eq!(fp.platform, "MacIntel", "ua={}", fp.user_agent);
            }
        }
    }

    #[test]
    fn pool_spans_engines_and_platforms() {
        let engines = USER_AGENTS
            .iter()
            .filter(|ua| ua.contains("Gecko/20100101"))
            .count();
        assert!(engines >= 1, "pool must include a Gecko entry");
        assert!(USER_AGENTS.iter().any(|ua| ua.contains("Version/17")));
        assert!(USER_AGENTS.iter().any(|ua| ua.contains("Chrome/")));
        assert!(USER_AGENTS.iter().any(|ua| ua.contains("Windows NT")));
        assert!(USER_AGENTS.iter().any(|ua| ua.contains("Macintosh")));
    }

    #[test]
    fn mac_fingerprints_use_apple_webgl() {
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..100 {
            let fp = Fingerprint::from_rng(&mut rng);
            if fp.platform == "MacIntel" {
                assert_eq!(fp.webgl_vendor, "Apple Inc.");
            } else {
                assert!(fp.webgl_renderer.starts_with("ANGLE"));
            }
        }
    }

    #[test]
    fn stealth_script_contains_required_masks() {
        let fp = Fingerprint::random();
        let script = fp.stealth_script();
        assert!(script.contains("webdriver"));
        assert!(script.contains("plugins"));
        assert!(script.contains("languages"));
        assert!(script.contains("hardwareConcurrency"));
        assert!(script.contains(&fp.platform));
        assert!(script.contains(&fp.webgl_renderer));
    }
}

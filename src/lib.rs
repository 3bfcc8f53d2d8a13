//! RDV Sentinel
//!
//! Appointment-slot monitoring and booking automation for French public
//! booking portals: pooled stealth browser sessions, proxy rotation with
//! per-domain health, challenge resolution, pass classification and URL
//! drift detection.

pub mod booking;
pub mod browser;
pub mod captcha;
pub mod drift;
pub mod fingerprint;
pub mod monitor;
pub mod proxy;
pub mod stats;

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};

use booking::{BookingObserver, BookingWorkflow, LogObserver};
use browser::{PoolConfig, SessionPool};
use captcha::ChallengePipeline;
use drift::DriftDetector;
use monitor::{EvidenceStore, LogSink, MonitorEngine, OutcomeSink, Target};
use proxy::{ProxyConfig, ProxyTracker};
use stats::MonitorStats;

/// Application configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    /// Proxy endpoints as host:port or host:port:user:pass
    #[serde(default)]
    pub proxy_endpoints: Vec<String>,
    #[serde(default)]
    pub proxy_enabled: bool,

    /// 2Captcha API key for challenge solving
    #[serde(default)]
    pub captcha_api_key: String,

    /// Browser pool sizing
    #[serde(default = "default_max_processes")]
    pub max_browser_processes: usize,
    #[serde(default = "default_max_sessions")]
    pub max_concurrent_sessions: usize,
    #[serde(default = "default_headless")]
    pub headless: bool,
    /// Explicit Chrome binary path, autodetected when unset
    #[serde(default)]
    pub chrome_path: Option<String>,

    /// Monitored targets
    #[serde(default)]
    pub targets: Vec<Target>,
}

fn default_max_processes() -> usize {
    3
}

fn default_max_sessions() -> usize {
    6
}

fn default_headless() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            proxy_endpoints: Vec::new(),
            proxy_enabled: false,
            captcha_api_key: String::new(),
            max_browser_processes: default_max_processes(),
            max_concurrent_sessions: default_max_sessions(),
            headless: default_headless(),
            chrome_path: None,
            targets: Vec::new(),
        }
    }
}

/// Get log directory path (shared across modules)
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("rdv-sentinel").join("logs"))
}

/// Directory screenshots are written to
pub fn evidence_dir() -> PathBuf {
    dirs::config_dir()
        .map(|p| p.join("rdv-sentinel").join("evidence"))
        .unwrap_or_else(|| PathBuf::from("evidence"))
}

impl AppConfig {
    fn config_path() -> Option<PathBuf> {
        dirs::config_dir().map(|p| p.join("rdv-sentinel").join("config.json"))
    }

    /// Load config from file, falling back to defaults
    pub fn load() -> Self {
        if let Some(path) = Self::config_path() {
            if path.exists() {
                match std::fs::read_to_string(&path) {
                    Ok(content) => match serde_json::from_str(&content) {
                        Ok(config) => {
                            info!("Loaded config from {:?}", path);
                            return config;
                        }
                        Err(e) => {
                            warn!("Failed to parse config file: {}", e);
                        }
                    },
                    Err(e) => {
                        warn!("Failed to read config file: {}", e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Save config to file
    pub fn save(&self) {
        if let Some(path) = Self::config_path() {
            if let Some(parent) = path.parent() {
                if let Err(e) = std::fs::create_dir_all(parent) {
                    error!("Failed to create config directory: {}", e);
                    return;
                }
            }

            match serde_json::to_string_pretty(self) {
                Ok(content) => {
                    if let Err(e) = std::fs::write(&path, content) {
                        error!("Failed to save config: {}", e);
                    } else {
                        info!("Config saved to {:?}", path);
                    }
                }
                Err(e) => {
                    error!("Failed to serialize config: {}", e);
                }
            }
        }
    }
}

/// Shared application state: the composition root for every subsystem
pub struct AppState {
    pub proxy_tracker: Arc<ProxyTracker>,
    pub pool: Arc<SessionPool>,
    pub pipeline: Arc<ChallengePipeline>,
    pub drift: Arc<DriftDetector>,
    pub stats: Arc<MonitorStats>,
    pub engine: Arc<MonitorEngine>,
    pub booking: Arc<BookingWorkflow>,
    pub config: Arc<RwLock<AppConfig>>,
}

impl AppState {
    /// Build the state from loaded config with logging-only sinks
    pub fn new(config: AppConfig) -> Self {
        Self::with_sinks(config, Arc::new(LogSink), Arc::new(LogObserver))
    }

    /// Build the state with caller-provided outcome and booking sinks
    pub fn with_sinks(
        config: AppConfig,
        sink: Arc<dyn OutcomeSink>,
        observer: Arc<dyn BookingObserver>,
    ) -> Self {
        let proxy_tracker = if config.proxy_enabled && !config.proxy_endpoints.is_empty() {
            Arc::new(ProxyTracker::new(ProxyConfig {
                endpoints: config.proxy_endpoints.clone(),
                enabled: true,
            }))
        } else {
            Arc::new(ProxyTracker::disabled())
        };

        let pool_config = PoolConfig::default()
            .headless(config.headless)
            .max_processes(config.max_browser_processes)
            .max_sessions(config.max_concurrent_sessions)
            .chrome_path(config.chrome_path.clone());
        let pool = Arc::new(SessionPool::new(pool_config, proxy_tracker.clone()));

        let api_key = if config.captcha_api_key.trim().is_empty() {
            None
        } else {
            Some(config.captcha_api_key.as_str())
        };
        let pipeline = Arc::new(ChallengePipeline::from_api_key(api_key));

        let drift = Arc::new(DriftDetector::new());
        let stats = Arc::new(MonitorStats::new());
        let evidence = EvidenceStore::new(evidence_dir());

        let engine = Arc::new(MonitorEngine::new(
            pool.clone(),
            proxy_tracker.clone(),
            pipeline.clone(),
            drift.clone(),
            evidence.clone(),
            stats.clone(),
            sink,
        ));
        let booking = Arc::new(BookingWorkflow::new(
            pool.clone(),
            pipeline.clone(),
            evidence,
            observer,
        ));

        Self {
            proxy_tracker,
            pool,
            pipeline,
            drift,
            stats,
            engine,
            booking,
            config: Arc::new(RwLock::new(config)),
        }
    }
}

/// Initialize logging: console plus a daily-rolling file when the log
/// directory is available.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "rdv-sentinel.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}

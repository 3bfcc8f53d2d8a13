//! Browser session pool
//!
//! Owns a bounded set of long-lived browser processes, keyed by proxy
//! identity (proxy credentials are launch arguments, fingerprints are
//! page-level). Sessions are ephemeral pages handed out one per unit of
//! work and never reused. Crashed processes are pruned and relaunched on
//! the next acquire; idle processes are reclaimed in the background.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::page::Page;
use futures::StreamExt;
use tokio::sync::{RwLock, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::{BrowserError, Session};
use crate::fingerprint::Fingerprint;
use crate::proxy::{ProxyAuthRelay, ProxyEndpoint, ProxyTracker};

/// Pool key for sessions without a proxy
const DIRECT_KEY: &str = "direct";

/// Pool configuration
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum concurrently running browser processes
    pub max_processes: usize,
    /// Maximum concurrently open sessions across all processes
    pub max_sessions: usize,
    /// How long an acquire may wait for a free slot
    pub acquire_timeout_secs: u64,
    /// Idle processes older than this are reclaimed
    pub idle_timeout_secs: u64,
    /// Per-process launch budget
    pub launch_timeout_secs: u64,
    pub headless: bool,
    /// Path to Chrome/Chromium executable (auto-detected when unset)
    pub chrome_path: Option<String>,
    pub window_width: u32,
    pub window_height: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_processes: 3,
            max_sessions: 6,
            acquire_timeout_secs: 30,
            idle_timeout_secs: 300,
            launch_timeout_secs: 45,
            headless: true,
            chrome_path: None,
            window_width: 1920,
            window_height: 1080,
        }
    }
}

impl PoolConfig {
    /// Set headless mode
    pub fn headless(mut self, headless: bool) -> Self {
        self.headless = headless;
        self
    }

    /// Set the process ceiling
    pub fn max_processes(mut self, max: usize) -> Self {
        self.max_processes = max.max(1);
        self
    }

    /// Set the session ceiling
    pub fn max_sessions(mut self, max: usize) -> Self {
        self.max_sessions = max.max(1);
        self
    }

    /// Set the Chrome executable path
    pub fn chrome_path(mut self, path: Option<String>) -> Self {
        self.chrome_path = path;
        self
    }
}

/// One long-lived pooled browser process
struct PooledProcess {
    key: String,
    browser: RwLock<Option<Browser>>,
    alive: Arc<AtomicBool>,
    /// Sessions currently open on this process
    active_sessions: Arc<AtomicUsize>,
    /// Last acquire, unix seconds
    last_used: AtomicU64,
    handler_task: tokio::task::JoinHandle<()>,
    // Dropped (and therefore stopped) together with the process.
    _relay: Option<ProxyAuthRelay>,
}

impl PooledProcess {
    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Relaxed)
    }

    fn active(&self) -> usize {
        self.active_sessions.load(Ordering::Relaxed)
    }

    fn touch(&self) {
        self.last_used.store(now_secs(), Ordering::Relaxed);
    }

    fn idle_secs(&self) -> u64 {
        now_secs().saturating_sub(self.last_used.load(Ordering::Relaxed))
    }

    async fn new_page(&self) -> Result<Page, BrowserError> {
        let browser = self.browser.read().await;
        let browser = browser
            .as_ref()
            .ok_or_else(|| BrowserError::ConnectionLost("process already shut down".into()))?;
        browser
            .new_page("about:blank")
            .await
            .map_err(|e| BrowserError::ConnectionLost(e.to_string()))
    }

    /// Graceful close then hard kill. Errors are swallowed.
    async fn shutdown(&self) {
        self.alive.store(false, Ordering::Relaxed);
        let mut browser = self.browser.write().await;
        if let Some(mut b) = browser.take() {
            let _ = b.close().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            let _ = b.kill().await;
        }
        self.handler_task.abort();
        debug!("Browser process {} shut down", self.key);
    }
}

/// Session pool shared by all monitoring passes and booking workflows
pub struct SessionPool {
    config: PoolConfig,
    proxy_tracker: Arc<ProxyTracker>,
    processes: RwLock<HashMap<String, Arc<PooledProcess>>>,
    permits: Arc<Semaphore>,
}

impl SessionPool {
    /// Create a new pool
    pub fn new(config: PoolConfig, proxy_tracker: Arc<ProxyTracker>) -> Self {
        let permits = Arc::new(Semaphore::new(config.max_sessions));
        Self {
            config,
            proxy_tracker,
            processes: RwLock::new(HashMap::new()),
            permits,
        }
    }

    /// Sessions currently checked out
    pub fn active_sessions(&self) -> usize {
        self.config.max_sessions - self.permits.available_permits()
    }

    /// Live pooled processes
    pub async fn process_count(&self) -> usize {
        self.processes.read().await.len()
    }

    /// Acquire a session for a target domain.
    ///
    /// Blocks until a slot frees up, bounded by the acquire timeout; selects
    /// a proxy from the health tracker, reuses or launches the process for
    /// that proxy, and returns a fresh fingerprinted page.
    pub async fn acquire(&self, target_domain: &str) -> Result<Session, BrowserError> {
        let permit = tokio::time::timeout(
            Duration::from_secs(self.config.acquire_timeout_secs),
            self.permits.clone().acquire_owned(),
        )
        .await
        .map_err(|_| {
            BrowserError::PoolExhausted(format!(
                "no session slot free within {}s",
                self.config.acquire_timeout_secs
            ))
        })?
        .map_err(|e| BrowserError::PoolError(e.to_string()))?;

        let proxy = self.proxy_tracker.select(target_domain);
        let key = proxy
            .as_ref()
            .map(|p| p.key())
            .unwrap_or_else(|| DIRECT_KEY.to_string());

        let process = self.process_for(&key, proxy.clone()).await?;

        // If the process died between selection and page creation, replace it
        // once before giving up.
        let page = match process.new_page().await {
            Ok(page) => page,
            Err(first_err) => {
                warn!(
                    "Process {} failed to serve a page ({}), relaunching",
                    key, first_err
                );
                self.remove_process(&key).await;
                let replacement = self.process_for(&key, proxy.clone()).await?;
                replacement.new_page().await?
            }
        };

        let fingerprint = Fingerprint::random();
        Session::prepare_page(&page, &fingerprint).await?;
        process.touch();

        let id = format!("{}-{}", &Uuid::new_v4().to_string()[..8], target_domain);
        debug!(
            "Session {} acquired (proxy: {})",
            id,
            proxy.as_ref().map(|p| p.key()).unwrap_or_else(|| DIRECT_KEY.into())
        );

        Ok(Session::new(
            id,
            key,
            page,
            fingerprint,
            proxy,
            target_domain.to_string(),
            process.active_sessions.clone(),
            permit,
        ))
    }

    /// Close a session. Teardown errors are swallowed; the pool slot frees
    /// when the session drops.
    pub async fn release(&self, session: Session) {
        session.close().await;
    }

    /// Get or launch the process for a proxy key
    async fn process_for(
        &self,
        key: &str,
        proxy: Option<ProxyEndpoint>,
    ) -> Result<Arc<PooledProcess>, BrowserError> {
        {
            let processes = self.processes.read().await;
            if let Some(process) = processes.get(key) {
                if process.is_alive() {
                    return Ok(process.clone());
                }
            }
        }

        let mut processes = self.processes.write().await;

        // Re-check under the write lock
        if let Some(process) = processes.get(key) {
            if process.is_alive() {
                return Ok(process.clone());
            }
        }

        // Prune everything that died since the last sweep
        let dead: Vec<String> = processes
            .iter()
            .filter(|(_, p)| !p.is_alive())
            .map(|(k, _)| k.clone())
            .collect();
        for k in dead {
            if let Some(p) = processes.remove(&k) {
                warn!("Pruning dead browser process {}", k);
                p.shutdown().await;
            }
        }

        // Respect the process ceiling by evicting idle processes, oldest first
        while processes.len() >= self.config.max_processes {
            let victim = processes
                .iter()
                .filter(|(_, p)| p.active() == 0)
                .max_by_key(|(_, p)| p.idle_secs())
                .map(|(k, _)| k.clone());
            match victim {
                Some(k) => {
                    if let Some(p) = processes.remove(&k) {
                        info!("Evicting idle browser process {} to stay under ceiling", k);
                        p.shutdown().await;
                    }
                }
                None => {
                    return Err(BrowserError::PoolExhausted(
                        "all pooled browser processes are busy".into(),
                    ))
                }
            }
        }

        let process = Arc::new(self.launch_process(key, proxy).await?);
        processes.insert(key.to_string(), process.clone());
        Ok(process)
    }

    /// Launch one browser process, with its auth relay when the proxy needs one
    async fn launch_process(
        &self,
        key: &str,
        proxy: Option<ProxyEndpoint>,
    ) -> Result<PooledProcess, BrowserError> {
        info!(
            "Launching browser process {} (headless: {})",
            key, self.config.headless
        );

        let mut relay = None;
        let mut builder = BrowserConfig::builder();

        if !self.config.headless {
            builder = builder.with_head();
        }
        if let Some(ref path) = self.config.chrome_path {
            builder = builder.chrome_executable(path);
        }

        builder = builder
            .no_sandbox()
            .window_size(self.config.window_width, self.config.window_height)
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-gpu")
            .arg("--disable-notifications")
            .arg("--disable-background-networking")
            .arg("--lang=fr-FR");

        if let Some(ref endpoint) = proxy {
            if endpoint.authenticated() {
                // Chrome cannot pass proxy credentials itself
                let mut r = ProxyAuthRelay::new(endpoint.clone());
                r.start()
                    .await
                    .map_err(|e| BrowserError::LaunchFailed(format!("proxy relay: {}", e)))?;
                builder = builder.arg(format!("--proxy-server={}", r.local_url()));
                relay = Some(r);
            } else {
                builder = builder.arg(format!("--proxy-server={}", endpoint.server_url()));
            }
        }

        let browser_config = builder.build().map_err(BrowserError::LaunchFailed)?;

        let (browser, mut handler) = tokio::time::timeout(
            Duration::from_secs(self.config.launch_timeout_secs),
            Browser::launch(browser_config),
        )
        .await
        .map_err(|_| {
            BrowserError::LaunchFailed(format!(
                "launch timed out after {}s",
                self.config.launch_timeout_secs
            ))
        })?
        .map_err(|e| BrowserError::LaunchFailed(e.to_string()))?;

        // When the handler stream ends, the process has disconnected.
        let alive = Arc::new(AtomicBool::new(true));
        let alive_for_handler = alive.clone();
        let key_owned = key.to_string();
        let handler_task = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
            warn!("Browser process {} disconnected (event handler ended)", key_owned);
            alive_for_handler.store(false, Ordering::Relaxed);
        });

        Ok(PooledProcess {
            key: key.to_string(),
            browser: RwLock::new(Some(browser)),
            alive,
            active_sessions: Arc::new(AtomicUsize::new(0)),
            last_used: AtomicU64::new(now_secs()),
            handler_task,
            _relay: relay,
        })
    }

    async fn remove_process(&self, key: &str) {
        let removed = self.processes.write().await.remove(key);
        if let Some(process) = removed {
            process.shutdown().await;
        }
    }

    /// Background task closing processes idle past the configured timeout
    pub fn spawn_idle_reaper(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let idle_limit = self.config.idle_timeout_secs;
                let victims: Vec<String> = {
                    let processes = self.processes.read().await;
                    processes
                        .iter()
                        .filter(|(_, p)| p.active() == 0 && p.idle_secs() > idle_limit)
                        .map(|(k, _)| k.clone())
                        .collect()
                };
                for key in victims {
                    info!("Reclaiming idle browser process {}", key);
                    self.remove_process(&key).await;
                }
            }
        })
    }

    /// Hold a session slot without opening a page, to exercise starvation
    #[cfg(test)]
    pub(crate) async fn hold_slot(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.permits.clone().acquire_owned().await.unwrap()
    }

    /// Close every pooled process. Errors are swallowed per process.
    pub async fn close_all(&self) {
        let drained: Vec<Arc<PooledProcess>> = {
            let mut processes = self.processes.write().await;
            processes.drain().map(|(_, p)| p).collect()
        };
        for process in drained {
            process.shutdown().await;
        }
        info!("All pooled browser processes closed");
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_bounded() {
        let config = PoolConfig::default();
        assert!(config.max_processes >= 1);
        assert!(config.max_sessions >= config.max_processes);
        assert!(config.idle_timeout_secs >= 60);
    }

    #[test]
    fn builder_clamps_ceilings() {
        let config = PoolConfig::default().max_processes(0).max_sessions(0);
        assert_eq!(config.max_processes, 1);
        assert_eq!(config.max_sessions, 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out_with_pool_exhausted() {
        let config = PoolConfig {
            max_sessions: 1,
            acquire_timeout_secs: 1,
            ..Default::default()
        };
        let pool = SessionPool::new(config, Arc::new(ProxyTracker::disabled()));

        // Hold the only permit so acquire can never proceed to a launch.
        let _held = pool.permits.clone().acquire_owned().await.unwrap();

        let err = pool.acquire("rdv.example.org").await.err().unwrap();
        assert!(matches!(err, BrowserError::PoolExhausted(_)), "{:?}", err);
    }
}

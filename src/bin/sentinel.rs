//! RDV Sentinel - headless monitoring runner
//!
//! Loads the config, spins up one monitoring loop per enabled target and
//! runs until Ctrl-C.
//!
//! Environment variables:
//! - `RUST_LOG` - tracing filter (default: info)

use tracing::{info, warn};

use rdv_sentinel::{AppConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = rdv_sentinel::init_logging();

    info!("Starting RDV Sentinel");
    if let Some(dir) = rdv_sentinel::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }

    let config = AppConfig::load();
    if config.targets.is_empty() {
        warn!("No targets configured; writing a config template and exiting");
        config.save();
        return Ok(());
    }

    let targets: Vec<_> = config.targets.iter().filter(|t| t.enabled).cloned().collect();
    if targets.is_empty() {
        warn!("All targets are disabled, nothing to monitor");
        return Ok(());
    }

    let state = AppState::new(config);
    let _reaper = state.pool.clone().spawn_idle_reaper();

    if state.pipeline.is_configured() {
        match state.pipeline.provider_balance().await {
            Some(balance) => info!("2Captcha balance: ${:.2}", balance),
            None => warn!("2Captcha balance unavailable, continuing anyway"),
        }
    } else {
        warn!("No challenge solver configured; challenges will end passes unresolved");
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut loops = Vec::new();
    for target in targets {
        info!("[{}] scheduling {} ({:?})", target.id, target.url, target.tier);
        loops.push(tokio::spawn(
            state.engine.clone().run_target_loop(target, shutdown_rx.clone()),
        ));
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested, stopping {} loop(s)", loops.len());
    let _ = shutdown_tx.send(true);
    for handle in loops {
        let _ = handle.await;
    }

    state.pool.close_all().await;
    let snapshot = state.stats.snapshot();
    info!(
        "Done: {} passes, {} slots found, {} blocked, {} captchas",
        snapshot.passes, snapshot.slots_found, snapshot.blocked, snapshot.captchas
    );
    Ok(())
}

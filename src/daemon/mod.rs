//! Daemon implementation for fanbridge

use crate::{
    bridge::{FanBridge, PollReport},
    config::BridgeConfig,
    errors::Result,
};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::time::{self, Duration, Interval, MissedTickBehavior};

const METRICS_LOG_EVERY: Duration = Duration::from_secs(60);

/// Polls drive temperatures and applies the fan duty on an interval
pub struct FanBridgeDaemon {
    bridge: Arc<FanBridge>,
    config_path: PathBuf,
}

impl FanBridgeDaemon {
    pub fn new(bridge: Arc<FanBridge>, config_path: PathBuf) -> Self {
        Self { bridge, config_path }
    }

    /// Run until SIGINT or SIGTERM
    pub async fn run(self) -> Result<()> {
        let mut poll_every = self.bridge.poll_interval();
        info!(
            "Starting fanbridge daemon (poll every {}s, config {})",
            poll_every.as_secs(),
            self.config_path.display()
        );

        let mut ticker = interval(poll_every);
        let mut terminate = signal(SignalKind::terminate())?;
        let mut hangup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = ticker.tick() => self.tick().await,
                _ = tokio::signal::ctrl_c() => {
                    info!("Interrupt received, stopping");
                    break;
                }
                _ = terminate.recv() => {
                    info!("SIGTERM received, stopping");
                    break;
                }
                _ = hangup.recv() => {
                    info!("SIGHUP received, reloading {}", self.config_path.display());
                    self.reload();
                    let wanted = self.bridge.poll_interval();
                    if wanted != poll_every {
                        info!("Poll interval changed to {}s", wanted.as_secs());
                        poll_every = wanted;
                        ticker = interval(poll_every);
                    }
                }
            }
        }

        info!("Daemon stopped");
        Ok(())
    }

    async fn tick(&self) {
        let bridge = Arc::clone(&self.bridge);
        // serial I/O blocks for up to its timeout
        match tokio::task::spawn_blocking(move || bridge.poll()).await {
            Ok(report) => self.log_report(&report),
            Err(e) => error!("Poll task failed: {}", e),
        }

        if self.bridge.throttle().should("metrics", METRICS_LOG_EVERY) {
            let metrics = self.bridge.metrics();
            debug!(
                "metrics | open_failures={} auto_ok={} auto_err={}",
                metrics.open_failures(),
                metrics.serial_commands("auto", "ok"),
                metrics.serial_commands("auto", "error")
            );
        }
    }

    fn log_report(&self, report: &PollReport) {
        let status = &report.status;
        debug!(
            "poll | hdd avg={} max={} n={} | ssd avg={} max={} n={} | duty={}%{}",
            status.hdd.average,
            status.hdd.maximum,
            status.hdd.count,
            status.ssd.average,
            status.ssd.maximum,
            status.ssd.count,
            status.recommended_duty,
            if status.override_triggered { " (override)" } else { "" }
        );
        if let Some(reason) = report.auto_apply.reason.as_deref() {
            debug!("auto-apply paused: {}", reason);
        }
    }

    fn reload(&self) {
        let mut config = match BridgeConfig::load_from_file(&self.config_path) {
            Ok(config) => config,
            Err(e) => {
                warn!("Keeping current configuration, reload failed: {}", e);
                return;
            }
        };
        config.apply_env_overrides();
        if let Err(e) = self.bridge.reload_config(config) {
            warn!("Keeping current configuration, reload failed: {}", e);
        }
    }
}

fn interval(period: Duration) -> Interval {
    let mut ticker = time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

//! Long-lived fanbridge service
//!
//! Owns the configuration, the drive source and the serial stack. The HTTP
//! layer, the daemon loop and the CLI all go through [`FanBridge`].

use crate::auto_apply::{AutoApplyController, AutoApplyOutcome, AutoApplyState};
use crate::config::{BridgeConfig, Mode};
use crate::curve::{clamp_duty, compute_recommended_duty, ClassStats, CurveTable, OverridePolicy};
use crate::drives::{DriveClass, DriveRecord, DriveSource, SimulatedDrives, UnraidDisks};
use crate::errors::Result;
use crate::logging::LogThrottle;
use crate::metrics::Metrics;
use crate::serial::transport::DEFAULT_TIMEOUT;
use crate::serial::{
    ConnectionState, ConnectionStatus, HealthCheck, NativeOpener, PortOpener, PortResolver, PortSource,
    SerialExchangeResult, SerialSettings, SerialTransport, SystemPorts, ToolsReport, UsbInfo,
};
use chrono::{DateTime, Utc};
use log::{debug, info};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Snapshot of drives and the duty they call for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub drives: Vec<DriveRecord>,
    #[serde(rename = "hdd_stats")]
    pub hdd: ClassStats,
    #[serde(rename = "ssd_stats")]
    pub ssd: ClassStats,
    pub recommended_duty: u8,
    pub override_triggered: bool,
    pub mode: Mode,
    pub version: String,
    pub auto_apply: AutoApplyState,
}

/// One daemon tick: status plus the auto-apply decision
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PollReport {
    pub status: StatusSnapshot,
    pub auto_apply: AutoApplyOutcome,
}

/// Discovered ports with their USB details
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortListing {
    pub preferred: String,
    pub last_good_port: Option<String>,
    pub candidates: Vec<String>,
    pub usb: Vec<UsbInfo>,
}

/// Config with its curves already validated
struct Active {
    config: BridgeConfig,
    hdd_curve: CurveTable,
    ssd_curve: CurveTable,
    policy: OverridePolicy,
}

impl Active {
    fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            hdd_curve: config.hdd_curve()?,
            ssd_curve: config.ssd_curve()?,
            policy: config.override_policy(),
            config,
        })
    }
}

pub struct FanBridge {
    active: RwLock<Active>,
    drives: RwLock<Arc<dyn DriveSource>>,
    // an injected drive source survives config reloads
    drives_from_config: bool,
    transport: Arc<SerialTransport>,
    connection: ConnectionStatus,
    auto_apply: AutoApplyController,
    metrics: Arc<Metrics>,
    throttle: Arc<LogThrottle>,
}

impl FanBridge {
    /// Service talking to real ports and the configured drive source
    pub fn from_config(config: BridgeConfig) -> Result<Self> {
        let throttle = Arc::new(LogThrottle::new());
        let drives = drive_source_for(&config, &throttle);
        Self::build(config, drives, true, Box::new(SystemPorts), Box::new(NativeOpener), throttle)
    }

    /// Service with caller-supplied drive, port and opener implementations
    pub fn with_parts(
        config: BridgeConfig,
        drives: Arc<dyn DriveSource>,
        ports: Box<dyn PortSource>,
        opener: Box<dyn PortOpener>,
    ) -> Result<Self> {
        Self::build(config, drives, false, ports, opener, Arc::new(LogThrottle::new()))
    }

    fn build(
        config: BridgeConfig,
        drives: Arc<dyn DriveSource>,
        drives_from_config: bool,
        ports: Box<dyn PortSource>,
        opener: Box<dyn PortOpener>,
        throttle: Arc<LogThrottle>,
    ) -> Result<Self> {
        let active = Active::new(config)?;
        let metrics = Arc::new(Metrics::new());
        let transport = Arc::new(SerialTransport::new(
            Arc::new(PortResolver::new(ports)),
            opener,
            serial_settings(&active.config),
            Arc::clone(&metrics),
        ));
        let connection = ConnectionStatus::new(Arc::clone(&transport), Arc::clone(&metrics), Arc::clone(&throttle));
        let auto_apply = AutoApplyController::new(
            active.config.auto_apply,
            active.config.auto_apply_min_interval_s,
            active.config.auto_apply_hysteresis_duty,
        );

        Ok(Self {
            active: RwLock::new(active),
            drives: RwLock::new(drives),
            drives_from_config,
            transport,
            connection,
            auto_apply,
            metrics,
            throttle,
        })
    }

    pub fn config(&self) -> BridgeConfig {
        self.active.read().config.clone()
    }

    /// Swap in a new configuration. The last-good port and auto-apply
    /// history are kept.
    pub fn reload_config(&self, config: BridgeConfig) -> Result<()> {
        let active = Active::new(config)?;
        if self.drives_from_config {
            *self.drives.write() = drive_source_for(&active.config, &self.throttle);
        }
        self.transport.update_settings(serial_settings(&active.config));
        self.auto_apply.configure(
            active.config.auto_apply,
            active.config.auto_apply_min_interval_s,
            active.config.auto_apply_hysteresis_duty,
        );
        *self.active.write() = active;
        info!("Configuration reloaded");
        Ok(())
    }

    /// Current drives, per-class stats and the recommended duty.
    ///
    /// Pure with respect to the serial link; nothing is sent.
    pub fn compute_status(&self) -> StatusSnapshot {
        let drives = Arc::clone(&self.drives.read());
        let active = self.active.read();
        let records = drives.drive_records(&active.config.exclude_set());

        let hdd = ClassStats::from_drives(&records, DriveClass::Hdd);
        let ssd = ClassStats::from_drives(&records, DriveClass::Ssd);
        let recommendation = compute_recommended_duty(&hdd, &ssd, &active.hdd_curve, &active.ssd_curve, &active.policy);
        debug!(
            "status | drives={} hdd_avg={} ssd_avg={} duty={} override={}",
            records.len(),
            hdd.average,
            ssd.average,
            recommendation.duty,
            recommendation.override_triggered
        );

        StatusSnapshot {
            drives: records,
            hdd,
            ssd,
            recommended_duty: recommendation.duty,
            override_triggered: recommendation.override_triggered,
            mode: active.config.mode,
            version: env!("CARGO_PKG_VERSION").to_string(),
            auto_apply: self.auto_apply.state(),
        }
    }

    /// Compute the status and run one auto-apply tick on its duty
    pub fn poll(&self) -> PollReport {
        let status = self.compute_status();
        let auto_apply = self.run_auto_apply_tick(i64::from(status.recommended_duty));
        PollReport { status, auto_apply }
    }

    pub fn get_connection_status(&self, full: bool) -> ConnectionState {
        self.connection.status(full)
    }

    /// Send one raw line and read one reply line
    pub fn send_raw_line(&self, line: &str) -> SerialExchangeResult {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return SerialExchangeResult::failed(line, "empty line");
        }
        let res = self.transport.exchange(trimmed, true, DEFAULT_TIMEOUT);
        self.count("send", &res);
        res
    }

    /// Send a duty percentage, clamped into 0..=100
    pub fn set_duty_percent(&self, value: i64) -> SerialExchangeResult {
        let res = self.send_duty("pwm", clamp_duty(value));
        if res.ok {
            info!("duty set to {}% on {}", res.value.unwrap_or_default(), res.port.as_deref().unwrap_or("?"));
        }
        res
    }

    pub fn run_auto_apply_tick(&self, recommended_duty: i64) -> AutoApplyOutcome {
        self.run_auto_apply_tick_at(recommended_duty, Utc::now())
    }

    /// As [`run_auto_apply_tick`](Self::run_auto_apply_tick) with an explicit clock
    pub fn run_auto_apply_tick_at(&self, recommended_duty: i64, now: DateTime<Utc>) -> AutoApplyOutcome {
        // only probe the port when the outcome depends on it
        let connected = self.auto_apply.state().enabled && self.connection.status(false).connected;
        self.auto_apply
            .tick(recommended_duty, connected, now, |duty| self.send_duty("auto", duty))
    }

    pub fn quick_health_check(&self) -> HealthCheck {
        self.connection.quick_health_check()
    }

    pub fn tools_report(&self) -> ToolsReport {
        self.connection.tools_report()
    }

    pub fn list_ports(&self) -> PortListing {
        let resolver = self.transport.resolver();
        let settings = self.transport.settings();
        let candidates = resolver.list_candidates();
        PortListing {
            preferred: resolver.preferred(settings.configured_port.as_deref(), &candidates),
            last_good_port: resolver.last_good(),
            usb: candidates.iter().filter_map(|p| resolver.usb_info(p)).collect(),
            candidates,
        }
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn throttle(&self) -> &LogThrottle {
        &self.throttle
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.active.read().config.poll_interval_s)
    }

    fn send_duty(&self, kind: &str, duty: u8) -> SerialExchangeResult {
        let mut res = self.transport.exchange(&duty.to_string(), true, DEFAULT_TIMEOUT);
        res.value = Some(duty);
        self.count(kind, &res);
        res
    }

    fn count(&self, kind: &str, res: &SerialExchangeResult) {
        self.metrics
            .inc_serial_command(kind, if res.ok { "ok" } else { "error" });
    }
}

fn serial_settings(config: &BridgeConfig) -> SerialSettings {
    SerialSettings {
        baud: config.serial_baud,
        configured_port: config.preferred_port().map(str::to_string),
    }
}

fn drive_source_for(config: &BridgeConfig, throttle: &Arc<LogThrottle>) -> Arc<dyn DriveSource> {
    match config.mode {
        Mode::Sim => Arc::new(SimulatedDrives::new(config.sim.drives.clone())),
        Mode::Unraid => Arc::new(UnraidDisks::new(
            config.disks_ini.clone(),
            Duration::from_secs(config.stale_after_s),
            Arc::clone(throttle),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drives::SimDrive;
    use crate::serial::ports::fake::FakePorts;
    use crate::serial::transport::fake::{Behavior, FakeOpener};

    fn sim(drives: &[(&str, DriveClass, Option<i32>)]) -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.sim.drives = drives
            .iter()
            .map(|(name, class, temp)| SimDrive {
                name: name.to_string(),
                class: *class,
                temp: *temp,
            })
            .collect();
        config
    }

    fn bridge(config: BridgeConfig, ports: &FakePorts, opener: &FakeOpener) -> FanBridge {
        let drives = Arc::new(SimulatedDrives::new(config.sim.drives.clone()));
        FanBridge::with_parts(config, drives, Box::new(ports.clone()), Box::new(opener.clone())).unwrap()
    }

    #[test]
    fn excluded_drive_is_ignored() {
        let mut config = sim(&[("sdb", DriveClass::Hdd, Some(36)), ("sdc", DriveClass::Hdd, Some(50))]);
        config.exclude_devices = vec!["sdc".into()];
        let status = bridge(config, &FakePorts::default(), &FakeOpener::default()).compute_status();

        assert_eq!(status.hdd.count, 1);
        assert_eq!(status.recommended_duty, 40);
        assert!(!status.override_triggered);
        assert!(status.drives.iter().any(|d| d.device == "sdc" && d.excluded));
    }

    #[test]
    fn empty_line_never_opens_port() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec![]));
        let res = bridge(BridgeConfig::default(), &ports, &opener).send_raw_line("   ");

        assert!(!res.ok);
        assert_eq!(res.error.as_deref(), Some("empty line"));
        assert!(opener.opened().is_empty());
    }

    #[test]
    fn duty_commands_are_counted_by_kind() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec!["OK\n"]));
        let bridge = bridge(BridgeConfig::default(), &ports, &opener);

        let res = bridge.set_duty_percent(-5);
        assert!(res.ok);
        assert_eq!(res.value, Some(0));
        assert_eq!(opener.written(), vec!["0\n".to_string()]);
        assert_eq!(bridge.metrics().serial_commands("pwm", "ok"), 1);
    }

    #[test]
    fn disabled_auto_apply_does_not_probe() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec![]));
        let out = bridge(BridgeConfig::default(), &ports, &opener).run_auto_apply_tick(60);

        assert!(!out.applied);
        assert_eq!(out.reason.as_deref(), Some("auto-apply disabled"));
        assert!(opener.opened().is_empty());
    }

    #[test]
    fn poll_applies_recommended_duty() {
        let mut config = sim(&[("nvme0n1", DriveClass::Ssd, Some(55))]);
        config.auto_apply = true;
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec!["", "OK 50\n"]));
        let bridge = bridge(config, &ports, &opener);

        let report = bridge.poll();
        assert_eq!(report.status.recommended_duty, 50);
        assert!(report.auto_apply.applied);
        assert_eq!(opener.written(), vec!["50\n".to_string()]);
        assert_eq!(bridge.metrics().serial_commands("auto", "ok"), 1);
    }

    #[test]
    fn reload_rejects_bad_curve_and_keeps_old_config() {
        let bridge = bridge(BridgeConfig::default(), &FakePorts::default(), &FakeOpener::default());
        let mut bad = BridgeConfig::default();
        bad.hdd_pwm = vec![20, 40];
        assert!(bridge.reload_config(bad).is_err());
        assert_eq!(bridge.config().hdd_pwm, vec![20, 40, 70, 100]);

        let mut good = BridgeConfig::default();
        good.serial_baud = 9600;
        bridge.reload_config(good).unwrap();
        assert_eq!(bridge.get_connection_status(false).baud, 9600);
    }
}

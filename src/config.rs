//! Typed configuration with defaults merging and atomic persistence

use crate::curve::{validate_curve, CurveTable, OverridePolicy};
use crate::drives::{DriveClass, SimDrive};
use crate::errors::{BridgeError, Result};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable naming the config file
pub const CONFIG_PATH_ENV: &str = "FANBRIDGE_CONFIG";
/// Environment variable forcing the serial port
pub const SERIAL_PORT_ENV: &str = "FANBRIDGE_SERIAL_PORT";
/// Environment variable forcing the baud rate
pub const SERIAL_BAUD_ENV: &str = "FANBRIDGE_SERIAL_BAUD";

const DEFAULT_CONFIG_PATH: &str = "/config/config.json";
const SAVE_ATTEMPTS: u32 = 3;

/// Where drive temperatures come from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Sim,
    Unraid,
}

/// Simulation settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimConfig {
    #[serde(default)]
    pub drives: Vec<SimDrive>,
}

/// Full bridge configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeConfig {
    pub mode: Mode,
    pub disks_ini: PathBuf,
    pub poll_interval_s: u64,
    pub stale_after_s: u64,
    pub sim: SimConfig,

    pub hdd_thresholds: Vec<i32>,
    pub hdd_pwm: Vec<i32>,
    pub ssd_thresholds: Vec<i32>,
    pub ssd_pwm: Vec<i32>,
    pub single_override_hdd_c: i32,
    pub single_override_ssd_c: i32,
    pub override_pwm: i32,
    pub fallback_pwm: i32,

    pub auto_apply: bool,
    pub auto_apply_min_interval_s: u64,
    /// Minimum change before re-sending, in 0-255 PWM units
    pub auto_apply_hysteresis_duty: u32,

    pub exclude_devices: Vec<String>,
    pub serial_port_preference: Option<String>,
    pub serial_baud: u32,
    pub log_level: Option<String>,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        let policy = OverridePolicy::default();
        Self {
            mode: Mode::Sim,
            disks_ini: PathBuf::from("/var/local/emhttp/disks.ini"),
            poll_interval_s: 5,
            stale_after_s: 300,
            sim: SimConfig::default(),
            hdd_thresholds: vec![30, 35, 40, 45],
            hdd_pwm: vec![20, 40, 70, 100],
            ssd_thresholds: vec![40, 50, 60],
            ssd_pwm: vec![20, 50, 100],
            single_override_hdd_c: policy.hdd_override_c,
            single_override_ssd_c: policy.ssd_override_c,
            override_pwm: policy.override_duty,
            fallback_pwm: policy.fallback_duty,
            auto_apply: false,
            auto_apply_min_interval_s: 10,
            auto_apply_hysteresis_duty: 5,
            exclude_devices: Vec::new(),
            serial_port_preference: None,
            serial_baud: 115_200,
            log_level: None,
        }
    }
}

impl BridgeConfig {
    /// Default config path, honouring `FANBRIDGE_CONFIG`
    pub fn get_config_path() -> PathBuf {
        std::env::var(CONFIG_PATH_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH))
    }

    /// Parse user JSON merged over the defaults
    pub fn from_json_str(json: &str) -> Result<Self> {
        let user: Value = serde_json::from_str(json)?;
        let defaults = serde_json::to_value(Self::default())?;
        let config: Self = serde_json::from_value(merge_over_defaults(defaults, user))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let json = fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    /// Load `path`, writing the defaults first when it does not exist
    pub fn load_or_init(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load_from_file(path)
                .map_err(|e| BridgeError::Config(format!("Failed to load {}: {}", path.display(), e)))
        } else {
            let config = Self::default();
            config.save(path).map_err(|e| {
                BridgeError::Config(format!("Failed to save default config: {}", e))
            })?;
            Ok(config)
        }
    }

    /// Atomically write the config, retrying transient failures
    pub fn save(&self, path: &Path) -> Result<()> {
        let mut attempt = 1;
        loop {
            match self.save_atomic(path) {
                Ok(()) => return Ok(()),
                Err(e) if attempt < SAVE_ATTEMPTS => {
                    error!(
                        "Failed to save config, retrying... ({} attempts left): {}",
                        SAVE_ATTEMPTS - attempt,
                        e
                    );
                    attempt += 1;
                    std::thread::sleep(Duration::from_millis(100));
                }
                Err(e) => {
                    error!("Failed to save config after all retries: {}", e);
                    return Err(e);
                }
            }
        }
    }

    fn save_atomic(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, serde_json::to_string_pretty(self)?)?;
        if let Err(e) = fs::rename(&temp_path, path) {
            let _ = fs::remove_file(&temp_path);
            return Err(BridgeError::Io(e));
        }
        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    /// Apply `FANBRIDGE_SERIAL_PORT` / `FANBRIDGE_SERIAL_BAUD`
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// As [`apply_env_overrides`](Self::apply_env_overrides), reading variables through `lookup`
    pub fn apply_overrides_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(port) = lookup(SERIAL_PORT_ENV) {
            if !port.trim().is_empty() {
                self.serial_port_preference = Some(port.trim().to_string());
            }
        }
        if let Some(baud) = lookup(SERIAL_BAUD_ENV) {
            match baud.trim().parse::<u32>() {
                Ok(b) if b > 0 => self.serial_baud = b,
                _ => warn!("Ignoring invalid {}={}", SERIAL_BAUD_ENV, baud),
            }
        }
    }

    /// Reject values the engine and transport cannot use
    pub fn validate(&self) -> Result<()> {
        validate_curve(DriveClass::Hdd, &self.hdd_thresholds, &self.hdd_pwm)?;
        validate_curve(DriveClass::Ssd, &self.ssd_thresholds, &self.ssd_pwm)?;
        if self.serial_baud == 0 {
            return Err(BridgeError::Config("serial_baud must be positive".to_string()));
        }
        if self.poll_interval_s == 0 {
            return Err(BridgeError::Config("poll_interval_s must be positive".to_string()));
        }
        Ok(())
    }

    pub fn hdd_curve(&self) -> Result<CurveTable> {
        CurveTable::new(DriveClass::Hdd, self.hdd_thresholds.clone(), self.hdd_pwm.clone())
    }

    pub fn ssd_curve(&self) -> Result<CurveTable> {
        CurveTable::new(DriveClass::Ssd, self.ssd_thresholds.clone(), self.ssd_pwm.clone())
    }

    pub fn override_policy(&self) -> OverridePolicy {
        OverridePolicy {
            hdd_override_c: self.single_override_hdd_c,
            ssd_override_c: self.single_override_ssd_c,
            override_duty: self.override_pwm,
            fallback_duty: self.fallback_pwm,
        }
    }

    pub fn exclude_set(&self) -> HashSet<String> {
        self.exclude_devices
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect()
    }

    /// Configured port, ignoring blank values
    pub fn preferred_port(&self) -> Option<&str> {
        self.serial_port_preference
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }
}

/// Merge `user` over `defaults`.
///
/// Objects merge key by key, everything else is replaced; `null` user values
/// keep the default.
pub fn merge_over_defaults(defaults: Value, user: Value) -> Value {
    match (defaults, user) {
        (Value::Object(mut base), Value::Object(over)) => {
            for (key, over_val) in over {
                if over_val.is_null() {
                    continue;
                }
                let merged = match base.remove(&key) {
                    Some(base_val) => merge_over_defaults(base_val, over_val),
                    None => over_val,
                };
                base.insert(key, merged);
            }
            Value::Object(base)
        }
        (base, Value::Null) => base,
        (_, over) => over,
    }
}

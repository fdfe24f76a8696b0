//! Drive records and the sources that produce them
//!
//! A [`DriveSource`] is asked once per status computation for the current
//! list of drives. Two sources exist: drives simulated from configuration,
//! and Unraid's `disks.ini` refined with sysfs readings.

use crate::errors::Result;
use crate::logging::LogThrottle;
use log::{debug, error, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// Highest temperature accepted from any source
pub const MAX_PLAUSIBLE_TEMP_C: i32 = 120;

/// Drive category used for statistics, curves and overrides
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DriveClass {
    #[default]
    #[serde(rename = "HDD", alias = "hdd")]
    Hdd,
    #[serde(rename = "SSD", alias = "ssd")]
    Ssd,
}

impl std::fmt::Display for DriveClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DriveClass::Hdd => write!(f, "HDD"),
            DriveClass::Ssd => write!(f, "SSD"),
        }
    }
}

/// Display state of a drive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriveState {
    #[serde(rename = "up")]
    Up,
    #[serde(rename = "down")]
    Down,
    #[serde(rename = "on")]
    On,
    #[serde(rename = "spun down")]
    SpunDown,
    #[serde(rename = "N/A")]
    Unknown,
}

impl DriveState {
    fn derive(class: DriveClass, spun_down: bool, has_temp: bool) -> Self {
        match (class, spun_down) {
            (DriveClass::Hdd, true) => DriveState::Down,
            (DriveClass::Hdd, false) => DriveState::Up,
            (DriveClass::Ssd, true) => DriveState::SpunDown,
            (DriveClass::Ssd, false) if has_temp => DriveState::On,
            (DriveClass::Ssd, false) => DriveState::Unknown,
        }
    }
}

/// One drive as seen during a single status computation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriveRecord {
    #[serde(rename = "dev")]
    pub device: String,
    #[serde(rename = "type")]
    pub class: DriveClass,
    #[serde(rename = "temp")]
    pub temperature_celsius: Option<i32>,
    pub excluded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot: Option<String>,
    pub state: DriveState,
}

impl DriveRecord {
    pub fn new(device: impl Into<String>, class: DriveClass, temperature_celsius: Option<i32>) -> Self {
        Self {
            device: device.into(),
            class,
            temperature_celsius,
            excluded: false,
            slot: None,
            state: DriveState::derive(class, false, temperature_celsius.is_some()),
        }
    }

    pub fn excluded(mut self, excluded: bool) -> Self {
        self.excluded = excluded;
        self
    }

    /// Temperature that counts towards statistics and overrides, if any
    pub fn contributing_temp(&self, class: DriveClass) -> Option<i32> {
        if self.class != class || self.excluded {
            return None;
        }
        self.temperature_celsius
    }
}

/// Producer of drive records
pub trait DriveSource: Send + Sync {
    /// Current drives; `excludes` holds device names to flag as excluded.
    fn drive_records(&self, excludes: &HashSet<String>) -> Vec<DriveRecord>;
}

/// A drive declared in configuration for simulation mode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimDrive {
    pub name: String,
    #[serde(rename = "type", default)]
    pub class: DriveClass,
    #[serde(default)]
    pub temp: Option<i32>,
}

/// Drives taken verbatim from configuration
#[derive(Debug, Clone, Default)]
pub struct SimulatedDrives {
    drives: Vec<SimDrive>,
}

impl SimulatedDrives {
    pub fn new(drives: Vec<SimDrive>) -> Self {
        Self { drives }
    }
}

impl DriveSource for SimulatedDrives {
    fn drive_records(&self, excludes: &HashSet<String>) -> Vec<DriveRecord> {
        self.drives
            .iter()
            .map(|d| {
                let mut record = DriveRecord::new(d.name.clone(), d.class, d.temp)
                    .excluded(excludes.contains(&d.name));
                record.state = if d.temp.is_some() {
                    DriveState::On
                } else {
                    DriveState::SpunDown
                };
                record
            })
            .collect()
    }
}

/// Unraid `disks.ini` reader refined with sysfs
pub struct UnraidDisks {
    disks_ini: PathBuf,
    sys_root: PathBuf,
    stale_after: Duration,
    throttle: Arc<LogThrottle>,
}

impl UnraidDisks {
    pub fn new(disks_ini: impl Into<PathBuf>, stale_after: Duration, throttle: Arc<LogThrottle>) -> Self {
        Self {
            disks_ini: disks_ini.into(),
            sys_root: PathBuf::from("/sys"),
            stale_after,
            throttle,
        }
    }

    /// Read sysfs from another root (used by tests)
    pub fn with_sys_root(mut self, sys_root: impl Into<PathBuf>) -> Self {
        self.sys_root = sys_root.into();
        self
    }

    /// Parse the ini file; errors are reported to the caller
    pub fn read(&self, excludes: &HashSet<String>) -> Result<Vec<DriveRecord>> {
        let content = fs::read_to_string(&self.disks_ini)?;
        self.warn_if_stale();

        let mut drives = Vec::new();
        for section in parse_ini(&content) {
            let device = unquote(section.get("device").map(String::as_str).unwrap_or(""));
            if device.is_empty() {
                continue;
            }
            let slot = unquote(section.get("name").map(String::as_str).unwrap_or(""));
            let mut temp = parse_temp(&unquote(section.get("temp").map(String::as_str).unwrap_or("")));

            let mut spun_down = unquote(section.get("spundown").map(String::as_str).unwrap_or("0")) == "1";
            if !spun_down && self.spin_state(&device) == Some(true) {
                spun_down = true;
            }
            if temp.is_none() && device.starts_with("nvme") && !spun_down {
                temp = self.nvme_temp(&device);
            }

            let class = if self.is_rotational(&device) {
                DriveClass::Hdd
            } else {
                DriveClass::Ssd
            };
            drives.push(DriveRecord {
                excluded: excludes.contains(&device),
                slot: if slot.is_empty() { None } else { Some(slot) },
                state: DriveState::derive(class, spun_down, temp.is_some()),
                device,
                class,
                temperature_celsius: temp,
            });
        }
        Ok(drives)
    }

    /// Warn, throttled, when the ini file is older than `stale_after`
    fn warn_if_stale(&self) -> bool {
        let modified = fs::metadata(&self.disks_ini).and_then(|m| m.modified());
        let Ok(modified) = modified else {
            return false;
        };
        let age = SystemTime::now()
            .duration_since(modified)
            .unwrap_or_default();
        if age <= self.stale_after || !self.throttle.should("stale", Duration::from_secs(60)) {
            return false;
        }
        warn!(
            "disk state looks stale | path={} age_s={}",
            self.disks_ini.display(),
            age.as_secs()
        );
        true
    }

    fn sysfs(&self, device: &str, rel: &str) -> Option<String> {
        read_trimmed(&self.sys_root.join("block").join(device).join(rel))
    }

    /// `Some(true)` when sysfs reports the drive spun down
    fn spin_state(&self, device: &str) -> Option<bool> {
        if let Some(state) = self.sysfs(device, "device/state") {
            let state = state.to_lowercase();
            if state.contains("running") || state.contains("active") {
                return Some(false);
            }
            if state.contains("offline") || state.contains("suspended") || state.contains("standby") {
                return Some(true);
            }
        }
        if let Some(runtime) = self.sysfs(device, "power/runtime_status") {
            let runtime = runtime.to_lowercase();
            if runtime.contains("active") {
                return Some(false);
            }
            if runtime.contains("suspend") {
                return Some(true);
            }
        }
        None
    }

    fn nvme_temp(&self, device: &str) -> Option<i32> {
        // nvme0n1 -> nvme0
        let ctrl = match device.get(1..).and_then(|rest| rest.find('n')) {
            Some(i) => &device[..i + 1],
            None => device,
        };
        let pattern = self
            .sys_root
            .join("class/nvme")
            .join(ctrl)
            .join("device/hwmon/hwmon*/temp*_input");
        let paths = glob::glob(&pattern.to_string_lossy()).ok()?;
        for path in paths.flatten() {
            let Some(raw) = read_trimmed(&path).and_then(|v| v.parse::<i32>().ok()) else {
                continue;
            };
            let celsius = if raw > 1000 { raw / 1000 } else { raw };
            if (0..=MAX_PLAUSIBLE_TEMP_C).contains(&celsius) {
                debug!("nvme temperature from sysfs | dev={} temp={}", device, celsius);
                return Some(celsius);
            }
        }
        None
    }

    fn is_rotational(&self, device: &str) -> bool {
        if device.starts_with("nvme") {
            return false;
        }
        match self.sysfs(device, "queue/rotational") {
            Some(rot) => rot == "1",
            None => true,
        }
    }
}

impl DriveSource for UnraidDisks {
    fn drive_records(&self, excludes: &HashSet<String>) -> Vec<DriveRecord> {
        if !self.disks_ini.exists() {
            return Vec::new();
        }
        match self.read(excludes) {
            Ok(drives) => drives,
            Err(e) => {
                error!("Failed to parse {}: {}", self.disks_ini.display(), e);
                Vec::new()
            }
        }
    }
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

fn parse_temp(raw: &str) -> Option<i32> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    raw.parse::<i32>()
        .ok()
        .filter(|t| (0..=MAX_PLAUSIBLE_TEMP_C).contains(t))
}

/// Strip one pair of matching surrounding quotes
pub fn unquote(value: &str) -> String {
    let v = value.trim();
    let quoted = v.len() >= 2
        && ((v.starts_with('"') && v.ends_with('"')) || (v.starts_with('\'') && v.ends_with('\'')));
    if quoted {
        v[1..v.len() - 1].trim().to_string()
    } else {
        v.to_string()
    }
}

/// Minimal ini reader: one key map per `[section]`, keys lowercased.
fn parse_ini(content: &str) -> Vec<BTreeMap<String, String>> {
    let mut sections = Vec::new();
    let mut current: Option<BTreeMap<String, String>> = None;

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            if let Some(done) = current.take() {
                sections.push(done);
            }
            current = Some(BTreeMap::new());
            continue;
        }
        if let (Some(section), Some((key, value))) = (current.as_mut(), line.split_once('=')) {
            section.insert(key.trim().to_lowercase(), value.trim().to_string());
        }
    }
    if let Some(done) = current {
        sections.push(done);
    }
    sections
}

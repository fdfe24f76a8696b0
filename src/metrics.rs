//! Process-wide serial counters in Prometheus text format

use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    open_failures: AtomicU64,
    serial_commands: Mutex<BTreeMap<(String, String), u64>>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc_open_failure(&self) {
        self.open_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn open_failures(&self) -> u64 {
        self.open_failures.load(Ordering::Relaxed)
    }

    /// Count one serial command of `kind` ending in `status` (`ok` / `error`)
    pub fn inc_serial_command(&self, kind: &str, status: &str) {
        *self
            .serial_commands
            .lock()
            .entry((kind.to_string(), status.to_string()))
            .or_insert(0) += 1;
    }

    pub fn serial_commands(&self, kind: &str, status: &str) -> u64 {
        self.serial_commands
            .lock()
            .get(&(kind.to_string(), status.to_string()))
            .copied()
            .unwrap_or(0)
    }

    /// Text exposition format, version 0.0.4
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();
        out.push_str("# HELP fanbridge_serial_commands_total Serial commands by kind and status\n");
        out.push_str("# TYPE fanbridge_serial_commands_total counter\n");
        for ((kind, status), count) in self.serial_commands.lock().iter() {
            let _ = writeln!(
                out,
                "fanbridge_serial_commands_total{{kind=\"{}\",status=\"{}\"}} {}",
                kind, status, count
            );
        }
        out.push_str("# HELP fanbridge_serial_open_failures_total Serial open failures\n");
        out.push_str("# TYPE fanbridge_serial_open_failures_total counter\n");
        let _ = writeln!(out, "fanbridge_serial_open_failures_total {}", self.open_failures());
        out
    }
}

//! Logging setup for fanbridge

use fern::Dispatch;
use log::LevelFilter;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Environment variable that overrides the CLI verbosity
pub const LOG_LEVEL_ENV: &str = "FANBRIDGE_LOG_LEVEL";

/// Map a verbosity count to a level filter
pub fn level_for_verbosity(verbosity: u8) -> LevelFilter {
    match verbosity {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        2 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    }
}

/// Parse a level name as accepted by the log viewer and the environment.
///
/// `NORMAL` is an alias for `INFO`, `CRITICAL` maps onto `ERROR`.
pub fn parse_level(name: &str) -> Option<LevelFilter> {
    match name.trim().to_ascii_uppercase().as_str() {
        "TRACE" => Some(LevelFilter::Trace),
        "DEBUG" => Some(LevelFilter::Debug),
        "INFO" | "NORMAL" => Some(LevelFilter::Info),
        "WARN" | "WARNING" => Some(LevelFilter::Warn),
        "ERROR" | "CRITICAL" => Some(LevelFilter::Error),
        "OFF" => Some(LevelFilter::Off),
        _ => None,
    }
}

/// Resolve the effective level: environment, then explicit `-v`, then config.
pub fn resolve_level(verbosity: u8, configured: Option<&str>) -> LevelFilter {
    resolve_level_with(verbosity, configured, |key| std::env::var(key).ok())
}

/// As [`resolve_level`], reading variables through `lookup`
pub fn resolve_level_with(
    verbosity: u8,
    configured: Option<&str>,
    lookup: impl Fn(&str) -> Option<String>,
) -> LevelFilter {
    if let Some(level) = lookup(LOG_LEVEL_ENV).as_deref().and_then(parse_level) {
        return level;
    }
    if verbosity > 0 {
        return level_for_verbosity(verbosity);
    }
    configured
        .and_then(parse_level)
        .unwrap_or(LevelFilter::Info)
}

/// Where log lines go
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    /// Daemon mode, collected by the container runtime
    Stdout,
    /// One-shot commands, keeping stdout for their JSON output
    Stderr,
}

/// Setup logging at the given level
pub fn setup(level: LevelFilter, target: LogTarget) -> Result<(), fern::InitError> {
    let dispatch = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "{} [{}] {}: {}",
                chrono::Local::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                record.target(),
                message
            ))
        })
        .level(level);

    match target {
        LogTarget::Stdout => dispatch.chain(std::io::stdout()),
        LogTarget::Stderr => dispatch.chain(std::io::stderr()),
    }
    .apply()?;

    Ok(())
}

/// Rate limiter for periodic debug lines, keyed by tag.
#[derive(Debug, Default)]
pub struct LogThrottle {
    last: Mutex<HashMap<String, Instant>>,
}

impl LogThrottle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true at most once per `interval` for each `tag`.
    pub fn should(&self, tag: &str, interval: Duration) -> bool {
        self.should_at(tag, interval, Instant::now())
    }

    fn should_at(&self, tag: &str, interval: Duration, now: Instant) -> bool {
        let mut last = self.last.lock();
        match last.get(tag) {
            Some(prev) if now.saturating_duration_since(*prev) < interval => false,
            _ => {
                last.insert(tag.to_string(), now);
                true
            }
        }
    }
}

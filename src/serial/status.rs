//! Point-in-time connectivity report and controller health checks

use super::ports::{is_console_port, UsbInfo};
use super::transport::{SerialExchangeResult, SerialTransport};
use crate::errors::is_actionable_message;
use crate::logging::LogThrottle;
use crate::metrics::Metrics;
use log::{debug, log, Level};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Liveness command and its literal answer
pub const PING_COMMAND: &str = "PING";
pub const PING_REPLY: &str = "PONG";
/// Firmware version query, answered with free text
pub const VERSION_COMMAND: &str = "VERSION";
/// Timeout of diagnostic exchanges
pub const HEALTH_TIMEOUT: Duration = Duration::from_millis(500);

const STATUS_DEBUG_EVERY: Duration = Duration::from_secs(8);

/// Connectivity as shown to users and used to gate auto-apply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub preferred: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ports: Option<Vec<String>>,
    pub available: bool,
    pub connected: bool,
    pub baud: u32,
    pub message: String,
    pub last_good_port: Option<String>,
}

/// Result of one diagnostic round trip
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub ok: bool,
    #[serde(rename = "ms")]
    pub round_trip_ms: Option<u64>,
    pub reply: Option<String>,
    pub error: Option<String>,
}

impl HealthCheck {
    fn not_connected() -> Self {
        Self {
            error: Some("not connected".to_string()),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checks {
    pub ping: HealthCheck,
    pub version: HealthCheck,
}

/// Everything the diagnostics page shows
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolsReport {
    pub status: ConnectionState,
    pub checks: Checks,
    pub usb: Option<UsbInfo>,
}

pub struct ConnectionStatus {
    transport: Arc<SerialTransport>,
    metrics: Arc<Metrics>,
    throttle: Arc<LogThrottle>,
}

impl ConnectionStatus {
    pub fn new(transport: Arc<SerialTransport>, metrics: Arc<Metrics>, throttle: Arc<LogThrottle>) -> Self {
        Self {
            transport,
            metrics,
            throttle,
        }
    }

    /// Probe the preferred port, falling back to any other candidate.
    ///
    /// With `full == false` the candidate list is left out.
    pub fn status(&self, full: bool) -> ConnectionState {
        let settings = self.transport.settings();
        let resolver = self.transport.resolver();
        let configured = settings.configured_port.as_deref();

        let ports = resolver.list_candidates();
        let available = !ports.is_empty();
        let mut preferred = resolver.preferred(configured, &ports);
        let mut connected = false;
        let mut message = "no ports detected".to_string();

        if let Some(configured) = configured.filter(|c| !available && !resolver.exists(c)) {
            message = format!("preferred port not present: {}", configured);
        }

        if !preferred.is_empty() {
            let probe = self.transport.probe(&preferred, Some(settings.baud));
            connected = probe.ok;
            message = probe.message;

            if !connected && available {
                let tried = preferred.clone();
                for port in ports.iter().filter(|p| **p != tried) {
                    let retry = self.transport.probe(port, Some(settings.baud));
                    if retry.ok {
                        preferred = port.clone();
                        connected = true;
                        message = retry.message;
                        resolver.remember(port);
                        break;
                    }
                }
            }

            if !connected {
                let level = if is_actionable_message(&message) {
                    Level::Warn
                } else {
                    Level::Info
                };
                log!(
                    level,
                    "serial not connected | port={} baud={} reason={} (map device and grant permissions)",
                    preferred,
                    settings.baud,
                    message
                );
            }
        } else if available {
            message = "ports detected but none selected".to_string();
        }

        let state = ConnectionState {
            connected: connected && !is_console_port(&preferred),
            preferred,
            ports: if full { Some(ports) } else { None },
            available,
            baud: settings.baud,
            message,
            last_good_port: resolver.last_good(),
        };

        if self.throttle.should("serial", STATUS_DEBUG_EVERY) {
            debug!(
                "serial | preferred={} available={} connected={} baud={} msg={}",
                state.preferred, state.available, state.connected, state.baud, state.message
            );
        }
        state
    }

    /// Ping the controller when connected; for diagnostics only.
    pub fn quick_health_check(&self) -> HealthCheck {
        let status = self.status(false);
        self.ping(&status)
    }

    /// Status, ping, version and USB details in one report
    pub fn tools_report(&self) -> ToolsReport {
        let status = self.status(true);
        let ping = self.ping(&status);
        let version = self.version(&status);
        let usb = if status.connected {
            self.transport.resolver().usb_info(&status.preferred)
        } else {
            None
        };
        ToolsReport {
            status,
            checks: Checks { ping, version },
            usb,
        }
    }

    fn ping(&self, status: &ConnectionState) -> HealthCheck {
        self.round_trip(status, "ping", PING_COMMAND, |reply| {
            if reply == Some(PING_REPLY) {
                Ok(())
            } else {
                Err(format!("expected {}", PING_REPLY))
            }
        })
    }

    fn version(&self, status: &ConnectionState) -> HealthCheck {
        self.round_trip(status, "version", VERSION_COMMAND, |reply| match reply {
            Some(_) => Ok(()),
            None => Err("no reply".to_string()),
        })
    }

    fn round_trip(
        &self,
        status: &ConnectionState,
        kind: &str,
        command: &str,
        accept: impl Fn(Option<&str>) -> Result<(), String>,
    ) -> HealthCheck {
        if !status.connected {
            return HealthCheck::not_connected();
        }
        let started = Instant::now();
        let res: SerialExchangeResult = self.transport.exchange(command, true, HEALTH_TIMEOUT);
        let round_trip_ms = Some(started.elapsed().as_millis() as u64);

        let check = if res.ok {
            match accept(res.reply.as_deref()) {
                Ok(()) => HealthCheck {
                    ok: true,
                    round_trip_ms,
                    reply: res.reply,
                    error: None,
                },
                Err(mismatch) => HealthCheck {
                    ok: false,
                    round_trip_ms,
                    reply: res.reply,
                    error: Some(mismatch),
                },
            }
        } else {
            HealthCheck {
                ok: false,
                round_trip_ms,
                reply: res.reply,
                error: res.error,
            }
        };
        self.metrics
            .inc_serial_command(kind, if check.ok { "ok" } else { "error" });
        check
    }
}

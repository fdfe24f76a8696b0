//! Line-based request/reply over a freshly opened serial port
//!
//! No handle outlives a call: every exchange opens, writes, optionally reads
//! one line and drops the port again, so a controller that re-enumerates
//! between calls is picked up on the next attempt.

use super::ports::{is_console_port, unique_order, PortResolver};
use crate::errors::SerialError;
use crate::metrics::Metrics;
use log::{debug, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::sync::Arc;
use std::time::Duration;

/// Timeout used when only checking that a port opens
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(200);
/// Default timeout of a full exchange
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1);

/// An open serial connection
pub trait SerialLink: Read + Write + Send {
    /// Discard pending input and output
    fn clear_buffers(&mut self) -> io::Result<()>;
}

/// Opens serial connections
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn SerialLink>, SerialError>;
}

/// 8N1 without flow control through the `serialport` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeOpener;

impl PortOpener for NativeOpener {
    fn open(&self, path: &str, baud: u32, timeout: Duration) -> Result<Box<dyn SerialLink>, SerialError> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()
            .map_err(|e| SerialError::from_open(path, &e))?;
        Ok(Box::new(NativeLink { port }))
    }
}

struct NativeLink {
    port: Box<dyn SerialPort>,
}

impl Read for NativeLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.port.read(buf)
    }
}

impl Write for NativeLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.port.flush()
    }
}

impl SerialLink for NativeLink {
    fn clear_buffers(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

/// Result of a connectivity probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub ok: bool,
    pub message: String,
}

impl Probe {
    fn ok(message: impl Into<String>) -> Self {
        Self { ok: true, message: message.into() }
    }

    fn failed(message: impl Into<String>) -> Self {
        Self { ok: false, message: message.into() }
    }
}

/// Outcome of one request/reply attempt
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialExchangeResult {
    pub ok: bool,
    pub port: Option<String>,
    pub echo: String,
    pub reply: Option<String>,
    pub error: Option<String>,
    /// Duty that was sent, for duty commands
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<u8>,
}

impl SerialExchangeResult {
    pub fn new(echo: impl Into<String>) -> Self {
        Self {
            echo: echo.into(),
            ..Self::default()
        }
    }

    pub fn failed(echo: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Self::new(echo)
        }
    }

    /// Reason to show when the exchange did not succeed
    pub fn error_message(&self) -> String {
        self.error.clone().unwrap_or_else(|| "serial exchange failed".to_string())
    }
}

/// Port and speed the transport works with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerialSettings {
    pub baud: u32,
    pub configured_port: Option<String>,
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            baud: 115_200,
            configured_port: None,
        }
    }
}

/// Serial transport with a shared last-good port hint
pub struct SerialTransport {
    resolver: Arc<PortResolver>,
    opener: Box<dyn PortOpener>,
    settings: RwLock<SerialSettings>,
    metrics: Arc<Metrics>,
}

impl SerialTransport {
    pub fn new(
        resolver: Arc<PortResolver>,
        opener: Box<dyn PortOpener>,
        settings: SerialSettings,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            resolver,
            opener,
            settings: RwLock::new(settings),
            metrics,
        }
    }

    pub fn resolver(&self) -> &PortResolver {
        &self.resolver
    }

    pub fn settings(&self) -> SerialSettings {
        self.settings.read().clone()
    }

    pub fn update_settings(&self, settings: SerialSettings) {
        *self.settings.write() = settings;
    }

    /// Check that `port` opens; writes nothing.
    pub fn probe(&self, port: &str, baud: Option<u32>) -> Probe {
        if port.is_empty() {
            return Probe::failed(SerialError::NoPortSpecified.to_string());
        }
        if is_console_port(port) {
            return Probe::failed(SerialError::ConsolePort.to_string());
        }
        let baud = baud.unwrap_or_else(|| self.settings.read().baud);

        let err = match self.opener.open(port, baud, PROBE_TIMEOUT) {
            Ok(_link) => return Probe::ok("ok"),
            Err(e) => e,
        };

        // macOS exposes the same device as /dev/cu.*, which opens without DCD
        if let Some(alias) = cu_alias(port).filter(|alias| self.resolver.exists(alias)) {
            if self.opener.open(&alias, baud, PROBE_TIMEOUT).is_ok() {
                return Probe::ok(format!("ok ({})", alias));
            }
        }

        let message = err.to_string();
        warn!("serial open failed | port={} baud={} err={}", port, baud, message);
        self.metrics.inc_open_failure();
        Probe::failed(message)
    }

    /// Open the first candidate that works.
    ///
    /// Order: `port`, the preferred port, then every discovered port. The
    /// opened path becomes the new last-good port.
    pub fn open(&self, port: Option<&str>, timeout: Duration) -> Result<(Box<dyn SerialLink>, String), SerialError> {
        let settings = self.settings();
        let discovered = self.resolver.list_candidates();
        let preferred = self
            .resolver
            .preferred(settings.configured_port.as_deref(), &discovered);

        let candidates = unique_order(
            port.map(str::to_string)
                .into_iter()
                .chain(std::iter::once(preferred.clone()))
                .chain(discovered),
        );

        let mut last_err = None;
        for candidate in &candidates {
            if is_console_port(candidate) {
                last_err = Some(SerialError::ConsolePort);
                continue;
            }
            match self.opener.open(candidate, settings.baud, timeout) {
                Ok(mut link) => {
                    if let Err(e) = link.clear_buffers() {
                        debug!("could not clear buffers on {}: {}", candidate, e);
                    }
                    self.resolver.remember(candidate);
                    return Ok((link, candidate.clone()));
                }
                Err(e) => last_err = Some(e),
            }
        }

        let err = last_err.unwrap_or(SerialError::NoPortsDetected);
        let wanted = port.filter(|p| !p.is_empty()).unwrap_or(preferred.as_str());
        warn!(
            "serial open failed | port={} baud={} err={}",
            wanted, settings.baud, err
        );
        Err(err)
    }

    /// Send one line and optionally read one line back.
    ///
    /// Never retries; failures are reported in the result.
    pub fn exchange(&self, line: &str, expect_reply: bool, timeout: Duration) -> SerialExchangeResult {
        let mut out = SerialExchangeResult::new(line);
        let (mut link, port) = match self.open(None, timeout) {
            Ok(opened) => opened,
            Err(e) => {
                out.error = Some(e.to_string());
                return out;
            }
        };
        out.port = Some(port.clone());

        match write_line(link.as_mut(), line, expect_reply) {
            Ok(reply) => {
                out.reply = reply;
                out.ok = true;
            }
            Err(e) => {
                let err = SerialError::from_io(&port, &e);
                warn!("serial exchange failed | port={} err={}", port, err);
                out.error = Some(err.to_string());
            }
        }
        // dropping the link closes the port on every path
        drop(link);
        out
    }
}

fn write_line(link: &mut dyn SerialLink, line: &str, expect_reply: bool) -> io::Result<Option<String>> {
    let payload = format!("{}\n", line.trim());
    link.write_all(payload.as_bytes())?;
    link.flush()?;
    if !expect_reply {
        return Ok(None);
    }

    let mut buf = Vec::new();
    let mut reader = BufReader::new(link);
    match reader.read_until(b'\n', &mut buf) {
        Ok(_) => {}
        // a timeout ends the line with whatever arrived
        Err(e) if e.kind() == io::ErrorKind::TimedOut => {}
        Err(e) => return Err(e),
    }
    let reply = String::from_utf8_lossy(&buf).trim().to_string();
    Ok(if reply.is_empty() { None } else { Some(reply) })
}

fn cu_alias(port: &str) -> Option<String> {
    port.strip_prefix("/dev/tty.").map(|rest| format!("/dev/cu.{}", rest))
}

#[cfg(test)]
pub(crate) mod fake {
    use super::{PortOpener, SerialLink};
    use crate::errors::SerialError;
    use parking_lot::Mutex;
    use std::collections::{HashMap, VecDeque};
    use std::io::{self, Read, Write};
    use std::sync::Arc;
    use std::time::Duration;

    /// What opening a given path does
    #[derive(Clone)]
    pub enum Behavior {
        /// Opens and answers with the queued replies
        Reply(Vec<&'static str>),
        /// Opens, but the write fails
        BrokenWrite,
        Fail(SerialError),
    }

    #[derive(Default)]
    pub struct Shared {
        pub opened: Vec<String>,
        pub closed: Vec<String>,
        pub written: Vec<String>,
        pub replies: HashMap<String, VecDeque<&'static str>>,
    }

    /// Scripted opener recording every call
    #[derive(Clone, Default)]
    pub struct FakeOpener {
        pub behaviors: Arc<Mutex<HashMap<String, Behavior>>>,
        pub shared: Arc<Mutex<Shared>>,
    }

    impl FakeOpener {
        pub fn set(&self, path: &str, behavior: Behavior) {
            if let Behavior::Reply(replies) = &behavior {
                self.shared
                    .lock()
                    .replies
                    .insert(path.to_string(), replies.iter().copied().collect());
            }
            self.behaviors.lock().insert(path.to_string(), behavior);
        }

        pub fn written(&self) -> Vec<String> {
            self.shared.lock().written.clone()
        }

        pub fn opened(&self) -> Vec<String> {
            self.shared.lock().opened.clone()
        }

        pub fn closed(&self) -> Vec<String> {
            self.shared.lock().closed.clone()
        }
    }

    impl PortOpener for FakeOpener {
        fn open(&self, path: &str, _baud: u32, _timeout: Duration) -> Result<Box<dyn SerialLink>, SerialError> {
            let behavior = self.behaviors.lock().get(path).cloned();
            let broken = match behavior {
                Some(Behavior::Reply(_)) => false,
                Some(Behavior::BrokenWrite) => true,
                Some(Behavior::Fail(e)) => return Err(e),
                None => {
                    return Err(SerialError::OpenFailed {
                        port: path.to_string(),
                        message: format!("could not open port {}: No such file or directory", path),
                    })
                }
            };
            self.shared.lock().opened.push(path.to_string());
            let reply = self
                .shared
                .lock()
                .replies
                .get_mut(path)
                .and_then(|q| q.pop_front())
                .map(|r| r.as_bytes().to_vec())
                .unwrap_or_default();
            Ok(Box::new(FakeLink {
                path: path.to_string(),
                broken,
                pending: io::Cursor::new(reply),
                outgoing: Vec::new(),
                shared: Arc::clone(&self.shared),
            }))
        }
    }

    struct FakeLink {
        path: String,
        broken: bool,
        pending: io::Cursor<Vec<u8>>,
        outgoing: Vec<u8>,
        shared: Arc<Mutex<Shared>>,
    }

    impl Read for FakeLink {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.pending.read(buf)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "Operation timed out"));
            }
            Ok(n)
        }
    }

    impl Write for FakeLink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device disconnected"));
            }
            self.outgoing.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            let line = String::from_utf8_lossy(&self.outgoing).into_owned();
            if !line.is_empty() {
                self.shared.lock().written.push(line);
            }
            self.outgoing.clear();
            Ok(())
        }
    }

    impl SerialLink for FakeLink {
        fn clear_buffers(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::Unsupported, "not supported"))
        }
    }

    impl Drop for FakeLink {
        fn drop(&mut self) {
            self.shared.lock().closed.push(self.path.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{Behavior, FakeOpener};
    use super::*;
    use crate::serial::ports::fake::FakePorts;

    fn transport(ports: &FakePorts, opener: &FakeOpener) -> SerialTransport {
        SerialTransport::new(
            Arc::new(PortResolver::new(Box::new(ports.clone()))),
            Box::new(opener.clone()),
            SerialSettings::default(),
            Arc::new(Metrics::new()),
        )
    }

    #[test]
    fn exchange_writes_newline_terminated_line_and_trims_reply() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec!["OK 55\r\n"]));

        let res = transport(&ports, &opener).exchange(" 55 ", true, DEFAULT_TIMEOUT);

        assert!(res.ok);
        assert_eq!(res.port.as_deref(), Some("/dev/ttyACM0"));
        assert_eq!(res.echo, " 55 ");
        assert_eq!(res.reply.as_deref(), Some("OK 55"));
        assert_eq!(opener.written(), vec!["55\n".to_string()]);
        assert_eq!(opener.closed(), vec!["/dev/ttyACM0".to_string()]);
    }

    #[test]
    fn empty_reply_is_none() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec![]));

        let res = transport(&ports, &opener).exchange("PING", true, DEFAULT_TIMEOUT);
        assert!(res.ok);
        assert_eq!(res.reply, None);
    }

    #[test]
    fn no_reply_read_when_not_expected() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec!["ignored\n"]));

        let res = transport(&ports, &opener).exchange("40", false, DEFAULT_TIMEOUT);
        assert!(res.ok);
        assert_eq!(res.reply, None);
    }

    #[test]
    fn write_failure_is_reported_and_port_closed() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::BrokenWrite);

        let res = transport(&ports, &opener).exchange("40", true, DEFAULT_TIMEOUT);
        assert!(!res.ok);
        assert_eq!(res.error.as_deref(), Some("device disconnected"));
        assert_eq!(opener.closed(), vec!["/dev/ttyACM0".to_string()]);
    }

    #[test]
    fn open_falls_through_candidates_and_remembers_winner() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0", "/dev/ttyACM1"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM1", Behavior::Reply(vec![]));
        let transport = transport(&ports, &opener);

        let (_link, port) = transport.open(None, DEFAULT_TIMEOUT).unwrap();
        assert_eq!(port, "/dev/ttyACM1");
        assert_eq!(transport.resolver().last_good().as_deref(), Some("/dev/ttyACM1"));

        // a new device appearing does not steal the sticky choice
        ports.set_nodes(&["/dev/ttyACM0", "/dev/ttyACM1", "/dev/ttyUSB0"]);
        let candidates = transport.resolver().list_candidates();
        assert_eq!(transport.resolver().preferred(None, &candidates), "/dev/ttyACM1");
    }

    #[test]
    fn open_reports_last_error_or_no_ports() {
        let opener = FakeOpener::default();
        let empty = transport(&FakePorts::default(), &opener);
        assert_eq!(
            empty.open(None, DEFAULT_TIMEOUT).err(),
            Some(SerialError::NoPortsDetected)
        );

        let ports = FakePorts::with_nodes(&["/dev/ttyUSB0"]);
        opener.set(
            "/dev/ttyUSB0",
            Behavior::Fail(SerialError::OpenFailed {
                port: "/dev/ttyUSB0".into(),
                message: "Device or resource busy".into(),
            }),
        );
        let res = transport(&ports, &opener).exchange("PING", true, DEFAULT_TIMEOUT);
        assert!(!res.ok);
        assert_eq!(res.error.as_deref(), Some("Device or resource busy"));
    }

    #[test]
    fn explicit_console_port_is_skipped() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyS0", Behavior::Reply(vec![]));
        opener.set("/dev/ttyACM0", Behavior::Reply(vec![]));

        let (_link, port) = transport(&ports, &opener).open(Some("/dev/ttyS0"), DEFAULT_TIMEOUT).unwrap();
        assert_eq!(port, "/dev/ttyACM0");
        assert!(!opener.opened().contains(&"/dev/ttyS0".to_string()));
    }

    #[test]
    fn probe_writes_nothing() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        opener.set("/dev/ttyACM0", Behavior::Reply(vec!["PONG\n"]));
        let transport = transport(&ports, &opener);

        assert_eq!(transport.probe("/dev/ttyACM0", None), Probe::ok("ok"));
        assert!(opener.written().is_empty());
        assert_eq!(opener.closed().len(), 1);
        assert!(!transport.probe("", None).ok);
        assert_eq!(transport.probe("/dev/ttyS0", None).message, "not a USB CDC device");
    }

    #[test]
    fn probe_failure_counts_and_keeps_hint() {
        let ports = FakePorts::with_nodes(&["/dev/ttyACM0"]);
        let opener = FakeOpener::default();
        let denied = SerialError::PermissionDenied {
            port: "/dev/ttyACM0".into(),
            message: "Permission denied".into(),
        };
        opener.set("/dev/ttyACM0", Behavior::Fail(denied));
        let metrics = Arc::new(Metrics::new());
        let transport = SerialTransport::new(
            Arc::new(PortResolver::new(Box::new(ports))),
            Box::new(opener),
            SerialSettings::default(),
            Arc::clone(&metrics),
        );

        let probe = transport.probe("/dev/ttyACM0", None);
        assert!(!probe.ok);
        assert!(probe.message.contains("hint:"));
        assert_eq!(metrics.open_failures(), 1);
    }

    #[test]
    fn probe_retries_cu_alias() {
        let ports = FakePorts::default();
        *ports.present.lock() = vec!["/dev/cu.usbmodem101".to_string()];
        let opener = FakeOpener::default();
        opener.set("/dev/cu.usbmodem101", Behavior::Reply(vec![]));

        let probe = transport(&ports, &opener).probe("/dev/tty.usbmodem101", None);
        assert_eq!(probe, Probe::ok("ok (/dev/cu.usbmodem101)"));
    }
}

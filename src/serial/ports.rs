//! Serial port discovery and selection

use log::debug;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

/// Stable udev links, preferred over raw device nodes
pub const BY_ID_DIR: &str = "/dev/serial/by-id/";
/// Hardware console nodes, never a controller
pub const CONSOLE_PREFIX: &str = "/dev/ttyS";

const NODE_PREFIXES: [&str; 2] = ["/dev/ttyACM", "/dev/ttyUSB"];

/// USB descriptor details of a serial port
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsbInfo {
    pub device: String,
    pub vid: u16,
    pub pid: u16,
    pub manufacturer: Option<String>,
    pub product: Option<String>,
    pub serial_number: Option<String>,
}

/// Where candidate device paths come from
pub trait PortSource: Send + Sync {
    /// Entries of `/dev/serial/by-id`, sorted
    fn stable_links(&self) -> Vec<String>;
    /// `ttyACM*` then `ttyUSB*` nodes, each group sorted
    fn device_nodes(&self) -> Vec<String>;
    /// Ports reported by the platform enumerator
    fn enumerated(&self) -> Vec<String>;
    fn exists(&self, path: &str) -> bool;
    /// USB descriptor of `port`, when the platform knows it
    fn usb_info(&self, _port: &str) -> Option<UsbInfo> {
        None
    }
}

/// Ports of the running system, via globbing and `serialport`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPorts;

impl SystemPorts {
    fn glob_sorted(pattern: &str) -> Vec<String> {
        let mut found: Vec<String> = match glob::glob(pattern) {
            Ok(paths) => paths
                .flatten()
                .map(|p| p.to_string_lossy().into_owned())
                .collect(),
            Err(e) => {
                debug!("bad glob pattern {}: {}", pattern, e);
                Vec::new()
            }
        };
        found.sort();
        found
    }
}

impl PortSource for SystemPorts {
    fn stable_links(&self) -> Vec<String> {
        Self::glob_sorted(&format!("{}*", BY_ID_DIR))
    }

    fn device_nodes(&self) -> Vec<String> {
        NODE_PREFIXES
            .iter()
            .flat_map(|prefix| Self::glob_sorted(&format!("{}*", prefix)))
            .collect()
    }

    fn enumerated(&self) -> Vec<String> {
        match serialport::available_ports() {
            Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
            Err(e) => {
                debug!("serial port enumeration failed: {}", e);
                Vec::new()
            }
        }
    }

    fn exists(&self, path: &str) -> bool {
        Path::new(path).exists()
    }

    fn usb_info(&self, port: &str) -> Option<UsbInfo> {
        // by-id links resolve to the node the enumerator reports
        let resolved = std::fs::canonicalize(port)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|_| port.to_string());
        let ports = serialport::available_ports().ok()?;
        ports.into_iter().find_map(|p| {
            if p.port_name != port && p.port_name != resolved {
                return None;
            }
            match p.port_type {
                serialport::SerialPortType::UsbPort(usb) => Some(UsbInfo {
                    device: p.port_name,
                    vid: usb.vid,
                    pid: usb.pid,
                    manufacturer: usb.manufacturer,
                    product: usb.product,
                    serial_number: usb.serial_number,
                }),
                _ => None,
            }
        })
    }
}

/// True for the fixed hardware console nodes
pub fn is_console_port(path: &str) -> bool {
    path.starts_with(CONSOLE_PREFIX)
}

pub fn is_stable_link(path: &str) -> bool {
    path.contains("/serial/by-id/")
}

fn is_usb_serial(path: &str) -> bool {
    path.starts_with(BY_ID_DIR) || NODE_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Drop blanks and repeats, keeping the first occurrence
pub fn unique_order<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut seen = HashSet::new();
    items
        .into_iter()
        .map(Into::into)
        .filter(|p| !p.is_empty() && seen.insert(p.clone()))
        .collect()
}

/// Pick the port to talk to.
///
/// The last port that opened wins while it is still listed, then an
/// existing configured port, then the first stable link, then the first
/// candidate. Empty when nothing qualifies.
pub fn choose_preferred(
    last_good: Option<&str>,
    configured: Option<&str>,
    candidates: &[String],
    exists: impl Fn(&str) -> bool,
) -> String {
    if let Some(last) = last_good.filter(|l| candidates.iter().any(|c| c.as_str() == *l)) {
        return last.to_string();
    }
    if let Some(configured) = configured.filter(|c| !c.is_empty() && exists(c)) {
        return configured.to_string();
    }
    candidates
        .iter()
        .find(|c| is_stable_link(c))
        .or_else(|| candidates.first())
        .cloned()
        .unwrap_or_default()
}

/// Candidate listing plus the sticky last-good port
pub struct PortResolver {
    source: Box<dyn PortSource>,
    last_good: Mutex<Option<String>>,
}

impl PortResolver {
    pub fn new(source: Box<dyn PortSource>) -> Self {
        Self {
            source,
            last_good: Mutex::new(None),
        }
    }

    pub fn system() -> Self {
        Self::new(Box::new(SystemPorts))
    }

    /// Ordered, de-duplicated candidates, console nodes excluded
    pub fn list_candidates(&self) -> Vec<String> {
        let enumerated = self
            .source
            .enumerated()
            .into_iter()
            .filter(|p| is_usb_serial(p));
        let all = self
            .source
            .stable_links()
            .into_iter()
            .chain(self.source.device_nodes())
            .chain(enumerated)
            .filter(|p| !is_console_port(p));
        unique_order(all)
    }

    pub fn preferred(&self, configured: Option<&str>, candidates: &[String]) -> String {
        let last_good = self.last_good();
        choose_preferred(last_good.as_deref(), configured, candidates, |p| {
            self.source.exists(p)
        })
    }

    pub fn last_good(&self) -> Option<String> {
        self.last_good.lock().clone()
    }

    /// Remember a port that just opened
    pub fn remember(&self, port: &str) {
        if port.is_empty() || is_console_port(port) {
            return;
        }
        *self.last_good.lock() = Some(port.to_string());
    }

    pub fn exists(&self, path: &str) -> bool {
        self.source.exists(path)
    }

    pub fn usb_info(&self, port: &str) -> Option<UsbInfo> {
        if port.is_empty() {
            return None;
        }
        self.source.usb_info(port)
    }
}

#[cfg(test)]
pub(crate) mod fake {
    use super::PortSource;
    use parking_lot::Mutex;
    use std::sync::Arc;

    /// Port listing driven by the test
    #[derive(Clone, Default)]
    pub struct FakePorts {
        pub links: Arc<Mutex<Vec<String>>>,
        pub nodes: Arc<Mutex<Vec<String>>>,
        pub enumerated: Arc<Mutex<Vec<String>>>,
        pub present: Arc<Mutex<Vec<String>>>,
    }

    impl FakePorts {
        pub fn with_nodes(nodes: &[&str]) -> Self {
            let fake = Self::default();
            fake.set_nodes(nodes);
            fake
        }

        pub fn set_nodes(&self, nodes: &[&str]) {
            *self.nodes.lock() = nodes.iter().map(|s| s.to_string()).collect();
        }
    }

    impl PortSource for FakePorts {
        fn stable_links(&self) -> Vec<String> {
            self.links.lock().clone()
        }

        fn device_nodes(&self) -> Vec<String> {
            self.nodes.lock().clone()
        }

        fn enumerated(&self) -> Vec<String> {
            self.enumerated.lock().clone()
        }

        fn exists(&self, path: &str) -> bool {
            let listed = self.links.lock().iter().chain(self.nodes.lock().iter()).any(|p| p == path);
            listed || self.present.lock().iter().any(|p| p == path)
        }
    }
}

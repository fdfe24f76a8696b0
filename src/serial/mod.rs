//! Serial link to the fan controller

pub mod ports;
pub mod status;
pub mod transport;

pub use ports::{PortResolver, PortSource, SystemPorts, UsbInfo};
pub use status::{ConnectionState, ConnectionStatus, HealthCheck, ToolsReport};
pub use transport::{NativeOpener, PortOpener, SerialExchangeResult, SerialLink, SerialSettings, SerialTransport};

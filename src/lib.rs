//! fanbridge
//!
//! Maps drive temperatures to a fan duty and drives a USB serial fan
//! controller with it.

pub mod args;
pub mod auto_apply;
pub mod bridge;
pub mod client;
pub mod config;
pub mod curve;
pub mod daemon;
pub mod drives;
pub mod errors;
pub mod logging;
pub mod metrics;
pub mod serial;

// Re-export commonly used types
pub use auto_apply::{AutoApplyController, AutoApplyOutcome, AutoApplyState};
pub use bridge::{FanBridge, PollReport, StatusSnapshot};
pub use config::BridgeConfig;
pub use curve::{compute_recommended_duty, map_temperature_to_duty, ClassStats, CurveTable, OverridePolicy};
pub use drives::{DriveClass, DriveRecord, DriveSource};
pub use errors::{BridgeError, Result, SerialError};
pub use serial::{ConnectionState, SerialExchangeResult};

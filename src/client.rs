//! One-shot CLI commands printing JSON reports

use crate::{
    args::{ConfigCommands, SerialCommands},
    bridge::FanBridge,
    config::BridgeConfig,
    errors::{BridgeError, Result},
};
use log::{debug, info};
use serde::Serialize;
use serde_json::json;
use std::path::Path;

/// Commands answered by a running [`FanBridge`]
pub struct FanBridgeClient<'a> {
    bridge: &'a FanBridge,
}

impl<'a> FanBridgeClient<'a> {
    pub fn new(bridge: &'a FanBridge) -> Self {
        Self { bridge }
    }

    pub fn status(&self) -> Result<()> {
        debug!("Computing status");
        print_json(&self.bridge.compute_status())
    }

    pub fn handle_serial(&self, command: SerialCommands) -> Result<()> {
        match command {
            SerialCommands::Status => print_json(&self.bridge.get_connection_status(true)),
            SerialCommands::Ports => print_json(&self.bridge.list_ports()),
            SerialCommands::Tools => print_json(&self.bridge.tools_report()),
            SerialCommands::Send { line } => print_json(&self.bridge.send_raw_line(&line)),
            SerialCommands::Pwm { value } => print_json(&self.bridge.set_duty_percent(value)),
            SerialCommands::Metrics => {
                print!("{}", self.bridge.metrics().render_prometheus());
                Ok(())
            }
        }
    }
}

/// Config commands work on the file alone, without a running bridge
pub fn handle_config(command: ConfigCommands, path: &Path) -> Result<()> {
    match command {
        ConfigCommands::Show => {
            let mut config = if path.exists() {
                BridgeConfig::load_from_file(path)?
            } else {
                BridgeConfig::default()
            };
            config.apply_env_overrides();
            print_json(&config)
        }
        ConfigCommands::Validate => {
            BridgeConfig::load_from_file(path)?;
            print_json(&json!({ "ok": true, "path": path.display().to_string() }))
        }
        ConfigCommands::Init { force } => {
            if path.exists() && !force {
                return Err(BridgeError::Config(format!(
                    "{} already exists (use --force to overwrite)",
                    path.display()
                )));
            }
            BridgeConfig::default().save(path)?;
            info!("Wrote default configuration to {}", path.display());
            print_json(&json!({ "ok": true, "path": path.display().to_string() }))
        }
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

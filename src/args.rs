//! Command line argument parsing for fanbridge

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Drive temperature to fan PWM bridge
///
/// Reads drive temperatures, maps them through per-class fan curves and
/// drives a USB serial fan controller.
#[derive(Parser)]
#[command(name = "fanbridge")]
#[command(about = "Drive temperature to fan PWM bridge")]
#[command(version)]
pub struct Args {
    /// Increase verbosity (can be used multiple times)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Configuration file (defaults to $FANBRIDGE_CONFIG or /config/config.json)
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the polling daemon
    Daemon,
    /// Drive temperatures and the recommended duty
    Status,
    /// Serial controller commands
    Serial {
        #[command(subcommand)]
        command: SerialCommands,
    },
    /// Configuration file management
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Subcommand)]
pub enum SerialCommands {
    /// Connection status with all candidate ports
    Status,
    /// Discovered ports and their USB details
    Ports,
    /// Status, ping, version and USB details
    Tools,
    /// Send one raw line and print the reply
    Send {
        /// Line to send, without the newline
        line: String,
    },
    /// Set the fan duty in percent (clamped to 0-100)
    Pwm {
        #[arg(allow_negative_numbers = true)]
        value: i64,
    },
    /// Serial counters in Prometheus text format
    Metrics,
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,
    /// Check the configuration file
    Validate,
    /// Write the default configuration
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negative_pwm_values_parse() {
        let args = Args::try_parse_from(["fanbridge", "serial", "pwm", "-5"]).unwrap();
        match args.command {
            Commands::Serial {
                command: SerialCommands::Pwm { value },
            } => assert_eq!(value, -5),
            _ => panic!("expected serial pwm"),
        }
    }

    #[test]
    fn global_flags_follow_subcommands() {
        let args = Args::try_parse_from(["fanbridge", "status", "-vv", "--config", "/tmp/c.json"]).unwrap();
        assert_eq!(args.verbose, 2);
        assert_eq!(args.config, Some(PathBuf::from("/tmp/c.json")));
    }
}

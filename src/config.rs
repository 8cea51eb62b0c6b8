//! # Configuration
//!
//! Runtime knobs come from environment variables with matching CLI flags
//! layered on top (flags win). Everything has a default, so a bare
//! `m8-bridge` starts a fully functional gateway.
//!
//! | env | flag | default |
//! |-----|------|---------|
//! | `M8_HTTP_PORT` | `-h, --http-port` | 8080 |
//! | `M8_TCP_PORT` | `-t, --tcp-port` | 3333 (0 disables) |
//! | `M8_SERIAL_PORT` | `-p, --port` | auto-detect |
//! | `M8_BAUD` | `--baud` | 115200 |
//! | `M8_AUTO_RECONNECT` | `--auto-reconnect` | true |
//! | `M8_RECONNECT_INTERVAL_MS` | `--reconnect-interval-ms` | 1000 |
//! | `M8_AUDIO` | `--audio` | true |
//! | `M8_AUDIO_HELPER` | `--audio-helper` | `m8-audio-capture` |
//! | `M8_LOG` | `-l, --log-level` | info |
//!
//! The usual `-h` shorthand belongs to the HTTP port here, so help is
//! `--help` only.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

use crate::serial::{RecoveryConfig, SerialLinkConfig};

/// Command line for the gateway binary.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "m8-bridge",
    version,
    about = "Remote-access gateway for the Dirtywave M8 tracker",
    disable_help_flag = true
)]
pub struct Cli {
    /// Serial port path; set, it skips USB vendor/product auto-detection
    #[arg(short = 'p', long = "port", env = "M8_SERIAL_PORT")]
    pub serial_port: Option<String>,

    /// HTTP port for the REST API and WebSocket channels
    #[arg(short = 'h', long = "http-port", env = "M8_HTTP_PORT", default_value_t = 8080)]
    pub http_port: u16,

    /// TCP broadcaster port; 0 disables the raw proxy
    #[arg(short = 't', long = "tcp-port", env = "M8_TCP_PORT", default_value_t = 3333)]
    pub tcp_port: u16,

    /// Serial baud rate
    #[arg(long = "baud", env = "M8_BAUD", default_value_t = 115_200)]
    pub baud: u32,

    /// Rescan for the device after a disconnect
    #[arg(
        long = "auto-reconnect",
        env = "M8_AUTO_RECONNECT",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub auto_reconnect: bool,

    /// Reconnect scan period in milliseconds
    #[arg(
        long = "reconnect-interval-ms",
        env = "M8_RECONNECT_INTERVAL_MS",
        default_value_t = 1000
    )]
    pub reconnect_interval_ms: u64,

    /// Run the audio capture pipeline
    #[arg(
        long = "audio",
        env = "M8_AUDIO",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub audio: bool,

    /// Audio capture helper binary
    #[arg(long = "audio-helper", env = "M8_AUDIO_HELPER")]
    pub audio_helper: Option<PathBuf>,

    /// Log verbosity (error, warn, info, debug, trace)
    #[arg(short = 'l', long = "log-level", env = "M8_LOG", default_value = "info")]
    pub log_level: String,

    /// Print help
    #[arg(long = "help", action = clap::ArgAction::Help)]
    help: Option<bool>,
}

/// Resolved gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub tcp_port: u16,
    pub serial_port: Option<String>,
    pub baud: u32,
    pub auto_reconnect: bool,
    pub reconnect_interval: Duration,
    pub audio: bool,
    pub audio_helper: Option<PathBuf>,
    pub log_level: String,
}

impl From<Cli> for Config {
    fn from(cli: Cli) -> Self {
        Config {
            http_port: cli.http_port,
            tcp_port: cli.tcp_port,
            serial_port: cli.serial_port,
            baud: cli.baud,
            auto_reconnect: cli.auto_reconnect,
            reconnect_interval: Duration::from_millis(cli.reconnect_interval_ms.max(100)),
            audio: cli.audio,
            audio_helper: cli.audio_helper,
            log_level: cli.log_level,
        }
    }
}

impl Config {
    /// Parses the process arguments and environment.
    pub fn load() -> Config {
        Cli::parse().into()
    }

    /// The serial-link slice of the configuration.
    pub fn link_config(&self) -> SerialLinkConfig {
        SerialLinkConfig {
            path: self.serial_port.clone(),
            baud: self.baud,
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: self.reconnect_interval,
            recovery: RecoveryConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Config {
        Cli::try_parse_from(std::iter::once("m8-bridge").chain(args.iter().copied()))
            .unwrap()
            .into()
    }

    #[test]
    fn defaults_match_the_interface_table() {
        let cfg = parse(&[]);
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.tcp_port, 3333);
        assert_eq!(cfg.baud, 115_200);
        assert!(cfg.auto_reconnect);
        assert_eq!(cfg.reconnect_interval, Duration::from_millis(1000));
        assert!(cfg.audio);
        assert_eq!(cfg.serial_port, None);
        assert_eq!(cfg.log_level, "info");
    }

    #[test]
    fn short_flags_mirror_the_env() {
        let cfg = parse(&[
            "-p",
            "/dev/ttyACM1",
            "-h",
            "9090",
            "-t",
            "0",
            "-l",
            "debug",
        ]);
        assert_eq!(cfg.serial_port.as_deref(), Some("/dev/ttyACM1"));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.tcp_port, 0);
        assert_eq!(cfg.log_level, "debug");
    }

    #[test]
    fn booleans_take_explicit_values() {
        let cfg = parse(&["--auto-reconnect", "false", "--audio", "false"]);
        assert!(!cfg.auto_reconnect);
        assert!(!cfg.audio);
    }

    #[test]
    fn reconnect_interval_has_a_sane_floor() {
        let cfg = parse(&["--reconnect-interval-ms", "1"]);
        assert_eq!(cfg.reconnect_interval, Duration::from_millis(100));
    }
}

//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `MODEMCTL_TRANSPORT`, `MODEMCTL_ADDRESS`,
//!    `MODEMCTL_SERIAL_DEVICE`
//! 2. **Config file**: path via `--config <path>`, or `modemctl.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [modem]
//! transport = "tcp"                 # "tcp" or "serial"
//! address = "192.168.225.1:5000"    # tcp only
//! serial_device = "/dev/ttyUSB2"    # serial only
//! baud = 115200
//! connect_timeout_ms = 5000
//! max_connect_attempts = 5
//! reconnect_delay_ms = 500          # initial backoff, doubles per attempt
//! reconnect_max_delay_ms = 30000
//! faulted_retry_secs = 30           # pause between rounds once faulted
//!
//! [dispatcher]
//! command_timeout_ms = 5000
//! long_command_timeout_secs = 300
//! max_consecutive_failures = 3
//! queue_depth = 32
//! stale_drain_ms = 250
//! init_commands = ["ATE0"]
//!
//! [monitor]
//! enabled = true
//! interval_secs = 10
//!
//! [scan]
//! init_commands = ["AT", "ATE0", "AT+CMEE=1", "AT+CFUN=1"]
//! init_attempts = 3
//! init_retry_delay_ms = 2000
//! detach_command = "AT+COPS=2"
//! scan_command = "AT+QSCAN=3,1"
//! attach_command = "AT+COPS=0"
//! timeout_secs = 300
//!
//! [logging]
//! level = "info"
//! ```

use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::channel::ChannelConfig;
use crate::command::at;
use crate::dispatcher::DispatcherConfig;
use crate::scan::ScanConfig;

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "modemctl.toml";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },

    #[error("invalid value for {key}: {value:?}")]
    Env { key: &'static str, value: String },
}

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub modem: ModemConfig,
    #[serde(default)]
    pub dispatcher: DispatcherSection,
    #[serde(default)]
    pub monitor: MonitorConfig,
    #[serde(default)]
    pub scan: ScanSection,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// How the AT port is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// AT port bridged to a TCP socket.
    #[default]
    Tcp,
    /// Local tty.
    Serial,
}

impl FromStr for Transport {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(Self::Tcp),
            "serial" => Ok(Self::Serial),
            other => Err(other.to_string()),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tcp => "tcp",
            Self::Serial => "serial",
        })
    }
}

/// Channel endpoint and reconnect policy.
#[derive(Debug, Clone, Deserialize)]
pub struct ModemConfig {
    /// `tcp` or `serial` (default `tcp`). Override with `MODEMCTL_TRANSPORT`.
    #[serde(default)]
    pub transport: Transport,
    /// `host:port` of the AT bridge. Override with `MODEMCTL_ADDRESS`.
    #[serde(default = "default_address")]
    pub address: String,
    /// tty of the AT port. Override with `MODEMCTL_SERIAL_DEVICE`.
    #[serde(default = "default_serial_device")]
    pub serial_device: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,
    /// Initial reconnect backoff in milliseconds (default 500).
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Backoff ceiling in milliseconds (default 30 000).
    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,
    /// Seconds between reconnect rounds after the channel faults (default 30).
    #[serde(default = "default_faulted_retry_secs")]
    pub faulted_retry_secs: u64,
}

/// Command queue settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DispatcherSection {
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_long_command_timeout_secs")]
    pub long_command_timeout_secs: u64,
    /// Timeouts in a row before the channel is reconnected (default 3).
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u32,
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    /// Grace period for swallowing a late reply after a timeout.
    #[serde(default = "default_stale_drain_ms")]
    pub stale_drain_ms: u64,
    /// Sent after every (re)connect (default `["ATE0"]`).
    #[serde(default = "default_dispatcher_init")]
    pub init_commands: Vec<String>,
}

/// Background polling.
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Start polling at startup (default false).
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,
}

/// Cell scan workflow.
#[derive(Debug, Clone, Deserialize)]
pub struct ScanSection {
    #[serde(default = "default_scan_init")]
    pub init_commands: Vec<String>,
    #[serde(default = "default_init_attempts")]
    pub init_attempts: u32,
    #[serde(default = "default_init_retry_delay_ms")]
    pub init_retry_delay_ms: u64,
    #[serde(default = "default_detach_command")]
    pub detach_command: String,
    #[serde(default = "default_detach_timeout_secs")]
    pub detach_timeout_secs: u64,
    #[serde(default = "default_scan_command")]
    pub scan_command: String,
    /// Scan command timeout in seconds (default 300).
    #[serde(default = "default_scan_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_attach_command")]
    pub attach_command: String,
    #[serde(default = "default_attach_timeout_secs")]
    pub attach_timeout_secs: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_address() -> String {
    "192.168.225.1:5000".to_string()
}
fn default_serial_device() -> String {
    "/dev/ttyUSB2".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_connect_timeout_ms() -> u64 {
    5000
}
fn default_max_connect_attempts() -> u32 {
    5
}
fn default_reconnect_delay_ms() -> u64 {
    500
}
fn default_reconnect_max_delay_ms() -> u64 {
    30_000
}
fn default_faulted_retry_secs() -> u64 {
    30
}
fn default_command_timeout_ms() -> u64 {
    5000
}
fn default_long_command_timeout_secs() -> u64 {
    300
}
fn default_max_consecutive_failures() -> u32 {
    3
}
fn default_queue_depth() -> usize {
    32
}
fn default_stale_drain_ms() -> u64 {
    250
}
fn default_dispatcher_init() -> Vec<String> {
    vec![at::ECHO_OFF.to_string()]
}
fn default_monitor_interval_secs() -> u64 {
    10
}
fn default_scan_init() -> Vec<String> {
    ScanConfig::default().init_commands
}
fn default_init_attempts() -> u32 {
    3
}
fn default_init_retry_delay_ms() -> u64 {
    2000
}
fn default_detach_command() -> String {
    "AT+COPS=2".to_string()
}
fn default_detach_timeout_secs() -> u64 {
    30
}
fn default_scan_command() -> String {
    "AT+QSCAN=3,1".to_string()
}
fn default_scan_timeout_secs() -> u64 {
    300
}
fn default_attach_command() -> String {
    "AT+COPS=0".to_string()
}
fn default_attach_timeout_secs() -> u64 {
    180
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ModemConfig {
    fn default() -> Self {
        Self {
            transport: Transport::default(),
            address: default_address(),
            serial_device: default_serial_device(),
            baud: default_baud(),
            connect_timeout_ms: default_connect_timeout_ms(),
            max_connect_attempts: default_max_connect_attempts(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            reconnect_max_delay_ms: default_reconnect_max_delay_ms(),
            faulted_retry_secs: default_faulted_retry_secs(),
        }
    }
}

impl Default for DispatcherSection {
    fn default() -> Self {
        Self {
            command_timeout_ms: default_command_timeout_ms(),
            long_command_timeout_secs: default_long_command_timeout_secs(),
            max_consecutive_failures: default_max_consecutive_failures(),
            queue_depth: default_queue_depth(),
            stale_drain_ms: default_stale_drain_ms(),
            init_commands: default_dispatcher_init(),
        }
    }
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_secs: default_monitor_interval_secs(),
        }
    }
}

impl Default for ScanSection {
    fn default() -> Self {
        Self {
            init_commands: default_scan_init(),
            init_attempts: default_init_attempts(),
            init_retry_delay_ms: default_init_retry_delay_ms(),
            detach_command: default_detach_command(),
            detach_timeout_secs: default_detach_timeout_secs(),
            scan_command: default_scan_command(),
            timeout_secs: default_scan_timeout_secs(),
            attach_command: default_attach_command(),
            attach_timeout_secs: default_attach_timeout_secs(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist. Otherwise `modemctl.toml` in
    /// the current directory is used when present, falling back to defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => {
                Self::from_file(DEFAULT_CONFIG_FILE)?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Env var overrides, read through `lookup`.
    fn apply_env(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        if let Some(transport) = lookup("MODEMCTL_TRANSPORT") {
            self.modem.transport =
                transport
                    .parse()
                    .map_err(|value| ConfigError::Env {
                        key: "MODEMCTL_TRANSPORT",
                        value,
                    })?;
        }
        if let Some(address) = lookup("MODEMCTL_ADDRESS") {
            self.modem.address = address;
        }
        if let Some(device) = lookup("MODEMCTL_SERIAL_DEVICE") {
            self.modem.serial_device = device;
        }
        Ok(())
    }

    pub fn channel_config(&self) -> ChannelConfig {
        ChannelConfig {
            max_attempts: self.modem.max_connect_attempts,
            initial_backoff: Duration::from_millis(self.modem.reconnect_delay_ms),
            max_backoff: Duration::from_millis(self.modem.reconnect_max_delay_ms),
        }
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        let d = &self.dispatcher;
        DispatcherConfig {
            command_timeout: Duration::from_millis(d.command_timeout_ms),
            long_command_timeout: Duration::from_secs(d.long_command_timeout_secs),
            max_consecutive_failures: d.max_consecutive_failures,
            queue_depth: d.queue_depth,
            stale_drain: Duration::from_millis(d.stale_drain_ms),
            faulted_retry_interval: Duration::from_secs(self.modem.faulted_retry_secs),
            init_commands: d.init_commands.clone(),
        }
    }

    pub fn scan_config(&self) -> ScanConfig {
        let s = &self.scan;
        ScanConfig {
            init_commands: s.init_commands.clone(),
            init_attempts: s.init_attempts,
            init_retry_delay: Duration::from_millis(s.init_retry_delay_ms),
            init_timeout: Duration::from_millis(self.dispatcher.command_timeout_ms),
            detach_command: s.detach_command.clone(),
            detach_timeout: Duration::from_secs(s.detach_timeout_secs),
            scan_command: s.scan_command.clone(),
            scan_timeout: Duration::from_secs(s.timeout_secs),
            attach_command: s.attach_command.clone(),
            attach_timeout: Duration::from_secs(s.attach_timeout_secs),
        }
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor.interval_secs.max(1))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.modem.connect_timeout_ms)
    }
}

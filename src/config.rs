//! Relay configuration using Figment
//!
//! Configuration is layered, later sources winning:
//! 1. Built-in defaults (the reference deployment)
//! 2. A TOML file (`config/relay.toml` unless given on the command line)
//! 3. Environment variables prefixed `SOIL_RELAY_`, nested keys split on `__`
//!
//! # Example
//! ```no_run
//! use soil_relay::config::RelayConfig;
//!
//! let config = RelayConfig::load()?;
//! println!("Logger socket: {}", config.streams.logger_socket.display());
//! # Ok::<(), soil_relay::error::RelayError>(())
//! ```

use crate::error::{RelayError, RelayResult};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "config/relay.toml";

/// Environment variable prefix.
pub const ENV_PREFIX: &str = "SOIL_RELAY_";

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Application settings
    #[serde(default)]
    pub application: ApplicationConfig,
    /// Stream endpoints and decoding
    #[serde(default)]
    pub streams: StreamConfig,
    /// Cycle completion thresholds
    #[serde(default)]
    pub cycle: CycleConfig,
    /// Payload transport selection
    #[serde(default)]
    pub transport: TransportConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
    /// Log output format (pretty, compact, json)
    #[serde(default = "default_log_format")]
    pub log_format: String,
    /// Log span open/close events
    #[serde(default)]
    pub log_span_events: bool,
    /// ANSI colors in pretty output
    #[serde(default = "default_true")]
    pub log_ansi: bool,
}

/// Stream endpoint configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Socket the RocketLogger producer connects to once per cycle
    pub logger_socket: PathBuf,
    /// Socket the TEROS producer keeps connected
    pub soil_socket: PathBuf,
    /// Leading rows of each logger connection that carry no data
    pub logger_header_rows: u64,
    /// Leading rows of each soil connection that carry no data
    pub soil_header_rows: u64,
    /// Bytes requested per non-blocking read
    pub read_buffer_bytes: usize,
    /// Largest field the decoder will assemble
    pub max_field_bytes: usize,
    /// Scheduling tick in milliseconds
    pub poll_interval_ms: u64,
    /// Reads per endpoint per tick before yielding to the other stream
    #[serde(default = "default_reads_per_tick")]
    pub reads_per_tick: usize,
}

/// Cycle completion configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CycleConfig {
    /// Post-header logger rows required before a cycle can complete
    pub min_logger_samples: u64,
    /// Post-header soil rows required before a cycle can complete
    pub min_soil_rows: u64,
    /// Terminate the process when a payload cannot be delivered
    #[serde(default)]
    pub send_failure_fatal: bool,
}

/// Which sink receives the combined record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// LoRa modem over a serial AT control channel
    Radio,
    /// HTTP POST to a fixed endpoint
    Network,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Selected sink
    pub kind: TransportKind,
    /// Radio settings, required when `kind = "radio"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub radio: Option<RadioConfig>,
    /// Network settings, required when `kind = "network"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<NetworkConfig>,
}

/// LoRa modem configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RadioConfig {
    /// Serial port path (e.g. "/dev/ttyO2")
    pub port: String,
    /// Baud rate
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// Largest payload the control channel accepts
    #[serde(default = "default_max_payload")]
    pub max_payload_len: usize,
    /// LoRaWAN data rate (0-15)
    #[serde(default = "default_data_rate")]
    pub data_rate: u8,
    /// Optional channel plan, sent as `AT+CH=NUM,<plan>`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_plan: Option<String>,
    /// Response timeout in milliseconds
    #[serde(default = "default_serial_timeout")]
    pub response_timeout_ms: u64,
    /// Pause between consecutive AT commands in milliseconds
    #[serde(default = "default_settle")]
    pub command_settle_ms: u64,
    /// Time allowed for an uplink to report `Done`, in milliseconds
    #[serde(default = "default_uplink_timeout")]
    pub uplink_timeout_ms: u64,
}

/// HTTP egress configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Destination URL
    pub endpoint: String,
    /// Device name sent with every payload
    pub device_name: String,
    /// Group name sent with every payload
    pub group_name: String,
    /// Request timeout in milliseconds
    #[serde(default = "default_request_timeout")]
    pub timeout_ms: u64,
}

// Default value functions
fn default_log_format() -> String {
    "pretty".to_string()
}

fn default_true() -> bool {
    true
}

fn default_reads_per_tick() -> usize {
    16
}

fn default_uplink_timeout() -> u64 {
    10_000
}

fn default_baud_rate() -> u32 {
    9600
}

fn default_max_payload() -> usize {
    53
}

fn default_data_rate() -> u8 {
    2
}

fn default_serial_timeout() -> u64 {
    1000
}

fn default_settle() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    5000
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "soil-relay".to_string(),
            log_level: "info".to_string(),
            log_format: default_log_format(),
            log_span_events: false,
            log_ansi: true,
        }
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            logger_socket: PathBuf::from("/tmp/rlstream.socket"),
            soil_socket: PathBuf::from("/tmp/teros.socket"),
            logger_header_rows: 11,
            soil_header_rows: 1,
            read_buffer_bytes: 1024,
            max_field_bytes: 1024,
            poll_interval_ms: 10,
            reads_per_tick: default_reads_per_tick(),
        }
    }
}

impl Default for CycleConfig {
    fn default() -> Self {
        Self {
            min_logger_samples: 500,
            min_soil_rows: 1,
            send_failure_fatal: false,
        }
    }
}

impl Default for RadioConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyO2".to_string(),
            baud_rate: default_baud_rate(),
            max_payload_len: default_max_payload(),
            data_rate: default_data_rate(),
            channel_plan: Some("8-15,64".to_string()),
            response_timeout_ms: default_serial_timeout(),
            command_settle_ms: default_settle(),
            uplink_timeout_ms: default_uplink_timeout(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            kind: TransportKind::Radio,
            radio: Some(RadioConfig::default()),
            network: None,
        }
    }
}

impl RelayConfig {
    /// Load configuration from the default file and environment variables
    pub fn load() -> RelayResult<Self> {
        Self::load_from(DEFAULT_CONFIG_PATH)
    }

    /// Load configuration from a specific file path
    ///
    /// A missing file is not an error; defaults and environment still apply.
    pub fn load_from<P: AsRef<Path>>(path: P) -> RelayResult<Self> {
        Self::figment(path.as_ref()).extract().map_err(RelayError::from)
    }

    /// The layered provider chain, exposed for inspection and testing
    pub fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(RelayConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> RelayResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.to_lowercase().as_str()) {
            return Err(RelayError::Configuration(format!(
                "Invalid log_level '{}'. Must be one of: {}",
                self.application.log_level,
                valid_levels.join(", ")
            )));
        }

        let valid_formats = ["pretty", "compact", "json"];
        if !valid_formats.contains(&self.application.log_format.as_str()) {
            return Err(RelayError::Configuration(format!(
                "Invalid log_format '{}'. Must be one of: {}",
                self.application.log_format,
                valid_formats.join(", ")
            )));
        }

        if self.streams.logger_socket == self.streams.soil_socket {
            return Err(RelayError::Configuration(format!(
                "logger_socket and soil_socket must differ (both '{}')",
                self.streams.logger_socket.display()
            )));
        }
        if self.streams.read_buffer_bytes == 0 || self.streams.max_field_bytes == 0 {
            return Err(RelayError::Configuration(
                "read_buffer_bytes and max_field_bytes must be greater than 0".to_string(),
            ));
        }
        if self.streams.poll_interval_ms == 0 || self.streams.reads_per_tick == 0 {
            return Err(RelayError::Configuration(
                "poll_interval_ms and reads_per_tick must be greater than 0".to_string(),
            ));
        }

        if self.cycle.min_logger_samples == 0 {
            return Err(RelayError::Configuration(
                "min_logger_samples must be at least 1".to_string(),
            ));
        }
        if self.cycle.min_soil_rows == 0 {
            return Err(RelayError::Configuration(
                "min_soil_rows must be at least 1".to_string(),
            ));
        }

        match self.transport.kind {
            TransportKind::Radio => {
                let radio = self.transport.radio.as_ref().ok_or_else(|| {
                    RelayError::Configuration("transport.radio section is required".to_string())
                })?;
                if radio.port.is_empty() {
                    return Err(RelayError::Configuration(
                        "transport.radio.port must not be empty".to_string(),
                    ));
                }
                if radio.data_rate > 15 {
                    return Err(RelayError::Configuration(format!(
                        "Invalid data_rate {}. Must be 0-15",
                        radio.data_rate
                    )));
                }
                if radio.max_payload_len == 0 {
                    return Err(RelayError::Configuration(
                        "transport.radio.max_payload_len must be greater than 0".to_string(),
                    ));
                }
                if radio.response_timeout_ms == 0 || radio.uplink_timeout_ms == 0 {
                    return Err(RelayError::Configuration(
                        "transport.radio timeouts must be greater than 0".to_string(),
                    ));
                }
            }
            TransportKind::Network => {
                let network = self.transport.network.as_ref().ok_or_else(|| {
                    RelayError::Configuration("transport.network section is required".to_string())
                })?;
                if network.endpoint.is_empty() {
                    return Err(RelayError::Configuration(
                        "transport.network.endpoint must not be empty".to_string(),
                    ));
                }
                if network.device_name.is_empty() || network.group_name.is_empty() {
                    return Err(RelayError::Configuration(
                        "transport.network device_name and group_name are required".to_string(),
                    ));
                }
            }
        }

        Ok(())
    }
}

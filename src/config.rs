//! # Configuration Management
//!
//! Centralized configuration for connection managers, framing, pooling and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment variable overrides via `from_env()`
//!
//! ## Deployment Parameters
//! The `[framing]` section must be identical on both ends of a connection:
//! length and opcode field widths and the maximum frame size are part of the
//! wire format.

use crate::core::codec::FieldWidth;
use crate::core::packet::DEFAULT_WRITER_CAPACITY;
use crate::error::{ProtocolError, Result};
use crate::utils::pool::PoolSettings;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Default frame size limit; the largest frame a `u16` length field can describe
pub const MAX_FRAME_SIZE: usize = u16::MAX as usize;

/// Default interval between heartbeats (~30 ticks per second)
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(33);

/// Default bound on a graceful disconnect
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Main network configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Wire framing parameters
    #[serde(default)]
    pub framing: FramingConfig,

    /// Writer pool configuration
    #[serde(default)]
    pub pool: PoolConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(addr) = std::env::var("TICKWIRE_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("TICKWIRE_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(max) = std::env::var("TICKWIRE_MAX_CONNECTIONS") {
            if let Ok(val) = max.parse::<usize>() {
                config.server.max_connections = val;
            }
        }

        if let Ok(tick) = std::env::var("TICKWIRE_TICK_INTERVAL_MS") {
            if let Ok(val) = tick.parse::<u64>() {
                config.server.tick_interval = Duration::from_millis(val);
                config.client.tick_interval = Duration::from_millis(val);
            }
        }

        if let Ok(size) = std::env::var("TICKWIRE_MAX_FRAME_SIZE") {
            if let Ok(val) = size.parse::<usize>() {
                config.framing.max_frame_size = val;
            }
        }

        if let Ok(flag) = std::env::var("TICKWIRE_LEAK_DETECTION") {
            if let Ok(val) = flag.parse::<bool>() {
                config.pool.leak_detection = val;
            }
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.framing.validate());
        errors.extend(self.pool.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Checks shared by the server and client connection sections
fn validate_connection_limits(
    side: &str,
    shutdown_timeout: Duration,
    max_outbound_bytes: usize,
    read_chunk_size: usize,
    max_read_per_tick: usize,
    tick_interval: Duration,
) -> Vec<String> {
    let mut errors = Vec::new();

    if shutdown_timeout.as_millis() < 10 {
        errors.push(format!("{side} shutdown timeout too short (minimum: 10ms)"));
    } else if shutdown_timeout.as_secs() > 60 {
        errors.push(format!("{side} shutdown timeout too long (maximum: 60s)"));
    }

    if max_outbound_bytes == 0 {
        errors.push(format!("{side} max outbound bytes must be greater than 0"));
    }

    if read_chunk_size == 0 {
        errors.push(format!("{side} read chunk size must be greater than 0"));
    } else if read_chunk_size > 1024 * 1024 {
        errors.push(format!(
            "{side} read chunk size too large: {read_chunk_size} (maximum: 1 MB)"
        ));
    }

    if max_read_per_tick < read_chunk_size {
        errors.push(format!(
            "{side} max read per tick must be at least the read chunk size"
        ));
    }

    if tick_interval.is_zero() {
        errors.push(format!("{side} tick interval must be greater than 0"));
    } else if tick_interval.as_secs() > 1 {
        errors.push(format!("{side} tick interval too long (maximum: 1s)"));
    }

    errors
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:7000")
    pub address: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Bound on the Disconnecting -> Disconnected transition
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Per-connection cap on queued outbound bytes
    pub max_outbound_bytes: usize,

    /// Bytes requested per non-blocking read
    pub read_chunk_size: usize,

    /// Bytes read from one connection in one heartbeat before moving on
    pub max_read_per_tick: usize,

    /// Interval between heartbeats when driven by the async driver
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7000"),
            max_connections: 1000,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_outbound_bytes: 1024 * 1024,
            read_chunk_size: 4096,
            max_read_per_tick: 64 * 1024,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:7000')",
                self.address
            ));
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors.extend(validate_connection_limits(
            "Server",
            self.shutdown_timeout,
            self.max_outbound_bytes,
            self.read_chunk_size,
            self.max_read_per_tick,
            self.tick_interval,
        ));

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Timeout for the blocking TCP connect
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Bound on the Disconnecting -> Disconnected transition
    #[serde(with = "duration_serde")]
    pub shutdown_timeout: Duration,

    /// Cap on queued outbound bytes
    pub max_outbound_bytes: usize,

    /// Bytes requested per non-blocking read
    pub read_chunk_size: usize,

    /// Bytes read in one heartbeat before yielding
    pub max_read_per_tick: usize,

    /// Interval between heartbeats when driven by the async driver
    #[serde(with = "duration_serde")]
    pub tick_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:7000"),
            connection_timeout: Duration::from_secs(5),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
            max_outbound_bytes: 256 * 1024,
            read_chunk_size: 4096,
            max_read_per_tick: 64 * 1024,
            tick_interval: DEFAULT_TICK_INTERVAL,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '10.0.0.5:7000')",
                self.address
            ));
        }

        if self.connection_timeout.as_millis() < 100 {
            errors.push("Connection timeout too short (minimum: 100ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        errors.extend(validate_connection_limits(
            "Client",
            self.shutdown_timeout,
            self.max_outbound_bytes,
            self.read_chunk_size,
            self.max_read_per_tick,
            self.tick_interval,
        ));

        errors
    }
}

/// Wire framing parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FramingConfig {
    /// Width of the frame length field
    pub length_width: FieldWidth,

    /// Width of the opcode field
    pub opcode_width: FieldWidth,

    /// Largest accepted frame, header included
    pub max_frame_size: usize,

    /// Tear the connection down on an unregistered opcode instead of dropping the frame
    pub disconnect_on_unknown_opcode: bool,
}

impl Default for FramingConfig {
    fn default() -> Self {
        Self {
            length_width: FieldWidth::U16,
            opcode_width: FieldWidth::U16,
            max_frame_size: MAX_FRAME_SIZE,
            disconnect_on_unknown_opcode: false,
        }
    }
}

impl FramingConfig {
    /// Validate framing configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        let header = self.length_width.bytes() + self.opcode_width.bytes();

        if self.max_frame_size <= header {
            errors.push(format!(
                "Max frame size too small: {} (must exceed the {header}-byte header)",
                self.max_frame_size
            ));
        }

        if self.max_frame_size as u64 > self.length_width.max_value() {
            errors.push(format!(
                "Max frame size {} not representable by a {:?} length field",
                self.max_frame_size, self.length_width
            ));
        }

        if self.max_frame_size > 16 * 1024 * 1024 {
            errors.push(format!(
                "Max frame size too large: {} bytes (maximum recommended: 16 MB)",
                self.max_frame_size
            ));
        }

        errors
    }
}

/// Writer pool configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PoolConfig {
    /// Writers constructed up front
    pub initial_size: usize,

    /// Upper bound on live writers; 0 lets the pool grow without limit
    pub max_size: usize,

    /// Initial byte capacity of each writer
    pub writer_capacity: usize,

    /// Track checkout times and report writers held too long
    pub leak_detection: bool,

    /// How long a writer may stay checked out before it is reported
    #[serde(with = "duration_serde")]
    pub leak_threshold: Duration,

    /// How often the connection manager sweeps for leaks
    #[serde(with = "duration_serde")]
    pub leak_sweep_interval: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 32,
            max_size: 0,
            writer_capacity: DEFAULT_WRITER_CAPACITY,
            leak_detection: cfg!(debug_assertions),
            leak_threshold: Duration::from_secs(5),
            leak_sweep_interval: Duration::from_secs(1),
        }
    }
}

impl PoolConfig {
    /// Settings for the generic object pool
    pub fn to_settings(&self) -> PoolSettings {
        PoolSettings {
            initial_size: self.initial_size,
            max_size: (self.max_size > 0).then_some(self.max_size),
            leak_threshold: self.leak_detection.then_some(self.leak_threshold),
        }
    }

    /// Validate pool configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.max_size > 0 && self.initial_size > self.max_size {
            errors.push(format!(
                "Initial pool size {} exceeds max pool size {}",
                self.initial_size, self.max_size
            ));
        }

        if self.writer_capacity == 0 {
            errors.push("Writer capacity must be greater than 0".to_string());
        } else if self.writer_capacity > 64 * 1024 {
            errors.push(format!(
                "Writer capacity too large: {} (maximum: 64 KB)",
                self.writer_capacity
            ));
        }

        if self.leak_detection {
            if self.leak_threshold.as_millis() < 10 {
                errors.push("Leak threshold too short (minimum: 10ms)".to_string());
            }
            if self.leak_sweep_interval.is_zero() {
                errors.push("Leak sweep interval must be greater than 0".to_string());
            }
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("tickwire"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = std::path::Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

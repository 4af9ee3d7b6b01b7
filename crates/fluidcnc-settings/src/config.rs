//! Configuration for the FluidCNC machine link
//!
//! Provides configuration file handling and validation. Supports JSON and
//! TOML file formats stored in platform-specific directories.
//!
//! Configuration is organized into logical sections:
//! - Connection settings (transport kind, URL/port, baud)
//! - Streaming (receive-buffer budget, command timeouts)
//! - Supervisor (reconnect backoff, heartbeat, watchdog, status polling)
//! - Offline queue
//! - Safety (e-stop lockout, soft limits)
//! - Persistence (machine snapshot)

use fluidcnc_core::{Axis, TransportKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{ConfigError, SettingsResult};

/// Connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Transport to use
    pub transport: TransportKind,
    /// WebSocket bridge URL
    pub websocket_url: String,
    /// Serial port path
    pub serial_port: String,
    /// Baud rate for serial connections
    pub baud_rate: u32,
    /// Connection timeout in milliseconds
    pub connect_timeout_ms: u64,
    /// Auto-reconnect on unclean loss (WebSocket only)
    pub auto_reconnect: bool,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            transport: TransportKind::WebSocket,
            websocket_url: "ws://localhost:8080/ws".to_string(),
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115200,
            connect_timeout_ms: 5000,
            auto_reconnect: true,
        }
    }
}

impl ConnectionSettings {
    /// The endpoint for the configured transport
    pub fn endpoint(&self) -> &str {
        match self.transport {
            TransportKind::WebSocket => &self.websocket_url,
            TransportKind::Serial => &self.serial_port,
            TransportKind::Simulated => "simulated",
        }
    }

    /// Connection timeout
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

/// Streaming and correlation settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingSettings {
    /// Size of the firmware serial receive buffer in bytes
    pub rx_buffer_size: usize,
    /// Default `send_and_wait` timeout in milliseconds
    pub command_timeout_ms: u64,
    /// Timeout for homing and probing in milliseconds
    pub long_command_timeout_ms: u64,
    /// Delay between feed hold and soft reset on stop
    pub stop_settle_ms: u64,
}

impl Default for StreamingSettings {
    fn default() -> Self {
        Self {
            rx_buffer_size: 128,
            command_timeout_ms: 30_000,
            long_command_timeout_ms: 120_000,
            stop_settle_ms: 100,
        }
    }
}

impl StreamingSettings {
    /// Default command timeout
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Homing/probe timeout
    pub fn long_command_timeout(&self) -> Duration {
        Duration::from_millis(self.long_command_timeout_ms)
    }

    /// Stop settle delay
    pub fn stop_settle(&self) -> Duration {
        Duration::from_millis(self.stop_settle_ms)
    }
}

/// Reconnect, heartbeat and watchdog settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// First reconnect delay
    pub reconnect_base_ms: u64,
    /// Backoff multiplier
    pub reconnect_multiplier: f64,
    /// Maximum reconnect delay
    pub reconnect_cap_ms: u64,
    /// Attempts before giving up
    pub reconnect_max_attempts: u32,
    /// Heartbeat status-query interval
    pub heartbeat_interval_ms: u64,
    /// Silence after which the heartbeat force-closes the link
    pub heartbeat_timeout_ms: u64,
    /// Silence during streaming that counts as a hard fault (serial)
    pub watchdog_stream_timeout_ms: u64,
    /// Silence while idle after which a status probe is issued (serial)
    pub watchdog_idle_probe_ms: u64,
    /// How often the watchdog checks
    pub watchdog_check_interval_ms: u64,
    /// Serial status poll interval, 0 disables
    pub status_poll_interval_ms: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            reconnect_base_ms: 1000,
            reconnect_multiplier: 1.5,
            reconnect_cap_ms: 30_000,
            reconnect_max_attempts: 10,
            heartbeat_interval_ms: 2000,
            heartbeat_timeout_ms: 5000,
            watchdog_stream_timeout_ms: 5000,
            watchdog_idle_probe_ms: 10_000,
            watchdog_check_interval_ms: 1000,
            status_poll_interval_ms: 250,
        }
    }
}

impl SupervisorSettings {
    /// Heartbeat interval
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Heartbeat response timeout
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    /// Watchdog streaming timeout
    pub fn watchdog_stream_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_stream_timeout_ms)
    }

    /// Watchdog idle probe threshold
    pub fn watchdog_idle_probe(&self) -> Duration {
        Duration::from_millis(self.watchdog_idle_probe_ms)
    }

    /// Watchdog check interval
    pub fn watchdog_check_interval(&self) -> Duration {
        Duration::from_millis(self.watchdog_check_interval_ms)
    }

    /// Serial status poll interval, `None` when disabled
    pub fn status_poll_interval(&self) -> Option<Duration> {
        (self.status_poll_interval_ms > 0).then(|| Duration::from_millis(self.status_poll_interval_ms))
    }
}

/// Offline queue settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OfflineQueueSettings {
    /// Queue commands while disconnected
    pub enabled: bool,
    /// Maximum queued commands (oldest dropped on overflow)
    pub capacity: usize,
    /// Delay between replayed commands
    pub replay_delay_ms: u64,
}

impl Default for OfflineQueueSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            capacity: 100,
            replay_delay_ms: 50,
        }
    }
}

impl OfflineQueueSettings {
    /// Replay delay
    pub fn replay_delay(&self) -> Duration {
        Duration::from_millis(self.replay_delay_ms)
    }
}

/// Explicit soft limits in machine coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SoftLimitSettings {
    /// Minimum X
    pub x_min: f64,
    /// Maximum X
    pub x_max: f64,
    /// Minimum Y
    pub y_min: f64,
    /// Maximum Y
    pub y_max: f64,
    /// Minimum Z
    pub z_min: f64,
    /// Maximum Z
    pub z_max: f64,
}

impl SoftLimitSettings {
    /// Bounds for one axis
    pub fn bounds(&self, axis: Axis) -> (f64, f64) {
        match axis {
            Axis::X => (self.x_min, self.x_max),
            Axis::Y => (self.y_min, self.y_max),
            Axis::Z => (self.z_min, self.z_max),
        }
    }
}

/// Safety settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetySettings {
    /// Minimum time the e-stop lockout stays engaged
    pub lockout_min_ms: u64,
    /// Explicit soft limits (take precedence over `$130`-`$132`)
    pub soft_limits: Option<SoftLimitSettings>,
    /// Derive soft limits from `$130`-`$132` when none are configured
    pub derive_limits_from_settings: bool,
}

impl Default for SafetySettings {
    fn default() -> Self {
        Self {
            lockout_min_ms: 2000,
            soft_limits: None,
            derive_limits_from_settings: true,
        }
    }
}

impl SafetySettings {
    /// Lockout minimum hold time
    pub fn lockout_min(&self) -> Duration {
        Duration::from_millis(self.lockout_min_ms)
    }
}

/// Machine snapshot persistence settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    /// Save and restore snapshots
    pub enabled: bool,
    /// Snapshot file, defaults to the platform data directory
    pub snapshot_path: Option<PathBuf>,
    /// Save interval while connected
    pub save_interval_ms: u64,
    /// Snapshots older than this are ignored
    pub max_age_secs: u64,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            snapshot_path: None,
            save_interval_ms: 5000,
            max_age_secs: 3600,
        }
    }
}

impl PersistenceSettings {
    /// Save interval
    pub fn save_interval(&self) -> Duration {
        Duration::from_millis(self.save_interval_ms)
    }

    /// Maximum snapshot age
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Configured snapshot path, or `<data dir>/fluidcnc/machine-snapshot.json`
    pub fn resolved_path(&self) -> Option<PathBuf> {
        self.snapshot_path.clone().or_else(|| {
            dirs::data_dir()
                .or_else(dirs::home_dir)
                .map(|dir| dir.join("fluidcnc").join("machine-snapshot.json"))
        })
    }
}

/// Complete link configuration
///
/// Aggregates all settings sections and provides file I/O operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Connection settings
    pub connection: ConnectionSettings,
    /// Streaming settings
    pub streaming: StreamingSettings,
    /// Supervisor settings
    pub supervisor: SupervisorSettings,
    /// Offline queue settings
    pub offline_queue: OfflineQueueSettings,
    /// Safety settings
    pub safety: SafetySettings,
    /// Persistence settings
    pub persistence: PersistenceSettings,
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Default config file location (`<config dir>/fluidcnc/config.toml`)
    pub fn default_path() -> SettingsResult<PathBuf> {
        dirs::config_dir()
            .or_else(dirs::home_dir)
            .map(|dir| dir.join("fluidcnc").join("config.toml"))
            .ok_or_else(|| {
                ConfigError::UnsupportedPlatform(std::env::consts::OS.to_string()).into()
            })
    }

    /// Load config from file (JSON or TOML)
    pub fn load_from_file(path: &Path) -> SettingsResult<Self> {
        let content = std::fs::read_to_string(path)?;

        let config: Self = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::from_str(&content)?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::from_str(&content)?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()).into());
        };

        config.validate()?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Load the config at `path`, or defaults when the file does not exist
    pub fn load_or_default(path: &Path) -> SettingsResult<Self> {
        if path.exists() {
            Self::load_from_file(path)
        } else {
            tracing::info!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    /// Save config to file (JSON or TOML)
    pub fn save_to_file(&self, path: &Path) -> SettingsResult<()> {
        self.validate()?;

        let content = if path.extension().is_some_and(|ext| ext == "json") {
            serde_json::to_string_pretty(self)?
        } else if path.extension().is_some_and(|ext| ext == "toml") {
            toml::to_string_pretty(self)?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.display().to_string()).into());
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;

        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        fn out_of_range(key: &str, value: impl ToString) -> ConfigError {
            ConfigError::ValueOutOfRange {
                key: key.to_string(),
                value: value.to_string(),
            }
        }

        if self.connection.baud_rate == 0 {
            return Err(out_of_range("connection.baud_rate", 0));
        }
        if self.connection.connect_timeout_ms == 0 {
            return Err(out_of_range("connection.connect_timeout_ms", 0));
        }

        if self.streaming.rx_buffer_size < 2 {
            return Err(out_of_range(
                "streaming.rx_buffer_size",
                self.streaming.rx_buffer_size,
            ));
        }
        if self.streaming.command_timeout_ms == 0 {
            return Err(out_of_range("streaming.command_timeout_ms", 0));
        }
        if self.streaming.long_command_timeout_ms == 0 {
            return Err(out_of_range("streaming.long_command_timeout_ms", 0));
        }

        let sup = &self.supervisor;
        if sup.reconnect_base_ms == 0 {
            return Err(out_of_range("supervisor.reconnect_base_ms", 0));
        }
        if !(sup.reconnect_multiplier >= 1.0) {
            return Err(out_of_range(
                "supervisor.reconnect_multiplier",
                sup.reconnect_multiplier,
            ));
        }
        if sup.reconnect_cap_ms < sup.reconnect_base_ms {
            return Err(out_of_range(
                "supervisor.reconnect_cap_ms",
                sup.reconnect_cap_ms,
            ));
        }
        if sup.heartbeat_interval_ms == 0 || sup.heartbeat_timeout_ms == 0 {
            return Err(out_of_range("supervisor.heartbeat", 0));
        }
        if sup.watchdog_check_interval_ms == 0
            || sup.watchdog_stream_timeout_ms == 0
            || sup.watchdog_idle_probe_ms == 0
        {
            return Err(out_of_range("supervisor.watchdog", 0));
        }

        if self.offline_queue.capacity == 0 {
            return Err(out_of_range("offline_queue.capacity", 0));
        }

        if let Some(limits) = &self.safety.soft_limits {
            for axis in Axis::ALL {
                let (min, max) = limits.bounds(axis);
                if !(min < max) {
                    return Err(out_of_range(
                        &format!("safety.soft_limits.{}", axis.letter().to_ascii_lowercase()),
                        format!("[{}, {}]", min, max),
                    ));
                }
            }
        }

        if self.persistence.enabled && self.persistence.save_interval_ms == 0 {
            return Err(out_of_range("persistence.save_interval_ms", 0));
        }

        Ok(())
    }
}

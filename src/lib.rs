//! # FluidCNC
//!
//! Machine-link layer for grblHAL CNC controllers, reached over a WebSocket
//! bridge or a direct serial port.
//!
//! ## Architecture
//!
//! FluidCNC is organized as a workspace with multiple crates:
//!
//! 1. **fluidcnc-core** - Error taxonomy, typed event bus, machine-state model
//! 2. **fluidcnc-settings** - Configuration file handling and validation
//! 3. **fluidcnc-communication** - Transports, grblHAL protocol, streaming,
//!    safety gate, emergency stop and link supervision
//! 4. **fluidcnc** - Command-line front end that wires the crates together
//!
//! ## Features
//!
//! - **Transports**: WebSocket bridge, serial/USB, in-process simulator
//! - **Streaming**: character-counted flow control against the controller's
//!   128-byte receive buffer, pause/resume, graceful stop
//! - **Correlation**: every `ok`/`error:N` matched to the command it answers
//! - **Safety**: outgoing-command gate, emergency stop with motion lockout,
//!   soft limits for jogging, serial watchdog
//! - **Supervision**: heartbeat, exponential-backoff reconnect, offline queue
//! - **Persistence**: machine snapshot restored across sessions

pub use fluidcnc_communication::{
    communication, firmware, list_ports, persistence, safety, CncController, CommandReply,
    CoolantCommand, EstopReport, FirmwareInfo, OverrideAdjust, RapidOverride, SendOptions,
    SendOutcome, SerialPortInfo, StreamHandle, StreamOutcome, StreamProgress, StreamState,
};

pub use fluidcnc_core::{
    data, Axis, CncEvent, CommandError, ConnectionError, Error, EventBus, EventFilter,
    MachineState, MachineStatus, Position, Result, SpindleDirection, TransportKind,
    ValidationError,
};

pub use fluidcnc_settings::{Config, ConfigError, SettingsError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build date (set at compile time)
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable, multi-line
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

/// Initialize logging
///
/// Sets up structured logging with:
/// - stderr output, so stdout stays free for command output
/// - RUST_LOG environment variable support, `default_level` otherwise
/// - pretty or JSON formatting
pub fn init_logging(format: LogFormat, default_level: tracing::Level) -> anyhow::Result<()> {
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;
    use tracing_subscriber::EnvFilter;

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));

    match format {
        LogFormat::Pretty => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .with_level(true)
                .with_thread_names(true)
                .with_line_number(true)
                .pretty();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
        LogFormat::Json => {
            let fmt_layer = fmt::layer()
                .with_writer(std::io::stderr)
                .with_target(true)
                .json();
            tracing_subscriber::registry()
                .with(env_filter)
                .with(fmt_layer)
                .try_init()?;
        }
    }

    Ok(())
}

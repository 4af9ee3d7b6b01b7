//! FluidCNC Settings Crate
//!
//! Handles link configuration: transport selection, flow-control budget,
//! supervisor timings, offline queue, safety and snapshot persistence.

pub mod config;
pub mod error;

pub use config::{
    Config, ConnectionSettings, OfflineQueueSettings, PersistenceSettings, SafetySettings,
    SoftLimitSettings, StreamingSettings, SupervisorSettings,
};
pub use error::{ConfigError, SettingsError, SettingsResult};

//! Controller firmware support
//!
//! grblHAL is the only supported firmware. Link supervision (heartbeat,
//! watchdog and reconnect backoff) lives alongside it.

pub mod connection_watch;
pub mod grbl;
pub mod reconnect;

pub use connection_watch::{
    ActivityClock, ConnectionWatchConfig, ConnectionWatchState, HeartbeatAction, Watchdog,
    WatchdogAction,
};
pub use grbl::{CncController, CoolantCommand, FirmwareInfo, StreamHandle};
pub use reconnect::ReconnectPolicy;

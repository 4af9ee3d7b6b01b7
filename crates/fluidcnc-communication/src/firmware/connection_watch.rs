//! Connection liveness
//!
//! Tracks the last time any data arrived on the link and turns elapsed idle
//! time into heartbeat and watchdog decisions. The decisions are pure so the
//! supervisor loops stay thin and the thresholds can be tested without I/O.

use fluidcnc_settings::SupervisorSettings;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Shared "last data received" timestamp, touched by the transport reader
#[derive(Debug, Clone)]
pub struct ActivityClock {
    last: Arc<Mutex<Instant>>,
}

impl Default for ActivityClock {
    fn default() -> Self {
        Self::new()
    }
}

impl ActivityClock {
    /// Create a clock that starts now
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    /// Record activity
    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    /// Time since the last activity
    pub fn elapsed(&self) -> Duration {
        self.last.lock().elapsed()
    }

    /// Instant of the last activity
    pub fn last(&self) -> Instant {
        *self.last.lock()
    }
}

/// Connection watch state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionWatchState {
    /// Data arrived recently
    Healthy,
    /// Quiet long enough to warrant a probe
    Stale,
    /// Quiet past the hard timeout
    Lost,
}

/// What the heartbeat loop should do on a tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatAction {
    /// Send a `?` status query
    SendProbe,
    /// Nothing received within the response timeout; close the link
    ForceClose,
}

/// What the watchdog loop should do on a check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogAction {
    /// Link looks alive
    None,
    /// Idle and quiet; issue a status probe
    Probe,
    /// Streaming and quiet; hard fault
    Fault,
}

/// Thresholds for heartbeat and watchdog decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionWatchConfig {
    /// Heartbeat tick
    pub heartbeat_interval: Duration,
    /// Heartbeat response timeout
    pub heartbeat_timeout: Duration,
    /// Silence tolerated while a stream is active
    pub stream_timeout: Duration,
    /// Silence after which an idle link is probed
    pub idle_probe: Duration,
    /// Watchdog check period
    pub check_interval: Duration,
}

impl Default for ConnectionWatchConfig {
    fn default() -> Self {
        Self::from_settings(&SupervisorSettings::default())
    }
}

impl ConnectionWatchConfig {
    /// Build from supervisor settings
    pub fn from_settings(settings: &SupervisorSettings) -> Self {
        Self {
            heartbeat_interval: settings.heartbeat_interval(),
            heartbeat_timeout: settings.heartbeat_timeout(),
            stream_timeout: settings.watchdog_stream_timeout(),
            idle_probe: settings.watchdog_idle_probe(),
            check_interval: settings.watchdog_check_interval(),
        }
    }

    /// Heartbeat decision for the given silence
    pub fn heartbeat(&self, idle: Duration) -> HeartbeatAction {
        if idle >= self.heartbeat_timeout {
            HeartbeatAction::ForceClose
        } else {
            HeartbeatAction::SendProbe
        }
    }

    /// Classify the given silence
    pub fn state(&self, idle: Duration, streaming: bool) -> ConnectionWatchState {
        if streaming && idle >= self.stream_timeout {
            ConnectionWatchState::Lost
        } else if idle >= self.idle_probe {
            ConnectionWatchState::Stale
        } else {
            ConnectionWatchState::Healthy
        }
    }
}

/// Watchdog decision state; remembers when it last probed so a quiet idle link
/// is probed once per idle window rather than on every check.
#[derive(Debug)]
pub struct Watchdog {
    config: ConnectionWatchConfig,
    last_probe: Option<Instant>,
}

impl Watchdog {
    /// Create a watchdog
    pub fn new(config: ConnectionWatchConfig) -> Self {
        Self {
            config,
            last_probe: None,
        }
    }

    /// Decide what to do given the activity clock and whether a stream is active
    pub fn check(&mut self, clock: &ActivityClock, streaming: bool) -> WatchdogAction {
        let idle = clock.elapsed();
        match self.config.state(idle, streaming) {
            ConnectionWatchState::Lost => WatchdogAction::Fault,
            ConnectionWatchState::Healthy => WatchdogAction::None,
            ConnectionWatchState::Stale if streaming => WatchdogAction::None,
            ConnectionWatchState::Stale => {
                let due = match self.last_probe {
                    Some(at) => at < clock.last() || at.elapsed() >= self.config.idle_probe,
                    None => true,
                };
                if due {
                    self.last_probe = Some(Instant::now());
                    WatchdogAction::Probe
                } else {
                    WatchdogAction::None
                }
            }
        }
    }
}

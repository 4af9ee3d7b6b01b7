//! Emergency-stop panel
//!
//! Holds every link the controller has opened and not yet closed, behind its
//! own lock, so a stop never waits on the protocol state. A stop writes
//! feed-hold then soft-reset to every registered link and engages the motion
//! lockout whether or not any link accepted the bytes.

use fluidcnc_core::{LockoutError, MachineStatus};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use crate::communication::LinkWriter;
use crate::firmware::grbl::realtime::RealtimeCommand;

/// Handle returned by [`EstopPanel::register`]
pub type LinkKey = u64;

/// Result of one emergency-stop call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EstopReport {
    /// Links that accepted both bytes
    pub delivered_to: Vec<String>,
    /// Links that refused, with the write error
    pub failed: Vec<(String, String)>,
    /// A delivered stop was already in force; nothing was sent
    pub already_engaged: bool,
}

impl EstopReport {
    /// At least one link received the stop
    pub fn delivered(&self) -> bool {
        !self.delivered_to.is_empty()
    }

    /// One-line summary for logs and failure events
    pub fn failure_reason(&self) -> String {
        if self.failed.is_empty() {
            "no live transport".to_string()
        } else {
            self.failed
                .iter()
                .map(|(name, err)| format!("{}: {}", name, err))
                .collect::<Vec<_>>()
                .join("; ")
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct MotionLockout {
    engaged_at: Instant,
    delivered: bool,
}

#[derive(Default)]
struct PanelState {
    links: Vec<(LinkKey, Arc<dyn LinkWriter>)>,
    next_key: LinkKey,
    lockout: Option<MotionLockout>,
}

/// Emergency-stop path and motion lockout
#[derive(Clone, Default)]
pub struct EstopPanel {
    state: Arc<Mutex<PanelState>>,
}

impl std::fmt::Debug for EstopPanel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EstopPanel")
            .field("links", &state.links.len())
            .field("locked", &state.lockout.is_some())
            .finish()
    }
}

impl EstopPanel {
    /// Panel with no links and no lockout
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a live link
    pub fn register(&self, writer: Arc<dyn LinkWriter>) -> LinkKey {
        let mut state = self.state.lock();
        state.next_key += 1;
        let key = state.next_key;
        tracing::debug!("E-stop panel: registered link {} ({})", key, writer.name());
        state.links.push((key, writer));
        key
    }

    /// Drop a link that has closed
    pub fn unregister(&self, key: LinkKey) {
        self.state.lock().links.retain(|(k, _)| *k != key);
    }

    /// Number of registered links
    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Send feed-hold and soft-reset to every registered link and engage the
    /// lockout.
    pub fn emergency_stop(&self) -> EstopReport {
        let mut state = self.state.lock();

        if state.lockout.is_some_and(|l| l.delivered) {
            tracing::debug!("Emergency stop already delivered; lockout in force");
            return EstopReport {
                already_engaged: true,
                ..EstopReport::default()
            };
        }

        let mut report = EstopReport::default();
        for (_, writer) in &state.links {
            let name = writer.name();
            let result = writer
                .write_realtime(RealtimeCommand::FeedHold)
                .and_then(|_| writer.write_realtime(RealtimeCommand::SoftReset));
            match result {
                Ok(()) => report.delivered_to.push(name),
                Err(e) => report.failed.push((name, e.to_string())),
            }
        }

        let engaged_at = state
            .lockout
            .map(|l| l.engaged_at)
            .unwrap_or_else(Instant::now);
        state.lockout = Some(MotionLockout {
            engaged_at,
            delivered: report.delivered(),
        });
        report
    }

    /// Whether jog and spindle-on commands are blocked
    pub fn is_locked(&self) -> bool {
        self.state.lock().lockout.is_some()
    }

    /// Time the lockout has been in force
    pub fn locked_for(&self) -> Option<Duration> {
        self.state.lock().lockout.map(|l| l.engaged_at.elapsed())
    }

    /// Clear the lockout once `min_hold` has elapsed and the machine is at rest
    pub fn clear(&self, status: MachineStatus, min_hold: Duration) -> Result<(), LockoutError> {
        let mut state = self.state.lock();
        let lockout = state.lockout.ok_or(LockoutError::NotEngaged)?;
        let held = lockout.engaged_at.elapsed();
        if held < min_hold {
            return Err(LockoutError::TooSoon {
                remaining_ms: (min_hold - held).as_millis() as u64,
            });
        }
        if !status.is_safe_resting() {
            return Err(LockoutError::UnsafeState {
                status: status.to_string(),
            });
        }
        state.lockout = None;
        tracing::info!("Motion lockout cleared");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluidcnc_core::ConnectionError;

    struct Recorder {
        name: &'static str,
        bytes: Mutex<Vec<u8>>,
        broken: bool,
    }

    impl Recorder {
        fn new(name: &'static str, broken: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                bytes: Mutex::new(Vec::new()),
                broken,
            })
        }
    }

    impl LinkWriter for Recorder {
        fn write_line(&self, _line: &str) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn write_realtime(&self, command: RealtimeCommand) -> Result<(), ConnectionError> {
            if self.broken {
                return Err(ConnectionError::NotConnected);
            }
            self.bytes.lock().push(command.byte());
            Ok(())
        }

        fn close(&self) {}

        fn is_open(&self) -> bool {
            !self.broken
        }

        fn name(&self) -> String {
            self.name.to_string()
        }
    }

    #[test]
    fn test_stop_reaches_every_link_in_order() {
        let panel = EstopPanel::new();
        let a = Recorder::new("ws", false);
        let b = Recorder::new("serial", false);
        panel.register(a.clone());
        panel.register(b.clone());

        let report = panel.emergency_stop();
        assert_eq!(report.delivered_to, vec!["ws", "serial"]);
        assert_eq!(*a.bytes.lock(), vec![b'!', 0x18]);
        assert_eq!(*b.bytes.lock(), vec![b'!', 0x18]);
        assert!(panel.is_locked());

        let again = panel.emergency_stop();
        assert!(again.already_engaged);
        assert_eq!(a.bytes.lock().len(), 2);
    }

    #[test]
    fn test_no_links_still_locks_and_retries() {
        let panel = EstopPanel::new();
        let report = panel.emergency_stop();
        assert!(!report.delivered());
        assert!(panel.is_locked());

        let link = Recorder::new("late", false);
        panel.register(link.clone());
        let retry = panel.emergency_stop();
        assert!(!retry.already_engaged);
        assert_eq!(retry.delivered_to, vec!["late"]);
    }

    #[test]
    fn test_broken_link_reported() {
        let panel = EstopPanel::new();
        panel.register(Recorder::new("dead", true));
        let report = panel.emergency_stop();
        assert!(!report.delivered());
        assert_eq!(report.failed.len(), 1);
        assert!(report.failure_reason().contains("dead"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_requires_time_and_safe_state() {
        let panel = EstopPanel::new();
        assert_eq!(
            panel.clear(MachineStatus::Idle, Duration::from_secs(2)),
            Err(LockoutError::NotEngaged)
        );
        panel.emergency_stop();
        assert!(matches!(
            panel.clear(MachineStatus::Idle, Duration::from_secs(2)),
            Err(LockoutError::TooSoon { .. })
        ));

        tokio::time::advance(Duration::from_millis(2100)).await;
        assert!(matches!(
            panel.clear(MachineStatus::Run, Duration::from_secs(2)),
            Err(LockoutError::UnsafeState { .. })
        ));
        assert!(panel
            .clear(MachineStatus::Alarm, Duration::from_secs(2))
            .is_ok());
        assert!(!panel.is_locked());
    }
}

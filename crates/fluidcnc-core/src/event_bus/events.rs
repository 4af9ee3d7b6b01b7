//! Event type definitions for the event bus.
//!
//! This module defines every event the machine link publishes, organized by
//! category. Events are cloneable and serializable for logging/replay.

use serde::{Deserialize, Serialize};

use crate::data::{MachineState, MachineStatus, ProbeResult, TransportKind};

/// Root event enum for all machine-link events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CncEvent {
    /// Transport lifecycle
    Connection(ConnectionEvent),
    /// Machine state, alarms, probe results and messages
    Machine(MachineEvent),
    /// Correlated command results
    Command(CommandEvent),
    /// Streaming engine lifecycle
    Stream(StreamEvent),
    /// Safety gate, watchdog and emergency stop
    Safety(SafetyEvent),
}

impl CncEvent {
    /// Get the category of this event
    pub fn category(&self) -> EventCategory {
        match self {
            CncEvent::Connection(_) => EventCategory::Connection,
            CncEvent::Machine(_) => EventCategory::Machine,
            CncEvent::Command(_) => EventCategory::Command,
            CncEvent::Stream(_) => EventCategory::Stream,
            CncEvent::Safety(_) => EventCategory::Safety,
        }
    }

    /// Get a short description of this event for logging
    pub fn description(&self) -> String {
        match self {
            CncEvent::Connection(e) => e.description(),
            CncEvent::Machine(e) => e.description(),
            CncEvent::Command(e) => e.description(),
            CncEvent::Stream(e) => e.description(),
            CncEvent::Safety(e) => e.description(),
        }
    }

    /// Events with a motion-safety implication. These must never be lost.
    pub fn is_safety_critical(&self) -> bool {
        match self {
            CncEvent::Machine(MachineEvent::Alarm { .. }) => true,
            CncEvent::Safety(e) => matches!(
                e,
                SafetyEvent::WatchdogFault { .. }
                    | SafetyEvent::EmergencyStop { .. }
                    | SafetyEvent::EmergencyStopFailed { .. }
                    | SafetyEvent::SoftLimitBlocked { .. }
                    | SafetyEvent::OperatorWarning { .. }
            ),
            _ => false,
        }
    }
}

/// Event category for filtering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventCategory {
    /// Transport lifecycle events.
    Connection,
    /// Machine state and status events.
    Machine,
    /// Command result events.
    Command,
    /// Streaming engine events.
    Stream,
    /// Safety events.
    Safety,
}

impl std::fmt::Display for EventCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventCategory::Connection => write!(f, "Connection"),
            EventCategory::Machine => write!(f, "Machine"),
            EventCategory::Command => write!(f, "Command"),
            EventCategory::Stream => write!(f, "Stream"),
            EventCategory::Safety => write!(f, "Safety"),
        }
    }
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// User requested disconnect
    UserRequested,
    /// The remote end closed the link cleanly
    ClosedByPeer,
    /// Connection lost unexpectedly
    ConnectionLost(String),
    /// No data within the heartbeat response timeout
    HeartbeatTimeout,
    /// Watchdog fault during streaming
    WatchdogFault,
}

impl DisconnectReason {
    /// Whether the reconnect policy should kick in
    pub fn is_unclean(&self) -> bool {
        matches!(
            self,
            DisconnectReason::ConnectionLost(_) | DisconnectReason::HeartbeatTimeout
        )
    }
}

/// Connection-related events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// Starting connection attempt.
    Connecting {
        /// URL or port being opened.
        endpoint: String,
        /// Transport variant.
        transport: TransportKind,
    },
    /// Successfully connected.
    Connected {
        /// URL or port that was opened.
        endpoint: String,
        /// Transport variant.
        transport: TransportKind,
    },
    /// Link closed.
    Disconnected {
        /// URL or port that was closed.
        endpoint: String,
        /// Why the link closed.
        reason: DisconnectReason,
    },
    /// Opening the transport failed.
    ConnectionFailed {
        /// URL or port that failed to open.
        endpoint: String,
        /// Error text.
        error: String,
    },
    /// A reconnect attempt is scheduled.
    Reconnecting {
        /// One-based attempt number.
        attempt: u32,
        /// Delay before the attempt.
        delay_ms: u64,
    },
    /// The reconnect policy gave up; a manual connect is required.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

impl ConnectionEvent {
    fn description(&self) -> String {
        match self {
            ConnectionEvent::Connecting { endpoint, transport } => {
                format!("Connecting to {} ({})", endpoint, transport)
            }
            ConnectionEvent::Connected { endpoint, transport } => {
                format!("Connected to {} ({})", endpoint, transport)
            }
            ConnectionEvent::Disconnected { endpoint, reason } => {
                format!("Disconnected from {}: {:?}", endpoint, reason)
            }
            ConnectionEvent::ConnectionFailed { endpoint, error } => {
                format!("Connection failed to {}: {}", endpoint, error)
            }
            ConnectionEvent::Reconnecting { attempt, delay_ms } => {
                format!("Reconnect attempt {} in {}ms", attempt, delay_ms)
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                format!("Reconnect gave up after {} attempts", attempts)
            }
        }
    }
}

/// Machine state events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum MachineEvent {
    /// A status report was applied.
    Status(Box<MachineState>),
    /// Machine status changed.
    StateChanged {
        /// Previous status.
        old: MachineStatus,
        /// New status.
        new: MachineStatus,
    },
    /// `ALARM:N` received.
    Alarm {
        /// Alarm code.
        code: u32,
        /// Decoded alarm text.
        message: String,
        /// Suggested recovery.
        hint: String,
    },
    /// `[PRB:...]` received.
    Probe(ProbeResult),
    /// `$N=value` received.
    Setting {
        /// Setting number.
        number: u16,
        /// Raw value text.
        value: String,
    },
    /// Controller banner: the firmware has reset.
    Welcome {
        /// Full banner line.
        banner: String,
    },
    /// Generic text line or `[MSG:...]`.
    Message {
        /// Message text.
        text: String,
    },
    /// Opaque bridge or telemetry payload, never merged into machine state.
    Auxiliary {
        /// Raw JSON payload.
        payload: serde_json::Value,
    },
}

impl MachineEvent {
    fn description(&self) -> String {
        match self {
            MachineEvent::Status(state) => format!(
                "Status {} at {}",
                state.status, state.machine_position
            ),
            MachineEvent::StateChanged { old, new } => {
                format!("State: {} -> {}", old, new)
            }
            MachineEvent::Alarm { code, message, .. } => {
                format!("Alarm {}: {}", code, message)
            }
            MachineEvent::Probe(result) => format!(
                "Probe {} at {}",
                if result.success { "hit" } else { "miss" },
                result.position
            ),
            MachineEvent::Setting { number, value } => format!("${}={}", number, value),
            MachineEvent::Welcome { banner } => format!("Controller reset: {}", banner),
            MachineEvent::Message { text } => text.clone(),
            MachineEvent::Auxiliary { payload } => format!("Auxiliary: {}", payload),
        }
    }
}

/// Correlated command events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CommandEvent {
    /// A line was handed to the transport.
    Sent {
        /// Correlation id.
        id: u64,
        /// Command text.
        command: String,
    },
    /// `ok` matched to a command.
    Ok {
        /// Correlation id, if a command was outstanding.
        id: Option<u64>,
        /// Command text, if a command was outstanding.
        command: Option<String>,
    },
    /// `error:N` matched to a command.
    Error {
        /// Correlation id, if a command was outstanding.
        id: Option<u64>,
        /// Command text, if a command was outstanding.
        command: Option<String>,
        /// Error code.
        code: u32,
        /// Decoded error text.
        message: String,
    },
    /// A command expired without a response.
    TimedOut {
        /// Correlation id.
        id: u64,
        /// Command text.
        command: String,
    },
    /// A command was queued while offline.
    Queued {
        /// Queue item id.
        id: u64,
        /// Command text.
        command: String,
        /// Queue length after insertion.
        queue_len: usize,
    },
    /// The offline queue overflowed and dropped its oldest entry.
    Evicted {
        /// Dropped command text.
        command: String,
    },
    /// An offline-queued command failed on replay.
    ReplayFailed {
        /// Command text.
        command: String,
        /// Error text.
        error: String,
    },
}

impl CommandEvent {
    fn description(&self) -> String {
        match self {
            CommandEvent::Sent { id, command } => format!("#{} sent: {}", id, command),
            CommandEvent::Ok { command, .. } => {
                format!("ok ({})", command.as_deref().unwrap_or("unsolicited"))
            }
            CommandEvent::Error {
                command,
                code,
                message,
                ..
            } => format!(
                "error:{} {} ({})",
                code,
                message,
                command.as_deref().unwrap_or("unsolicited")
            ),
            CommandEvent::TimedOut { id, command } => {
                format!("#{} timed out: {}", id, command)
            }
            CommandEvent::Queued {
                command, queue_len, ..
            } => format!("Queued offline ({}): {}", queue_len, command),
            CommandEvent::Evicted { command } => format!("Offline queue dropped: {}", command),
            CommandEvent::ReplayFailed { command, error } => {
                format!("Replay of '{}' failed: {}", command, error)
            }
        }
    }
}

/// Streaming engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    /// Stream session started.
    Started {
        /// Session id.
        session: u64,
        /// Number of lines.
        total: usize,
    },
    /// A line was sent or acknowledged.
    Progress {
        /// Session id.
        session: u64,
        /// Lines sent so far (`index`).
        sent: usize,
        /// Lines acknowledged so far.
        acknowledged: usize,
        /// Total lines.
        total: usize,
    },
    /// Feed hold issued.
    Paused {
        /// Session id.
        session: u64,
    },
    /// Cycle start issued.
    Resumed {
        /// Session id.
        session: u64,
    },
    /// A streamed line was answered with `error:N`; streaming continues.
    LineFailed {
        /// Session id.
        session: u64,
        /// The failed line.
        line: String,
        /// Error code.
        code: u32,
        /// Decoded error text.
        message: String,
    },
    /// All lines sent and acknowledged.
    Completed {
        /// Session id.
        session: u64,
        /// Lines acknowledged with `ok`.
        lines_executed: usize,
        /// Lines answered with `error:N`.
        lines_failed: usize,
    },
    /// Graceful stop finished.
    Stopped {
        /// Session id.
        session: u64,
        /// Sent-but-unacknowledged lines dropped.
        dropped: usize,
    },
    /// Immediate abort on a fault.
    Aborted {
        /// Session id.
        session: u64,
        /// Fault reason.
        reason: String,
        /// Sent-but-unacknowledged lines dropped.
        dropped: usize,
    },
}

impl StreamEvent {
    fn description(&self) -> String {
        match self {
            StreamEvent::Started { session, total } => {
                format!("Stream {} started ({} lines)", session, total)
            }
            StreamEvent::Progress {
                sent, total, acknowledged, ..
            } => format!("Stream {}/{} sent, {} acknowledged", sent, total, acknowledged),
            StreamEvent::Paused { session } => format!("Stream {} paused", session),
            StreamEvent::Resumed { session } => format!("Stream {} resumed", session),
            StreamEvent::LineFailed { line, code, .. } => {
                format!("Stream line '{}' failed with error:{}", line, code)
            }
            StreamEvent::Completed {
                session,
                lines_executed,
                ..
            } => format!("Stream {} completed ({} lines)", session, lines_executed),
            StreamEvent::Stopped { session, dropped } => {
                format!("Stream {} stopped ({} dropped)", session, dropped)
            }
            StreamEvent::Aborted { session, reason, .. } => {
                format!("Stream {} aborted: {}", session, reason)
            }
        }
    }
}

/// Safety events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SafetyEvent {
    /// The safety gate or the fixer refused a command.
    CommandBlocked {
        /// Refused command.
        command: String,
        /// Reason.
        reason: String,
    },
    /// The fixer rewrote a command.
    CommandRewritten {
        /// Command as submitted.
        original: String,
        /// Command as transmitted.
        fixed: String,
    },
    /// Non-blocking safety warning.
    CommandWarning {
        /// The command.
        command: String,
        /// Warning text.
        warning: String,
    },
    /// A jog target fell outside the soft limits.
    SoftLimitBlocked {
        /// Axis letter.
        axis: char,
        /// Requested machine-coordinate target.
        target: f64,
        /// Lower bound.
        min: f64,
        /// Upper bound.
        max: f64,
    },
    /// The serial watchdog detected a hung link during streaming.
    WatchdogFault {
        /// Fault description.
        message: String,
    },
    /// Emergency stop delivered.
    EmergencyStop {
        /// Links that accepted the stop bytes.
        delivered_to: Vec<String>,
    },
    /// Emergency stop reached no transport.
    EmergencyStopFailed {
        /// Failure description.
        reason: String,
    },
    /// Motion lockout cleared.
    LockoutCleared,
    /// Operator attention required.
    OperatorWarning {
        /// Warning text.
        message: String,
    },
}

impl SafetyEvent {
    fn description(&self) -> String {
        match self {
            SafetyEvent::CommandBlocked { command, reason } => {
                format!("Blocked '{}': {}", command, reason)
            }
            SafetyEvent::CommandRewritten { original, fixed } => {
                format!("Rewrote '{}' as '{}'", original, fixed)
            }
            SafetyEvent::CommandWarning { command, warning } => {
                format!("Warning for '{}': {}", command, warning)
            }
            SafetyEvent::SoftLimitBlocked {
                axis,
                target,
                min,
                max,
            } => format!(
                "Soft limit on {}: {:.3} outside [{:.3}, {:.3}]",
                axis, target, min, max
            ),
            SafetyEvent::WatchdogFault { message } => format!("Watchdog: {}", message),
            SafetyEvent::EmergencyStop { delivered_to } => {
                format!("Emergency stop delivered to {}", delivered_to.join(", "))
            }
            SafetyEvent::EmergencyStopFailed { reason } => {
                format!("EMERGENCY STOP FAILED: {}", reason)
            }
            SafetyEvent::LockoutCleared => "Motion lockout cleared".to_string(),
            SafetyEvent::OperatorWarning { message } => message.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let event = CncEvent::Safety(SafetyEvent::LockoutCleared);
        assert_eq!(event.category(), EventCategory::Safety);
        let event = CncEvent::Stream(StreamEvent::Paused { session: 1 });
        assert_eq!(event.category(), EventCategory::Stream);
    }

    #[test]
    fn test_safety_critical() {
        assert!(CncEvent::Machine(MachineEvent::Alarm {
            code: 1,
            message: "Hard limit".to_string(),
            hint: String::new(),
        })
        .is_safety_critical());
        assert!(CncEvent::Safety(SafetyEvent::EmergencyStopFailed {
            reason: "no transport".to_string()
        })
        .is_safety_critical());
        assert!(!CncEvent::Safety(SafetyEvent::LockoutCleared).is_safety_critical());
    }

    #[test]
    fn test_disconnect_reason_cleanliness() {
        assert!(DisconnectReason::HeartbeatTimeout.is_unclean());
        assert!(DisconnectReason::ConnectionLost("eof".to_string()).is_unclean());
        assert!(!DisconnectReason::UserRequested.is_unclean());
        assert!(!DisconnectReason::WatchdogFault.is_unclean());
    }
}

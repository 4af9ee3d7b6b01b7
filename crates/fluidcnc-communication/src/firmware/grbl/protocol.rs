//! grblHAL protocol core
//!
//! Everything between the transport and the command API that has to change
//! atomically: framing, classification, machine-state updates, correlation,
//! streaming and the command gate. It performs no I/O of its own beyond
//! non-blocking writes on the attached link, and collects the events it
//! produces so the caller can publish them after releasing its lock.

use fluidcnc_core::{
    Axis, CncEvent, CommandError, CommandEvent, ConnectionError, Error, MachineEvent,
    MachineState, MachineStatus, Position, Result, SafetyEvent, StreamError, ValidationError,
};
use std::sync::Arc;
use tracing::{debug, error, info, trace, warn};

use super::correlator::{CommandCorrelator, CommandOrigin, CommandReply, OriginKind, ReplySender};
use super::error_decoder::{alarm_recovery_hint, decode_alarm, decode_error};
use super::framer::LineFramer;
use super::realtime::RealtimeCommand;
use super::response_parser::{GrblResponse, GrblResponseParser};
use super::status_parser::{apply_status, parse_number, StatusReport};
use crate::communication::{
    LineSink, LinkWriter, OfflineQueue, OfflineQueueItem, SendOptions, StreamState,
    StreamTicket, StreamingEngine,
};
use crate::persistence::{MachineSnapshot, RECONCILE_TOLERANCE};
use crate::safety::{CommandFixer, SafetyGate};

/// What happened to a submitted command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Written to the link and registered with the correlator
    Sent {
        /// Correlation id
        id: u64,
    },
    /// Realtime byte written; nothing to wait for
    Realtime,
    /// Link down; held in the offline queue
    Queued {
        /// Offline queue id
        id: u64,
    },
}

/// Construction parameters for [`ProtocolCore`]
#[derive(Debug, Clone, Copy)]
pub struct ProtocolOptions {
    /// Controller receive buffer in bytes
    pub rx_buffer_size: usize,
    /// Queue commands while disconnected
    pub offline_queue: bool,
    /// Offline queue capacity
    pub offline_capacity: usize,
    /// Record `$130`-`$132` as travel limits
    pub derive_travel: bool,
}

impl Default for ProtocolOptions {
    fn default() -> Self {
        Self {
            rx_buffer_size: 128,
            offline_queue: true,
            offline_capacity: 100,
            derive_travel: true,
        }
    }
}

/// Writes streamed lines and registers them with the correlator
struct CoreSink<'a> {
    writer: Option<&'a dyn LinkWriter>,
    correlator: &'a mut CommandCorrelator,
}

impl<'a> CoreSink<'a> {
    fn new(writer: Option<&'a dyn LinkWriter>, correlator: &'a mut CommandCorrelator) -> Self {
        Self { writer, correlator }
    }
}

impl LineSink for CoreSink<'_> {
    fn send_line(&mut self, line: &str) -> std::result::Result<(), ConnectionError> {
        let writer = self.writer.ok_or(ConnectionError::NotConnected)?;
        writer.write_line(line)?;
        self.correlator.register(line, CommandOrigin::Stream);
        Ok(())
    }

    fn send_realtime(&mut self, command: RealtimeCommand) -> std::result::Result<(), ConnectionError> {
        let writer = self.writer.ok_or(ConnectionError::NotConnected)?;
        writer.write_realtime(command)
    }
}

/// Protocol state behind the controller lock
pub struct ProtocolCore {
    state: MachineState,
    framer: LineFramer,
    parser: GrblResponseParser,
    correlator: CommandCorrelator,
    stream: StreamingEngine,
    gate: SafetyGate,
    offline: OfflineQueue,
    offline_enabled: bool,
    derive_travel: bool,
    writer: Option<Arc<dyn LinkWriter>>,
    restored_position: Option<Position>,
    events: Vec<CncEvent>,
}

impl std::fmt::Debug for ProtocolCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolCore")
            .field("status", &self.state.status)
            .field("connected", &self.writer.is_some())
            .field("outstanding", &self.correlator.len())
            .field("stream", &self.stream)
            .field("offline", &self.offline.len())
            .finish()
    }
}

impl Default for ProtocolCore {
    fn default() -> Self {
        Self::new(ProtocolOptions::default())
    }
}

impl ProtocolCore {
    /// Create a core with no link attached
    pub fn new(options: ProtocolOptions) -> Self {
        Self {
            state: MachineState::new(),
            framer: LineFramer::new(),
            parser: GrblResponseParser::new(),
            correlator: CommandCorrelator::new(),
            stream: StreamingEngine::new(options.rx_buffer_size),
            gate: SafetyGate::new(),
            offline: OfflineQueue::new(options.offline_capacity),
            offline_enabled: options.offline_queue,
            derive_travel: options.derive_travel,
            writer: None,
            restored_position: None,
            events: Vec::new(),
        }
    }

    // ---- link lifecycle ----

    /// Attach a freshly opened link
    pub fn attach(&mut self, writer: Arc<dyn LinkWriter>) {
        self.framer.reset();
        self.writer = Some(writer);
    }

    /// Detach the link without touching in-flight state
    pub fn detach(&mut self) -> Option<Arc<dyn LinkWriter>> {
        self.writer.take()
    }

    /// Whether a link is attached
    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }

    /// Current link writer
    pub fn writer(&self) -> Option<Arc<dyn LinkWriter>> {
        self.writer.clone()
    }

    /// The link went away: abort streaming, fail everything in flight
    pub fn on_link_lost(&mut self, reason: &str) {
        self.writer = None;
        self.framer.reset();
        self.abort_stream(&format!("connection lost: {}", reason));
        let rejected = self.correlator.reject_all(|command| CommandError::ConnectionLost {
            command: command.to_string(),
        });
        if rejected > 0 {
            warn!("{} commands lost with the connection", rejected);
        }
    }

    /// Take the events produced since the last call
    pub fn take_events(&mut self) -> Vec<CncEvent> {
        std::mem::take(&mut self.events)
    }

    fn collect_stream_events(&mut self) {
        for event in self.stream.drain_events() {
            self.events.push(CncEvent::Stream(event));
        }
    }

    // ---- machine model ----

    /// Machine state model
    pub fn state(&self) -> &MachineState {
        &self.state
    }

    /// Seed the model from a snapshot; the next status report reconciles it
    pub fn restore_snapshot(&mut self, snapshot: &MachineSnapshot) {
        snapshot.apply_to(&mut self.state);
        self.restored_position = Some(snapshot.machine_position);
        info!(
            "Restored snapshot from {} at {}",
            snapshot.saved_at, snapshot.machine_position
        );
    }

    /// Capture the persisted subset of the model
    pub fn snapshot(&self) -> MachineSnapshot {
        MachineSnapshot::capture(&self.state)
    }

    /// Forget the last probe result
    pub fn clear_last_probe(&mut self) {
        self.state.last_probe = None;
    }

    // ---- inbound ----

    /// Feed a raw text chunk from the link
    pub fn handle_inbound_text(&mut self, chunk: &str) {
        for line in self.framer.push(chunk) {
            self.handle_line(&line);
        }
    }

    /// A bridge frame that never enters the line protocol
    pub fn handle_auxiliary(&mut self, payload: serde_json::Value) {
        trace!("AUX {}", payload);
        self.events
            .push(CncEvent::Machine(MachineEvent::Auxiliary { payload }));
    }

    /// Classify and dispatch one complete line. Unparseable lines are logged
    /// and dropped.
    pub fn handle_line(&mut self, line: &str) {
        trace!("RX {}", line);
        match self.parser.parse(line) {
            Ok(Some(response)) => self.dispatch(response),
            Ok(None) => {}
            Err(e) => warn!("{}", e),
        }
    }

    fn dispatch(&mut self, response: GrblResponse) {
        match response {
            GrblResponse::Ok => self.on_ok(),
            GrblResponse::Error(code) => self.on_error(code),
            GrblResponse::Alarm(code) => self.on_alarm(code),
            GrblResponse::Status(report) => self.on_status(&report),
            GrblResponse::Probe(probe) => {
                debug!("Probe {} at {}", probe.success, probe.position);
                self.state.last_probe = Some(probe);
                self.events.push(CncEvent::Machine(MachineEvent::Probe(probe)));
            }
            GrblResponse::Setting { number, value } => self.on_setting(number, value),
            GrblResponse::ParserState(parser_state) => {
                if let Some(wcs) = parser_state.wcs {
                    self.state.active_wcs = wcs;
                }
                if let Some(tool) = parser_state.tool {
                    self.state.tool = tool;
                }
            }
            GrblResponse::Welcome(banner) => self.on_welcome(banner),
            GrblResponse::Version(version) => {
                debug!("Firmware version {}", version);
                self.state.firmware_version = Some(version);
            }
            GrblResponse::BuildOptions(options) => {
                debug!("Build options {}", options);
                self.state.build_options = Some(options);
            }
            GrblResponse::Feedback(text) | GrblResponse::Message(text) => {
                debug!("Message: {}", text);
                self.events
                    .push(CncEvent::Machine(MachineEvent::Message { text }));
            }
            GrblResponse::Auxiliary(payload) => self.handle_auxiliary(payload),
        }
    }

    fn on_ok(&mut self) {
        let Some(resolved) = self.correlator.resolve_ok() else {
            self.events.push(CncEvent::Command(CommandEvent::Ok {
                id: None,
                command: None,
            }));
            return;
        };

        if resolved.origin == OriginKind::Stream {
            if !self.stream.is_active() {
                debug!("Late ok for flushed stream line '{}'", resolved.command);
                return;
            }
            let mut sink = CoreSink::new(self.writer.as_deref(), &mut self.correlator);
            let pumped = self.stream.on_ack(&mut sink);
            self.collect_stream_events();
            if let Err(e) = pumped {
                self.abort_stream(&format!("write failed: {}", e));
            }
            return;
        }

        self.events.push(CncEvent::Command(CommandEvent::Ok {
            id: Some(resolved.id),
            command: Some(resolved.command),
        }));
    }

    fn on_error(&mut self, code: u32) {
        let message = decode_error(code);
        let resolved = self.correlator.reject_error(code);

        if let Some(resolved) = &resolved {
            if resolved.origin == OriginKind::Stream {
                if !self.stream.is_active() {
                    debug!("Late error:{} for flushed stream line", code);
                    return;
                }
                let mut sink = CoreSink::new(self.writer.as_deref(), &mut self.correlator);
                let pumped = self.stream.on_line_error(code, &message, &mut sink);
                self.collect_stream_events();
                if let Err(e) = pumped {
                    self.abort_stream(&format!("write failed: {}", e));
                }
                return;
            }
            warn!("error:{} ({}) for '{}'", code, message, resolved.command);
        } else {
            warn!("Unsolicited error:{} ({})", code, message);
        }

        self.events.push(CncEvent::Command(CommandEvent::Error {
            id: resolved.as_ref().map(|r| r.id),
            command: resolved.map(|r| r.command),
            code,
            message,
        }));
    }

    fn on_alarm(&mut self, code: u32) {
        let message = decode_alarm(code);
        let hint = alarm_recovery_hint(code);
        error!("ALARM:{} {} ({})", code, message, hint);

        let old = self.state.status;
        self.state.status = MachineStatus::Alarm;
        self.abort_stream(&format!("ALARM:{} {}", code, message));
        self.correlator.reject_all(|_| CommandError::Alarm {
            code,
            message: message.clone(),
        });

        if old != MachineStatus::Alarm {
            self.events.push(CncEvent::Machine(MachineEvent::StateChanged {
                old,
                new: MachineStatus::Alarm,
            }));
        }
        self.events.push(CncEvent::Machine(MachineEvent::Alarm {
            code,
            message,
            hint,
        }));
    }

    fn on_status(&mut self, report: &StatusReport) {
        let old = self.state.status;

        // Abort before the model changes so no observer sees the fault
        // status alongside an active stream.
        if report.status.is_fault() && self.stream.is_active() {
            error!("Machine entered {} while streaming", report.status);
            self.abort_stream(&format!("machine entered {}", report.status));
        }

        apply_status(&mut self.state, report);
        self.reconcile_restored();

        self.events.push(CncEvent::Machine(MachineEvent::Status(Box::new(
            self.state.clone(),
        ))));
        if old != self.state.status {
            debug!("State {} -> {}", old, self.state.status);
            self.events.push(CncEvent::Machine(MachineEvent::StateChanged {
                old,
                new: self.state.status,
            }));
        }
    }

    fn reconcile_restored(&mut self) {
        if !self.state.restored {
            return;
        }
        self.state.restored = false;
        let Some(restored) = self.restored_position.take() else {
            return;
        };
        let drift = restored.max_deviation(&self.state.machine_position);
        if drift > RECONCILE_TOLERANCE {
            let text = format!(
                "Machine position differs from saved snapshot by {:.3} (saved {}, live {})",
                drift, restored, self.state.machine_position
            );
            warn!("{}", text);
            self.events
                .push(CncEvent::Machine(MachineEvent::Message { text }));
        }
    }

    fn on_setting(&mut self, number: u16, value: String) {
        if self.derive_travel && (130..=132).contains(&number) {
            let axis = Axis::ALL[usize::from(number - 130)];
            self.state.travel.set(axis, parse_number(&value));
        }
        self.state.settings.insert(number, value.clone());
        self.events
            .push(CncEvent::Machine(MachineEvent::Setting { number, value }));
    }

    /// Forget collected `$N=` echoes ahead of a fresh `$$` dump
    pub fn clear_settings(&mut self) {
        self.state.settings.clear();
    }

    /// Record a setting the host wrote and the controller accepted
    pub fn record_setting(&mut self, number: u16, value: String) {
        self.on_setting(number, value);
    }

    fn on_welcome(&mut self, banner: String) {
        info!("Controller reset: {}", banner);
        self.state.banner = Some(banner.clone());
        self.abort_stream("controller reset");
        self.correlator.reject_all(|command| CommandError::Flushed {
            command: command.to_string(),
        });
        self.events
            .push(CncEvent::Machine(MachineEvent::Welcome { banner }));
    }

    // ---- outbound ----

    /// Install or remove the command fixer
    pub fn set_fixer(&mut self, fixer: Option<Arc<dyn CommandFixer>>) {
        self.gate.set_fixer(fixer);
    }

    fn write_tracked(&mut self, command: &str, origin: CommandOrigin) -> Result<u64> {
        let writer = self.writer.as_ref().ok_or(ConnectionError::NotConnected)?;
        trace!("TX {}", command);
        writer.write_line(command)?;
        let id = self.correlator.register(command, origin);
        self.events.push(CncEvent::Command(CommandEvent::Sent {
            id,
            command: command.to_string(),
        }));
        Ok(id)
    }

    fn block(&mut self, command: &str, err: ValidationError) -> Error {
        warn!("Refused '{}': {}", command, err);
        self.events.push(CncEvent::Safety(SafetyEvent::CommandBlocked {
            command: command.to_string(),
            reason: err.to_string(),
        }));
        err.into()
    }

    /// Submit a command. Realtime bytes go straight out; everything else is
    /// gated, written and correlated, or queued while offline.
    pub fn submit(
        &mut self,
        command: &str,
        options: SendOptions,
        reply: Option<ReplySender>,
        motion_locked: bool,
    ) -> Result<SendOutcome> {
        if let Some(realtime) = RealtimeCommand::parse(command) {
            let writer = self.writer.as_ref().ok_or(ConnectionError::NotConnected)?;
            writer.write_realtime(realtime)?;
            if let Some(tx) = reply {
                let _ = tx.send(Ok(CommandReply {
                    id: 0,
                    command: command.to_string(),
                    response: "realtime".to_string(),
                }));
            }
            return Ok(SendOutcome::Realtime);
        }

        let command = command.trim();
        if self.stream.is_busy() {
            return Err(StreamError::AlreadyActive.into());
        }

        if self.writer.is_none() {
            if options.queue_if_offline && self.offline_enabled && reply.is_none() {
                if let Err(e) = self.gate.check_structure(command) {
                    return Err(self.block(command, e));
                }
                let (id, evicted) = self.offline.push(command, options);
                if let Some(item) = evicted {
                    self.events.push(CncEvent::Command(CommandEvent::Evicted {
                        command: item.command,
                    }));
                }
                self.events.push(CncEvent::Command(CommandEvent::Queued {
                    id,
                    command: command.to_string(),
                    queue_len: self.offline.len(),
                }));
                return Ok(SendOutcome::Queued { id });
            }
            return Err(ConnectionError::NotConnected.into());
        }

        let gated = match self.gate.check(command, motion_locked) {
            Ok(gated) => gated,
            Err(e) => return Err(self.block(command, e)),
        };
        if let Some(original) = &gated.rewritten_from {
            self.events
                .push(CncEvent::Safety(SafetyEvent::CommandRewritten {
                    original: original.clone(),
                    fixed: gated.command.clone(),
                }));
        }
        for warning in &gated.warnings {
            warn!("'{}': {}", gated.command, warning);
            self.events.push(CncEvent::Safety(SafetyEvent::CommandWarning {
                command: gated.command.clone(),
                warning: warning.clone(),
            }));
        }
        for prefix in &gated.prefix {
            self.write_tracked(prefix, CommandOrigin::Prefix)?;
        }
        let id = self.write_tracked(&gated.command, CommandOrigin::Direct(reply))?;
        Ok(SendOutcome::Sent { id })
    }

    /// Drop a waiter that gave up. Returns its command if it was still in flight.
    pub fn expire(&mut self, id: u64) -> Option<String> {
        let command = self.correlator.expire(id)?;
        self.events.push(CncEvent::Command(CommandEvent::TimedOut {
            id,
            command: command.clone(),
        }));
        Some(command)
    }

    /// Fail every correlated command as flushed (soft reset, e-stop)
    pub fn flush_outstanding(&mut self) -> usize {
        self.correlator.reject_all(|command| CommandError::Flushed {
            command: command.to_string(),
        })
    }

    /// Commands in flight
    pub fn outstanding(&self) -> usize {
        self.correlator.len()
    }

    // ---- offline queue ----

    /// Next command to replay
    pub fn pop_offline(&mut self) -> Option<OfflineQueueItem> {
        self.offline.pop_front()
    }

    /// Commands waiting for a connection
    pub fn offline_len(&self) -> usize {
        self.offline.len()
    }

    /// Queued commands in replay order
    pub fn offline_commands(&self) -> Vec<String> {
        self.offline.commands()
    }

    // ---- streaming ----

    /// Gate every line and start a session
    pub fn start_stream(&mut self, lines: Vec<String>, motion_locked: bool) -> Result<StreamTicket> {
        if self.writer.is_none() {
            return Err(ConnectionError::NotConnected.into());
        }
        if self.stream.is_busy() {
            return Err(StreamError::AlreadyActive.into());
        }
        if motion_locked {
            return Err(ValidationError::MotionLocked {
                command: lines.first().cloned().unwrap_or_default(),
            }
            .into());
        }

        let mut prepared = Vec::with_capacity(lines.len());
        for (index, line) in lines.iter().enumerate() {
            let gated = self
                .gate
                .check(line, false)
                .map_err(|e| StreamError::InvalidLine {
                    index,
                    reason: e.to_string(),
                })?;
            if let Some(original) = gated.rewritten_from {
                self.events
                    .push(CncEvent::Safety(SafetyEvent::CommandRewritten {
                        original,
                        fixed: gated.command.clone(),
                    }));
            }
            for warning in gated.warnings {
                self.events.push(CncEvent::Safety(SafetyEvent::CommandWarning {
                    command: gated.command.clone(),
                    warning,
                }));
            }
            prepared.extend(gated.prefix);
            prepared.push(gated.command);
        }

        let ticket = self.stream.start(prepared)?;
        let mut sink = CoreSink::new(self.writer.as_deref(), &mut self.correlator);
        let pumped = self.stream.pump(&mut sink);
        self.collect_stream_events();
        if let Err(e) = pumped {
            self.abort_stream(&format!("write failed: {}", e));
        }
        Ok(ticket)
    }

    /// Feed hold
    pub fn pause_stream(&mut self) -> std::result::Result<(), StreamError> {
        let mut sink = CoreSink::new(self.writer.as_deref(), &mut self.correlator);
        let result = self.stream.pause(&mut sink);
        self.collect_stream_events();
        result
    }

    /// Cycle start
    pub fn resume_stream(&mut self) -> std::result::Result<(), StreamError> {
        let mut sink = CoreSink::new(self.writer.as_deref(), &mut self.correlator);
        let result = self.stream.resume(&mut sink);
        self.collect_stream_events();
        result
    }

    /// First half of a graceful stop
    pub fn begin_stop(&mut self) -> Option<usize> {
        let mut sink = CoreSink::new(self.writer.as_deref(), &mut self.correlator);
        let dropped = self.stream.begin_stop(&mut sink);
        self.collect_stream_events();
        dropped
    }

    /// Second half of a graceful stop: soft reset
    pub fn finish_stop(&mut self) {
        let mut sink = CoreSink::new(self.writer.as_deref(), &mut self.correlator);
        self.stream.finish_stop(&mut sink);
        self.collect_stream_events();
    }

    /// Immediate abort; sends nothing
    pub fn abort_stream(&mut self, reason: &str) -> Option<usize> {
        let dropped = self.stream.abort(reason);
        self.collect_stream_events();
        dropped
    }

    /// Streaming state
    pub fn stream_state(&self) -> StreamState {
        self.stream.state()
    }

    /// Whether a session is streaming or paused
    pub fn is_streaming(&self) -> bool {
        self.stream.is_active()
    }

    /// Bytes of the receive buffer in use
    pub fn stream_bytes_used(&self) -> usize {
        self.stream.bytes_used()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluidcnc_core::StreamEvent;
    use parking_lot::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct Wire {
        lines: Mutex<Vec<String>>,
        realtime: Mutex<Vec<RealtimeCommand>>,
    }

    impl LinkWriter for Wire {
        fn write_line(&self, line: &str) -> std::result::Result<(), ConnectionError> {
            self.lines.lock().push(line.to_string());
            Ok(())
        }

        fn write_realtime(
            &self,
            command: RealtimeCommand,
        ) -> std::result::Result<(), ConnectionError> {
            self.realtime.lock().push(command);
            Ok(())
        }

        fn close(&self) {}

        fn is_open(&self) -> bool {
            true
        }

        fn name(&self) -> String {
            "wire".to_string()
        }
    }

    fn connected() -> (ProtocolCore, Arc<Wire>) {
        let mut core = ProtocolCore::default();
        let wire = Arc::new(Wire::default());
        core.attach(wire.clone());
        (core, wire)
    }

    #[test]
    fn test_send_and_ok() {
        let (mut core, wire) = connected();
        let (tx, mut rx) = oneshot::channel();
        let outcome = core
            .submit("G0 X10", SendOptions::default(), Some(tx), false)
            .expect("sent");
        assert_eq!(outcome, SendOutcome::Sent { id: 1 });
        assert_eq!(*wire.lines.lock(), vec!["G0 X10"]);

        core.handle_inbound_text("<Idle|MPos:0,0,0|FS:0,0>\nok\n");
        let reply = rx.try_recv().expect("resolved").expect("ok");
        assert_eq!(reply.command, "G0 X10");
    }

    #[test]
    fn test_realtime_bypasses_correlator() {
        let (mut core, wire) = connected();
        let (tx, mut rx) = oneshot::channel();
        let outcome = core
            .submit("?", SendOptions::default(), Some(tx), false)
            .expect("sent");
        assert_eq!(outcome, SendOutcome::Realtime);
        assert_eq!(core.outstanding(), 0);
        assert_eq!(*wire.realtime.lock(), vec![RealtimeCommand::StatusReport]);
        assert_eq!(rx.try_recv().expect("resolved").expect("ok").id, 0);
    }

    #[test]
    fn test_alarm_aborts_before_state_event() {
        let (mut core, wire) = connected();
        let _ticket = core
            .start_stream(vec!["G1 X1 F100".into(), "G1 X2 F100".into()], false)
            .expect("started");
        assert_eq!(wire.lines.lock().len(), 2);
        core.take_events();

        core.handle_line("ALARM:1");
        assert!(!core.is_streaming());
        let events = core.take_events();
        let aborted = events
            .iter()
            .position(|e| matches!(e, CncEvent::Stream(StreamEvent::Aborted { .. })))
            .expect("aborted");
        let changed = events
            .iter()
            .position(|e| matches!(e, CncEvent::Machine(MachineEvent::StateChanged { .. })))
            .expect("state changed");
        assert!(aborted < changed);
        assert_eq!(core.outstanding(), 0);
    }

    #[test]
    fn test_door_status_aborts_stream() {
        let (mut core, _wire) = connected();
        let _ticket = core
            .start_stream(vec!["G1 X1 F100".into()], false)
            .expect("started");
        core.handle_line("<Door:1|MPos:0,0,0>");
        assert_eq!(core.stream_state(), StreamState::Aborted);
        assert_eq!(core.state().status, MachineStatus::Door);
    }

    #[test]
    fn test_offline_queue_when_detached() {
        let mut core = ProtocolCore::default();
        let outcome = core
            .submit("G0 X1", SendOptions::default(), None, false)
            .expect("queued");
        assert_eq!(outcome, SendOutcome::Queued { id: 1 });
        assert!(core
            .submit("G0 X1", SendOptions::no_queue(), None, false)
            .is_err());
        assert!(core
            .submit("G0 X1.2.3", SendOptions::default(), None, false)
            .is_err());
        assert_eq!(core.offline_commands(), vec!["G0 X1"]);
    }

    #[test]
    fn test_settings_feed_travel() {
        let (mut core, _wire) = connected();
        core.handle_inbound_text("$130=300.000\n$132=80\n");
        assert_eq!(core.state().travel.x, Some(300.0));
        assert_eq!(core.state().travel.z, Some(80.0));
        assert_eq!(
            core.state().settings.get(&130).map(String::as_str),
            Some("300.000")
        );
    }

    #[test]
    fn test_welcome_flushes_outstanding() {
        let (mut core, _wire) = connected();
        let (tx, mut rx) = oneshot::channel();
        core.submit("G4 P1", SendOptions::default(), Some(tx), false)
            .expect("sent");
        core.handle_line("GrblHAL 1.1f ['$' or '$HELP' for help]");
        assert!(matches!(
            rx.try_recv().expect("rejected"),
            Err(CommandError::Flushed { .. })
        ));
    }

    #[test]
    fn test_restored_snapshot_reconciled() {
        let (mut core, _wire) = connected();
        let mut saved = MachineState::new();
        saved.set_machine_position(Position::new(-10.0, -10.0, -1.0));
        core.restore_snapshot(&MachineSnapshot::capture(&saved));
        assert!(core.state().restored);
        core.take_events();

        core.handle_line("<Idle|MPos:-12.000,-10.000,-1.000>");
        assert!(!core.state().restored);
        let events = core.take_events();
        assert!(events
            .iter()
            .any(|e| matches!(e, CncEvent::Machine(MachineEvent::Message { text }) if text.contains("snapshot"))));
    }
}

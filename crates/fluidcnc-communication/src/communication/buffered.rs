//! Character-counted streaming with flow control and acknowledgment tracking
//!
//! Implements the grbl streaming protocol: the host mirrors the controller's
//! receive buffer by counting the bytes of every line sent but not yet
//! answered, and only sends the next line when it fits.
//!
//! # Features
//! - Program normalization (comments, blank lines, `%` markers stripped)
//! - Sender buffer tracking against a fixed byte budget
//! - FIFO acknowledgment tracking
//! - Pause/resume, graceful stop and immediate abort
//! - Watch-based progress and a one-shot outcome per session

use fluidcnc_core::{ConnectionError, StreamError, StreamEvent};
use std::collections::VecDeque;
use std::fmt;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

use crate::firmware::grbl::realtime::RealtimeCommand;
use crate::safety::strip_comments;

/// Where the engine sends lines and realtime bytes
pub trait LineSink {
    /// Transmit one streamed line
    fn send_line(&mut self, line: &str) -> Result<(), ConnectionError>;

    /// Transmit a realtime byte
    fn send_realtime(&mut self, command: RealtimeCommand) -> Result<(), ConnectionError>;
}

/// Streaming lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamState {
    /// Nothing streaming
    #[default]
    Idle,
    /// Sending lines as budget allows
    Streaming,
    /// Feed hold issued; no new lines sent
    Paused,
    /// Stop requested; waiting to issue the soft reset
    Stopping,
    /// Last session finished normally
    Completed,
    /// Last session was cut short by a fault
    Aborted,
}

/// Inputs to the streaming state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTrigger {
    /// New session
    Start,
    /// Feed hold
    Pause,
    /// Cycle start
    Resume,
    /// Graceful user stop
    Stop,
    /// Settle delay after a stop elapsed
    Settled,
    /// Every line sent and answered
    Finish,
    /// Fault
    Abort,
}

impl StreamState {
    /// Transition table. `None` means the trigger does not apply in this state.
    pub fn transition(self, trigger: StreamTrigger) -> Option<StreamState> {
        use StreamState::*;
        use StreamTrigger::*;
        match (self, trigger) {
            (Idle | Completed | Aborted, Start) => Some(Streaming),
            (Streaming, Pause) => Some(Paused),
            (Paused, Resume) => Some(Streaming),
            (Streaming | Paused, Stop) => Some(Stopping),
            (Stopping, Settled) => Some(Idle),
            (Streaming, Finish) => Some(Completed),
            (Streaming | Paused, Abort) => Some(Aborted),
            _ => None,
        }
    }

    /// A session is running (streaming or paused)
    pub fn is_active(self) -> bool {
        matches!(self, StreamState::Streaming | StreamState::Paused)
    }

    /// A session is running or still shutting down
    pub fn is_busy(self) -> bool {
        self.is_active() || self == StreamState::Stopping
    }
}

impl fmt::Display for StreamState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StreamState::Idle => "idle",
            StreamState::Streaming => "streaming",
            StreamState::Paused => "paused",
            StreamState::Stopping => "stopping",
            StreamState::Completed => "completed",
            StreamState::Aborted => "aborted",
        };
        write!(f, "{}", name)
    }
}

/// Progress snapshot published after every send and acknowledgment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StreamProgress {
    /// Session id
    pub session: u64,
    /// Lines handed to the transport (`index`)
    pub sent: usize,
    /// Lines answered with `ok` or `error`
    pub acknowledged: usize,
    /// Lines in the program
    pub total: usize,
    /// Bytes currently counted against the controller buffer
    pub bytes_used: usize,
    /// Engine state
    pub state: StreamState,
}

impl StreamProgress {
    /// Fraction of lines sent, 0.0..=1.0
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.sent as f64 / self.total as f64
    }
}

/// How a session ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamOutcome {
    /// Every line sent and answered
    Completed {
        /// Lines answered with `ok`
        lines_executed: usize,
        /// Lines answered with `error:N`
        lines_failed: usize,
    },
    /// Stopped by the user
    Stopped {
        /// Sent-but-unanswered lines dropped
        dropped: usize,
    },
    /// Cut short by a fault
    Aborted {
        /// Fault description
        reason: String,
    },
}

/// Returned by [`StreamingEngine::start`]
#[derive(Debug)]
pub struct StreamTicket {
    /// Session id
    pub session: u64,
    /// Progress updates
    pub progress: watch::Receiver<StreamProgress>,
    /// Resolves once when the session ends
    pub outcome: oneshot::Receiver<StreamOutcome>,
}

/// Split a program into sendable lines: comments (`;...` and `(...)`), `%`
/// markers and blank lines are dropped, whitespace is trimmed.
pub fn normalize_program<I, S>(lines: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    lines
        .into_iter()
        .flat_map(|chunk| {
            chunk
                .as_ref()
                .lines()
                .map(|line| strip_comments(line).trim().to_string())
                .collect::<Vec<_>>()
        })
        .filter(|line| !line.is_empty() && line != "%")
        .collect()
}

struct StreamSession {
    id: u64,
    lines: Vec<String>,
    index: usize,
    pending: VecDeque<usize>,
    bytes_used: usize,
    executed: usize,
    failed: usize,
    progress: watch::Sender<StreamProgress>,
    outcome: Option<oneshot::Sender<StreamOutcome>>,
}

impl StreamSession {
    fn acknowledged(&self) -> usize {
        self.executed + self.failed
    }

    fn finish(&mut self, outcome: StreamOutcome) {
        if let Some(tx) = self.outcome.take() {
            let _ = tx.send(outcome);
        }
    }
}

/// Flow-controlled streaming engine. Sans-IO: every send goes through a
/// [`LineSink`] supplied by the caller.
pub struct StreamingEngine {
    buffer_size: usize,
    state: StreamState,
    session: Option<StreamSession>,
    next_session: u64,
    events: Vec<StreamEvent>,
}

impl StreamingEngine {
    /// Create an engine for a controller with `buffer_size` bytes of receive buffer
    pub fn new(buffer_size: usize) -> Self {
        Self {
            buffer_size,
            state: StreamState::Idle,
            session: None,
            next_session: 1,
            events: Vec::new(),
        }
    }

    /// Receive buffer size in bytes
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Current state
    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Streaming or paused
    pub fn is_active(&self) -> bool {
        self.state.is_active()
    }

    /// Streaming, paused or stopping
    pub fn is_busy(&self) -> bool {
        self.state.is_busy()
    }

    /// Bytes counted against the controller buffer
    pub fn bytes_used(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.bytes_used)
    }

    /// Sum of `len + 1` over pending lines
    pub fn pending_bytes(&self) -> usize {
        self.session
            .as_ref()
            .map_or(0, |s| s.pending.iter().sum())
    }

    /// Lines sent and not yet answered
    pub fn pending_len(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.pending.len())
    }

    /// Active session id
    pub fn session_id(&self) -> Option<u64> {
        self.session.as_ref().map(|s| s.id)
    }

    /// Current buffer usage as a percentage
    pub fn buffer_usage_percent(&self) -> u32 {
        if self.buffer_size == 0 {
            return 0;
        }
        ((self.bytes_used() as f64 / self.buffer_size as f64) * 100.0) as u32
    }

    /// Take the events produced since the last call
    pub fn drain_events(&mut self) -> Vec<StreamEvent> {
        std::mem::take(&mut self.events)
    }

    fn apply(&mut self, trigger: StreamTrigger) -> bool {
        match self.state.transition(trigger) {
            Some(next) => {
                debug!("Stream {} -> {} on {:?}", self.state, next, trigger);
                self.state = next;
                true
            }
            None => false,
        }
    }

    fn publish_progress(&mut self) {
        let state = self.state;
        if let Some(session) = &self.session {
            let progress = StreamProgress {
                session: session.id,
                sent: session.index,
                acknowledged: session.acknowledged(),
                total: session.lines.len(),
                bytes_used: session.bytes_used,
                state,
            };
            session.progress.send_replace(progress);
            self.events.push(StreamEvent::Progress {
                session: session.id,
                sent: progress.sent,
                acknowledged: progress.acknowledged,
                total: progress.total,
            });
        }
    }

    /// Start a session. Nothing is sent until [`StreamingEngine::pump`].
    pub fn start(&mut self, lines: Vec<String>) -> Result<StreamTicket, StreamError> {
        if self.state.is_busy() {
            return Err(StreamError::AlreadyActive);
        }
        if lines.is_empty() {
            return Err(StreamError::Empty);
        }
        if let Some((index, line)) = lines
            .iter()
            .enumerate()
            .find(|(_, line)| line.len() + 1 > self.buffer_size)
        {
            return Err(StreamError::InvalidLine {
                index,
                reason: format!(
                    "{} bytes do not fit a {} byte receive buffer",
                    line.len() + 1,
                    self.buffer_size
                ),
            });
        }

        let id = self.next_session;
        self.next_session += 1;
        let total = lines.len();
        let (progress_tx, progress_rx) = watch::channel(StreamProgress {
            session: id,
            total,
            state: StreamState::Streaming,
            ..Default::default()
        });
        let (outcome_tx, outcome_rx) = oneshot::channel();

        self.apply(StreamTrigger::Start);
        self.session = Some(StreamSession {
            id,
            lines,
            index: 0,
            pending: VecDeque::new(),
            bytes_used: 0,
            executed: 0,
            failed: 0,
            progress: progress_tx,
            outcome: Some(outcome_tx),
        });
        info!("Stream {} started ({} lines)", id, total);
        self.events.push(StreamEvent::Started { session: id, total });

        Ok(StreamTicket {
            session: id,
            progress: progress_rx,
            outcome: outcome_rx,
        })
    }

    fn has_room_in_buffer(&self, session: &StreamSession, line_len: usize) -> bool {
        session.bytes_used + line_len + 1 <= self.buffer_size
    }

    /// Send as many lines as the budget allows. Returns the number sent.
    pub fn pump(&mut self, sink: &mut dyn LineSink) -> Result<usize, ConnectionError> {
        let mut sent = 0;
        loop {
            if self.state != StreamState::Streaming {
                break;
            }
            let Some(session) = self.session.as_ref() else {
                break;
            };
            let Some(line) = session.lines.get(session.index) else {
                break;
            };
            if !self.has_room_in_buffer(session, line.len()) {
                break;
            }

            let cost = line.len() + 1;
            sink.send_line(line)?;

            if let Some(session) = self.session.as_mut() {
                session.pending.push_back(cost);
                session.bytes_used += cost;
                session.index += 1;
            }
            sent += 1;
            self.publish_progress();
        }
        self.check_complete();
        Ok(sent)
    }

    fn pop_pending(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        match session.pending.pop_front() {
            Some(cost) => {
                session.bytes_used = session.bytes_used.saturating_sub(cost);
                true
            }
            None => {
                warn!("Stream acknowledgment with nothing pending");
                false
            }
        }
    }

    /// An `ok` answered the oldest pending line
    pub fn on_ack(&mut self, sink: &mut dyn LineSink) -> Result<usize, ConnectionError> {
        if !self.state.is_active() || !self.pop_pending() {
            return Ok(0);
        }
        if let Some(session) = self.session.as_mut() {
            session.executed += 1;
        }
        self.publish_progress();
        self.pump(sink)
    }

    /// An `error:N` answered the oldest pending line. Streaming continues.
    pub fn on_line_error(
        &mut self,
        code: u32,
        message: &str,
        sink: &mut dyn LineSink,
    ) -> Result<usize, ConnectionError> {
        if !self.state.is_active() || !self.pop_pending() {
            return Ok(0);
        }
        if let Some(session) = self.session.as_mut() {
            session.failed += 1;
            let line = session
                .index
                .checked_sub(session.pending.len() + 1)
                .and_then(|i| session.lines.get(i))
                .cloned()
                .unwrap_or_default();
            warn!("Stream line '{}' failed: error:{} {}", line, code, message);
            self.events.push(StreamEvent::LineFailed {
                session: session.id,
                line,
                code,
                message: message.to_string(),
            });
        }
        self.publish_progress();
        self.pump(sink)
    }

    fn check_complete(&mut self) {
        if self.state != StreamState::Streaming {
            return;
        }
        let done = self
            .session
            .as_ref()
            .is_some_and(|s| s.index == s.lines.len() && s.pending.is_empty());
        if !done || !self.apply(StreamTrigger::Finish) {
            return;
        }
        if let Some(mut session) = self.session.take() {
            info!(
                "Stream {} completed: {} executed, {} failed",
                session.id, session.executed, session.failed
            );
            session.progress.send_modify(|p| p.state = StreamState::Completed);
            session.finish(StreamOutcome::Completed {
                lines_executed: session.executed,
                lines_failed: session.failed,
            });
            self.events.push(StreamEvent::Completed {
                session: session.id,
                lines_executed: session.executed,
                lines_failed: session.failed,
            });
        }
    }

    /// Feed hold: stop dequeuing, keep pending
    pub fn pause(&mut self, sink: &mut dyn LineSink) -> Result<(), StreamError> {
        if self.state != StreamState::Streaming {
            return Err(StreamError::NotActive);
        }
        if let Err(e) = sink.send_realtime(RealtimeCommand::FeedHold) {
            warn!("Feed hold not delivered: {}", e);
        }
        self.apply(StreamTrigger::Pause);
        self.publish_progress();
        if let Some(id) = self.session_id() {
            self.events.push(StreamEvent::Paused { session: id });
        }
        Ok(())
    }

    /// Cycle start: resume dequeuing
    pub fn resume(&mut self, sink: &mut dyn LineSink) -> Result<(), StreamError> {
        if self.state != StreamState::Paused {
            return Err(StreamError::NotActive);
        }
        if let Err(e) = sink.send_realtime(RealtimeCommand::CycleStart) {
            warn!("Cycle start not delivered: {}", e);
        }
        self.apply(StreamTrigger::Resume);
        if let Some(id) = self.session_id() {
            self.events.push(StreamEvent::Resumed { session: id });
        }
        self.publish_progress();
        if let Err(e) = self.pump(sink) {
            self.abort(&format!("write failed: {}", e));
        }
        Ok(())
    }

    fn clear_session(&mut self, final_state: StreamState) -> Option<StreamSession> {
        let mut session = self.session.take()?;
        session.progress.send_modify(|p| {
            p.state = final_state;
            p.bytes_used = 0;
        });
        session.pending.clear();
        session.bytes_used = 0;
        Some(session)
    }

    /// Graceful stop, first half. Clears all queued and pending state at once
    /// and sends a feed hold. Returns the number of dropped pending lines, or
    /// `None` when there was nothing to stop.
    pub fn begin_stop(&mut self, sink: &mut dyn LineSink) -> Option<usize> {
        if !self.apply(StreamTrigger::Stop) {
            return None;
        }
        let mut session = self.clear_session(StreamState::Stopping)?;
        let dropped = session.index - session.acknowledged();
        info!("Stream {} stopping ({} pending dropped)", session.id, dropped);
        session.finish(StreamOutcome::Stopped { dropped });
        self.events.push(StreamEvent::Stopped {
            session: session.id,
            dropped,
        });
        if let Err(e) = sink.send_realtime(RealtimeCommand::FeedHold) {
            warn!("Feed hold not delivered during stop: {}", e);
        }
        Some(dropped)
    }

    /// Graceful stop, second half: soft reset to flush the controller
    pub fn finish_stop(&mut self, sink: &mut dyn LineSink) {
        if !self.apply(StreamTrigger::Settled) {
            return;
        }
        if let Err(e) = sink.send_realtime(RealtimeCommand::SoftReset) {
            warn!("Soft reset not delivered after stop: {}", e);
        }
    }

    /// Immediate abort. Sends nothing. Returns the number of dropped pending
    /// lines, or `None` when nothing was active.
    pub fn abort(&mut self, reason: &str) -> Option<usize> {
        if !self.apply(StreamTrigger::Abort) {
            return None;
        }
        let mut session = self.clear_session(StreamState::Aborted)?;
        let dropped = session.index - session.acknowledged();
        warn!("Stream {} aborted: {}", session.id, reason);
        session.finish(StreamOutcome::Aborted {
            reason: reason.to_string(),
        });
        self.events.push(StreamEvent::Aborted {
            session: session.id,
            reason: reason.to_string(),
            dropped,
        });
        Some(dropped)
    }
}

impl fmt::Debug for StreamingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamingEngine")
            .field("buffer_size", &self.buffer_size)
            .field("state", &self.state)
            .field("bytes_used", &self.bytes_used())
            .field("pending", &self.pending_len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct VecSink {
        lines: Vec<String>,
        realtime: Vec<RealtimeCommand>,
    }

    impl LineSink for VecSink {
        fn send_line(&mut self, line: &str) -> Result<(), ConnectionError> {
            self.lines.push(line.to_string());
            Ok(())
        }

        fn send_realtime(&mut self, command: RealtimeCommand) -> Result<(), ConnectionError> {
            self.realtime.push(command);
            Ok(())
        }
    }

    #[test]
    fn test_normalize_program() {
        let program = "%\n; header\nG21 (mm)\n\n  G0 X1 ; rapid\n(only comment)\nM30\n%";
        assert_eq!(normalize_program([program]), vec!["G21", "G0 X1", "M30"]);
    }

    #[test]
    fn test_transition_table() {
        assert_eq!(
            StreamState::Idle.transition(StreamTrigger::Start),
            Some(StreamState::Streaming)
        );
        assert_eq!(StreamState::Idle.transition(StreamTrigger::Pause), None);
        assert_eq!(StreamState::Stopping.transition(StreamTrigger::Abort), None);
        assert_eq!(
            StreamState::Paused.transition(StreamTrigger::Stop),
            Some(StreamState::Stopping)
        );
        assert_eq!(StreamState::Stopping.transition(StreamTrigger::Start), None);
    }

    #[test]
    fn test_budget_limits_sends() {
        let mut engine = StreamingEngine::new(20);
        let mut sink = VecSink::default();
        // 9 + 1 bytes each: two fit, the third waits
        let lines = vec!["G1 X1 Y1".to_string(); 3]
            .into_iter()
            .map(|l| format!("{} ", l))
            .collect();
        engine.start(lines).expect("start");
        assert_eq!(engine.pump(&mut sink).expect("pump"), 2);
        assert_eq!(engine.bytes_used(), 20);
        assert_eq!(engine.on_ack(&mut sink).expect("ack"), 1);
        assert_eq!(engine.bytes_used(), 20);
        assert_eq!(engine.pending_bytes(), engine.bytes_used());
    }

    #[test]
    fn test_completion_fires_once() {
        let mut engine = StreamingEngine::new(128);
        let mut sink = VecSink::default();
        let mut ticket = engine
            .start(vec!["G0 X1".to_string(), "G0 X2".to_string()])
            .expect("start");
        engine.pump(&mut sink).expect("pump");
        engine.on_ack(&mut sink).expect("ack");
        engine.on_line_error(20, "Unsupported G-code", &mut sink).expect("err");
        assert_eq!(engine.state(), StreamState::Completed);
        assert_eq!(
            ticket.outcome.try_recv().expect("outcome"),
            StreamOutcome::Completed {
                lines_executed: 1,
                lines_failed: 1
            }
        );
        // Late acks are ignored
        assert_eq!(engine.on_ack(&mut sink).expect("ack"), 0);
        let completions = engine
            .drain_events()
            .into_iter()
            .filter(|e| matches!(e, StreamEvent::Completed { .. }))
            .count();
        assert_eq!(completions, 1);
    }

    #[test]
    fn test_oversized_line_rejected() {
        let mut engine = StreamingEngine::new(8);
        assert!(matches!(
            engine.start(vec!["G0 X1".to_string(), "G1 X100 Y100".to_string()]),
            Err(StreamError::InvalidLine { index: 1, .. })
        ));
        assert_eq!(engine.state(), StreamState::Idle);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut engine = StreamingEngine::new(128);
        let mut sink = VecSink::default();
        let mut ticket = engine
            .start(vec!["G0 X1".to_string(); 5])
            .expect("start");
        engine.pump(&mut sink).expect("pump");
        assert_eq!(engine.begin_stop(&mut sink), Some(5));
        assert_eq!(engine.bytes_used(), 0);
        assert_eq!(engine.begin_stop(&mut sink), None);
        assert_eq!(engine.pending_len(), 0);
        assert_eq!(sink.realtime, vec![RealtimeCommand::FeedHold]);
        assert_eq!(
            ticket.outcome.try_recv().expect("outcome"),
            StreamOutcome::Stopped { dropped: 5 }
        );

        engine.finish_stop(&mut sink);
        assert_eq!(engine.state(), StreamState::Idle);
        assert_eq!(
            sink.realtime,
            vec![RealtimeCommand::FeedHold, RealtimeCommand::SoftReset]
        );
    }

    #[test]
    fn test_abort_sends_nothing() {
        let mut engine = StreamingEngine::new(128);
        let mut sink = VecSink::default();
        engine.start(vec!["G0 X1".to_string(); 3]).expect("start");
        engine.pump(&mut sink).expect("pump");
        assert_eq!(engine.abort("ALARM:1"), Some(3));
        assert_eq!(engine.abort("ALARM:1"), None);
        assert!(sink.realtime.is_empty());
        assert!(!engine.is_active());
        assert_eq!(engine.pump(&mut sink).expect("pump"), 0);
    }

    #[test]
    fn test_pause_holds_dequeue() {
        let mut engine = StreamingEngine::new(12);
        let mut sink = VecSink::default();
        engine.start(vec!["G0 X1".to_string(); 4]).expect("start");
        engine.pump(&mut sink).expect("pump");
        assert_eq!(sink.lines.len(), 2);
        engine.pause(&mut sink).expect("pause");
        engine.on_ack(&mut sink).expect("ack");
        assert_eq!(sink.lines.len(), 2);
        assert_eq!(engine.pending_len(), 1);
        engine.resume(&mut sink).expect("resume");
        assert_eq!(sink.lines.len(), 3);
        assert_eq!(
            sink.realtime,
            vec![RealtimeCommand::FeedHold, RealtimeCommand::CycleStart]
        );
    }
}

//! grblHAL Controller
//!
//! The command API collaborators use. Owns the transport, the protocol core,
//! the emergency-stop panel and every background task of a live link:
//! the reader, heartbeat or watchdog, status polling, snapshot saving,
//! offline replay and reconnection.

use fluidcnc_core::{
    Axis, CncEvent, CommandError, CommandEvent, ConnectionError, ConnectionEvent,
    DisconnectReason, Error, EventBus, LockoutError, MachineState, MachineStatus, ProbeResult,
    Result, SafetyEvent, SpindleDirection, StreamError, TransportKind, ValidationError,
};
use fluidcnc_settings::Config;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant};
use tracing::{debug, error, info, warn};

use super::correlator::CommandReply;
use super::protocol::{ProtocolCore, ProtocolOptions, SendOutcome};
use super::realtime::{OverrideAdjust, RapidOverride, RealtimeCommand};
use crate::communication::{
    build_transport, normalize_program, Inbound, LinkWriter, SendOptions, StreamOutcome,
    StreamProgress, StreamState, Transport, TransportLink,
};
use crate::firmware::connection_watch::{
    ActivityClock, ConnectionWatchConfig, HeartbeatAction, Watchdog, WatchdogAction,
};
use crate::firmware::reconnect::ReconnectPolicy;
use crate::persistence::SnapshotStore;
use crate::safety::{CommandFixer, EstopPanel, EstopReport, LinkKey};

/// Coolant output selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoolantCommand {
    /// M8
    Flood,
    /// M7
    Mist,
    /// M9
    Off,
}

impl CoolantCommand {
    /// G-code word
    pub fn gcode(self) -> &'static str {
        match self {
            CoolantCommand::Flood => "M8",
            CoolantCommand::Mist => "M7",
            CoolantCommand::Off => "M9",
        }
    }
}

/// Controller identification from the welcome banner and `$I`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FirmwareInfo {
    /// Last welcome banner
    pub banner: Option<String>,
    /// `[VER:]` line
    pub version: Option<String>,
    /// `[OPT:]` line
    pub options: Option<String>,
}

struct ActiveLink {
    writer: Arc<dyn LinkWriter>,
    estop_key: LinkKey,
    tasks: Vec<JoinHandle<()>>,
}

#[derive(Default)]
struct LinkSlot {
    generation: u64,
    active: Option<ActiveLink>,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Inner {
    config: Config,
    transport: Arc<dyn Transport>,
    bus: Arc<EventBus>,
    core: Mutex<ProtocolCore>,
    estop: EstopPanel,
    reconnect: Mutex<ReconnectPolicy>,
    snapshots: Option<SnapshotStore>,
    watch: ConnectionWatchConfig,
    link: Mutex<LinkSlot>,
}

/// grblHAL controller handle. Cheap to clone; every clone drives the same link.
#[derive(Clone)]
pub struct CncController {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for CncController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CncController")
            .field("endpoint", &self.inner.transport.endpoint())
            .field("core", &*self.inner.core.lock())
            .field("estop", &self.inner.estop)
            .finish()
    }
}

/// Handle to a running stream session
pub struct StreamHandle {
    controller: CncController,
    session: u64,
    progress: watch::Receiver<StreamProgress>,
    outcome: oneshot::Receiver<StreamOutcome>,
}

impl std::fmt::Debug for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamHandle")
            .field("session", &self.session)
            .field("progress", &*self.progress.borrow())
            .finish()
    }
}

impl StreamHandle {
    /// Session id
    pub fn session(&self) -> u64 {
        self.session
    }

    /// Latest progress
    pub fn progress(&self) -> StreamProgress {
        *self.progress.borrow()
    }

    /// Progress updates for a UI
    pub fn progress_receiver(&self) -> watch::Receiver<StreamProgress> {
        self.progress.clone()
    }

    /// Feed hold
    pub fn pause(&self) -> Result<()> {
        self.controller.pause_stream()
    }

    /// Cycle start
    pub fn resume(&self) -> Result<()> {
        self.controller.resume_stream()
    }

    /// Graceful stop
    pub fn stop(&self) -> Option<usize> {
        self.controller.stop_stream()
    }

    /// Wait for the session to end
    pub async fn wait(self) -> StreamOutcome {
        self.outcome.await.unwrap_or_else(|_| StreamOutcome::Aborted {
            reason: "stream dropped".to_string(),
        })
    }
}

impl Inner {
    fn publish(&self, event: CncEvent) {
        let _ = self.bus.publish(event);
    }

    fn publish_all(&self, events: Vec<CncEvent>) {
        for event in events {
            self.publish(event);
        }
    }

    fn is_connected(&self) -> bool {
        self.core.lock().is_connected()
    }

    fn save_snapshot(&self) {
        let Some(store) = &self.snapshots else {
            return;
        };
        let snapshot = {
            let core = self.core.lock();
            let state = core.state();
            if state.status == MachineStatus::Unknown || state.restored {
                return;
            }
            core.snapshot()
        };
        if let Err(e) = store.save(&snapshot) {
            warn!("Failed to save snapshot: {}", e);
        }
    }

    async fn connect_once(inner: &Arc<Inner>) -> Result<()> {
        let endpoint = inner.transport.endpoint();
        let transport = inner.transport.kind();
        info!("Connecting to {} ({})", endpoint, transport);
        inner.publish(CncEvent::Connection(ConnectionEvent::Connecting {
            endpoint: endpoint.clone(),
            transport,
        }));

        match inner.transport.connect().await {
            Ok(link) => {
                Inner::install(inner, link);
                Ok(())
            }
            Err(e) => {
                warn!("Connection to {} failed: {}", endpoint, e);
                inner.publish(CncEvent::Connection(ConnectionEvent::ConnectionFailed {
                    endpoint,
                    error: e.to_string(),
                }));
                Err(e.into())
            }
        }
    }

    fn install(inner: &Arc<Inner>, link: TransportLink) {
        let TransportLink {
            writer,
            inbound,
            activity,
        } = link;
        let kind = inner.transport.kind();
        let endpoint = inner.transport.endpoint();

        let snapshot = match &inner.snapshots {
            Some(store) => store.load_fresh(inner.config.persistence.max_age()),
            None => None,
        };
        let events = {
            let mut core = inner.core.lock();
            if let Some(snapshot) = &snapshot {
                if core.state().status == MachineStatus::Unknown {
                    core.restore_snapshot(snapshot);
                }
            }
            core.attach(Arc::clone(&writer));
            core.take_events()
        };
        let estop_key = inner.estop.register(Arc::clone(&writer));
        inner.reconnect.lock().reset();

        let generation = {
            let mut slot = inner.link.lock();
            slot.generation += 1;
            slot.active = Some(ActiveLink {
                writer: Arc::clone(&writer),
                estop_key,
                tasks: Vec::new(),
            });
            slot.generation
        };

        let mut tasks = vec![tokio::spawn(Inner::read_loop(
            Arc::clone(inner),
            generation,
            inbound,
        ))];
        match kind {
            TransportKind::WebSocket => tasks.push(tokio::spawn(Inner::heartbeat_loop(
                Arc::clone(inner),
                generation,
                Arc::clone(&writer),
                activity.clone(),
            ))),
            TransportKind::Serial => tasks.push(tokio::spawn(Inner::watchdog_loop(
                Arc::clone(inner),
                generation,
                Arc::clone(&writer),
                activity.clone(),
            ))),
            TransportKind::Simulated => {}
        }
        if kind != TransportKind::WebSocket {
            if let Some(period) = inner.config.supervisor.status_poll_interval() {
                tasks.push(tokio::spawn(Inner::poll_loop(Arc::clone(&writer), period)));
            }
        }
        if inner.snapshots.is_some() {
            tasks.push(tokio::spawn(Inner::snapshot_loop(Arc::clone(inner))));
        }

        inner.publish_all(events);
        info!("Connected to {} ({})", endpoint, kind);
        inner.publish(CncEvent::Connection(ConnectionEvent::Connected {
            endpoint,
            transport: kind,
        }));

        if inner.core.lock().offline_len() > 0 {
            tasks.push(tokio::spawn(Inner::replay_offline(Arc::clone(inner))));
        }

        let mut slot = inner.link.lock();
        let current = slot.generation == generation;
        match slot.active.as_mut() {
            Some(active) if current => active.tasks.extend(tasks),
            _ => {
                debug!("Link {} closed during setup", generation);
                for task in tasks {
                    task.abort();
                }
            }
        }
    }

    fn handle_link_lost(inner: &Arc<Inner>, generation: u64, reason: DisconnectReason) {
        let active = {
            let mut slot = inner.link.lock();
            if slot.generation != generation {
                return;
            }
            slot.active.take()
        };
        let Some(active) = active else {
            return;
        };

        inner.estop.unregister(active.estop_key);
        let text = match &reason {
            DisconnectReason::UserRequested => "disconnected".to_string(),
            DisconnectReason::ClosedByPeer => "closed by peer".to_string(),
            DisconnectReason::ConnectionLost(r) => r.clone(),
            DisconnectReason::HeartbeatTimeout => "heartbeat timeout".to_string(),
            DisconnectReason::WatchdogFault => "watchdog fault".to_string(),
        };
        let events = {
            let mut core = inner.core.lock();
            core.on_link_lost(&text);
            core.take_events()
        };
        active.writer.close();
        inner.save_snapshot();

        let endpoint = inner.transport.endpoint();
        if reason == DisconnectReason::UserRequested {
            info!("Disconnected from {}", endpoint);
        } else {
            warn!("Link to {} lost: {}", endpoint, text);
        }
        inner.publish_all(events);
        inner.publish(CncEvent::Connection(ConnectionEvent::Disconnected {
            endpoint,
            reason: reason.clone(),
        }));

        for task in active.tasks {
            task.abort();
        }

        if reason.is_unclean()
            && inner.transport.kind() == TransportKind::WebSocket
            && inner.config.connection.auto_reconnect
        {
            let task = tokio::spawn(Inner::reconnect_loop(Arc::clone(inner)));
            inner.link.lock().reconnect_task = Some(task);
        }
    }

    async fn read_loop(
        inner: Arc<Inner>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
    ) {
        while let Some(item) = inbound.recv().await {
            match item {
                Inbound::Text(text) => {
                    let events = {
                        let mut core = inner.core.lock();
                        core.handle_inbound_text(&text);
                        core.take_events()
                    };
                    inner.publish_all(events);
                }
                Inbound::Auxiliary(payload) => {
                    let events = {
                        let mut core = inner.core.lock();
                        core.handle_auxiliary(payload);
                        core.take_events()
                    };
                    inner.publish_all(events);
                }
                Inbound::Closed { clean, reason } => {
                    let reason = if clean {
                        DisconnectReason::ClosedByPeer
                    } else {
                        DisconnectReason::ConnectionLost(reason)
                    };
                    Inner::handle_link_lost(&inner, generation, reason);
                    return;
                }
            }
        }
        Inner::handle_link_lost(
            &inner,
            generation,
            DisconnectReason::ConnectionLost("reader ended".to_string()),
        );
    }

    async fn heartbeat_loop(
        inner: Arc<Inner>,
        generation: u64,
        writer: Arc<dyn LinkWriter>,
        activity: ActivityClock,
    ) {
        let period = inner.watch.heartbeat_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match inner.watch.heartbeat(activity.elapsed()) {
                HeartbeatAction::SendProbe => {
                    if let Err(e) = writer.write_realtime(RealtimeCommand::StatusReport) {
                        debug!("Heartbeat probe not sent: {}", e);
                    }
                }
                HeartbeatAction::ForceClose => {
                    warn!(
                        "No data for {}ms, closing link",
                        activity.elapsed().as_millis()
                    );
                    Inner::handle_link_lost(&inner, generation, DisconnectReason::HeartbeatTimeout);
                    return;
                }
            }
        }
    }

    async fn watchdog_loop(
        inner: Arc<Inner>,
        generation: u64,
        writer: Arc<dyn LinkWriter>,
        activity: ActivityClock,
    ) {
        let period = inner.watch.check_interval;
        let mut watchdog = Watchdog::new(inner.watch);
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let streaming = inner.core.lock().is_streaming();
            match watchdog.check(&activity, streaming) {
                WatchdogAction::None => {}
                WatchdogAction::Probe => {
                    debug!("Link idle, probing status");
                    if let Err(e) = writer.write_realtime(RealtimeCommand::StatusReport) {
                        error!("Status probe failed on idle link: {}", e);
                        Inner::handle_link_lost(
                            &inner,
                            generation,
                            DisconnectReason::ConnectionLost(format!("status probe failed: {}", e)),
                        );
                        return;
                    }
                }
                WatchdogAction::Fault => {
                    Inner::watchdog_fault(&inner, generation, activity.elapsed());
                    return;
                }
            }
        }
    }

    fn watchdog_fault(inner: &Arc<Inner>, generation: u64, silence: Duration) {
        let message = format!(
            "No data from controller for {:.1}s while streaming",
            silence.as_secs_f64()
        );
        error!("Watchdog: {}", message);

        let events = {
            let mut core = inner.core.lock();
            core.abort_stream(&format!("watchdog: {}", message));
            core.take_events()
        };
        inner.publish_all(events);
        inner.publish(CncEvent::Safety(SafetyEvent::WatchdogFault {
            message: message.clone(),
        }));
        inner.publish(CncEvent::Safety(SafetyEvent::OperatorWarning {
            message: "Controller stopped responding mid-job. The machine may still be moving; check it physically before continuing.".to_string(),
        }));
        Inner::handle_link_lost(inner, generation, DisconnectReason::WatchdogFault);
    }

    async fn poll_loop(writer: Arc<dyn LinkWriter>, period: Duration) {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            if let Err(e) = writer.write_realtime(RealtimeCommand::StatusReport) {
                debug!("Status poll not sent: {}", e);
            }
        }
    }

    async fn snapshot_loop(inner: Arc<Inner>) {
        let period = inner.config.persistence.save_interval();
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            inner.save_snapshot();
        }
    }

    async fn replay_offline(inner: Arc<Inner>) {
        let delay = inner.config.offline_queue.replay_delay();
        loop {
            let locked = inner.estop.is_locked();
            let (item, result, events) = {
                let mut core = inner.core.lock();
                if !core.is_connected() {
                    return;
                }
                let Some(item) = core.pop_offline() else {
                    return;
                };
                let result = core.submit(&item.command, item.options, None, locked);
                (item, result, core.take_events())
            };
            inner.publish_all(events);
            match result {
                Ok(_) => debug!("Replayed '{}'", item.command),
                Err(e) => {
                    warn!("Replay of '{}' failed: {}", item.command, e);
                    inner.publish(CncEvent::Command(CommandEvent::ReplayFailed {
                        command: item.command,
                        error: e.to_string(),
                    }));
                }
            }
            tokio::time::sleep(delay).await;
        }
    }

    async fn reconnect_loop(inner: Arc<Inner>) {
        let _ = Inner::reconnect_with_backoff(&inner).await;
    }

    async fn reconnect_with_backoff(inner: &Arc<Inner>) -> Result<()> {
        loop {
            let next = inner.reconnect.lock().next_delay();
            let Some((attempt, delay)) = next else {
                let attempts = inner.reconnect.lock().attempts();
                error!("Reconnect gave up after {} attempts", attempts);
                inner.publish(CncEvent::Connection(ConnectionEvent::ReconnectExhausted {
                    attempts,
                }));
                return Err(ConnectionError::ReconnectExhausted { attempts }.into());
            };
            warn!("Reconnect attempt {} in {}ms", attempt, delay.as_millis());
            inner.publish(CncEvent::Connection(ConnectionEvent::Reconnecting {
                attempt,
                delay_ms: delay.as_millis() as u64,
            }));
            tokio::time::sleep(delay).await;
            if inner.is_connected() || Inner::connect_once(inner).await.is_ok() {
                return Ok(());
            }
        }
    }
}

impl CncController {
    /// Controller over an explicit transport and bus
    pub fn new(config: Config, transport: Arc<dyn Transport>, bus: Arc<EventBus>) -> Self {
        let options = ProtocolOptions {
            rx_buffer_size: config.streaming.rx_buffer_size,
            offline_queue: config.offline_queue.enabled,
            offline_capacity: config.offline_queue.capacity,
            derive_travel: config.safety.derive_limits_from_settings,
        };
        let snapshots = if config.persistence.enabled {
            config.persistence.resolved_path().map(SnapshotStore::new)
        } else {
            None
        };
        let inner = Inner {
            core: Mutex::new(ProtocolCore::new(options)),
            estop: EstopPanel::new(),
            reconnect: Mutex::new(ReconnectPolicy::from_settings(&config.supervisor)),
            watch: ConnectionWatchConfig::from_settings(&config.supervisor),
            link: Mutex::new(LinkSlot::default()),
            snapshots,
            transport,
            bus,
            config,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Controller over the transport selected in the configuration
    pub fn from_config(config: Config) -> Self {
        let transport = build_transport(&config);
        Self::new(config, transport, Arc::new(EventBus::new()))
    }

    // ---- lifecycle ----

    /// Open the link. A pending automatic reconnect is cancelled first.
    pub async fn connect(&self) -> Result<()> {
        if let Some(task) = self.inner.link.lock().reconnect_task.take() {
            task.abort();
        }
        if self.is_connected() {
            return Ok(());
        }
        self.inner.reconnect.lock().reset();
        Inner::connect_once(&self.inner).await
    }

    /// Connect, retrying with the reconnect backoff. Fails with
    /// [`ConnectionError::ReconnectExhausted`] once the attempt budget is spent.
    pub async fn connect_with_retry(&self) -> Result<()> {
        if let Some(task) = self.inner.link.lock().reconnect_task.take() {
            task.abort();
        }
        if self.is_connected() {
            return Ok(());
        }
        self.inner.reconnect.lock().reset();
        if Inner::connect_once(&self.inner).await.is_ok() {
            return Ok(());
        }
        Inner::reconnect_with_backoff(&self.inner).await
    }

    /// Close the link, fail everything in flight and stop every timer
    pub async fn disconnect(&self) -> Result<()> {
        let generation = {
            let mut slot = self.inner.link.lock();
            if let Some(task) = slot.reconnect_task.take() {
                task.abort();
            }
            slot.generation
        };
        Inner::handle_link_lost(&self.inner, generation, DisconnectReason::UserRequested);
        Ok(())
    }

    /// Disconnect and persist the machine snapshot
    pub async fn shutdown(&self) -> Result<()> {
        self.disconnect().await?;
        self.inner.save_snapshot();
        Ok(())
    }

    /// Whether a link is open
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Event bus shared with collaborators
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.inner.bus)
    }

    /// Active configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Copy of the machine model
    pub fn machine_state(&self) -> MachineState {
        self.inner.core.lock().state().clone()
    }

    /// Streaming state
    pub fn stream_state(&self) -> StreamState {
        self.inner.core.lock().stream_state()
    }

    /// Commands waiting for a connection
    pub fn offline_queue_len(&self) -> usize {
        self.inner.core.lock().offline_len()
    }

    /// Queued commands in replay order
    pub fn offline_commands(&self) -> Vec<String> {
        self.inner.core.lock().offline_commands()
    }

    /// Install or remove the external command fixer
    pub fn set_fixer(&self, fixer: Option<Arc<dyn CommandFixer>>) {
        self.inner.core.lock().set_fixer(fixer);
    }

    // ---- commands ----

    /// Send without waiting for the answer
    pub fn send(&self, command: &str, options: SendOptions) -> Result<SendOutcome> {
        let locked = self.inner.estop.is_locked();
        let (result, events) = {
            let mut core = self.inner.core.lock();
            let result = core.submit(command, options, None, locked);
            (result, core.take_events())
        };
        self.inner.publish_all(events);
        result
    }

    /// Send and wait for the correlated `ok`/`error:N`. Realtime bytes
    /// resolve as soon as they are written.
    pub async fn send_and_wait(&self, command: &str, timeout: Duration) -> Result<CommandReply> {
        let (tx, mut rx) = oneshot::channel();
        let locked = self.inner.estop.is_locked();
        let (result, events) = {
            let mut core = self.inner.core.lock();
            let result = core.submit(command, SendOptions::no_queue(), Some(tx), locked);
            (result, core.take_events())
        };
        self.inner.publish_all(events);
        let id = match result? {
            SendOutcome::Sent { id } => id,
            SendOutcome::Realtime | SendOutcome::Queued { .. } => 0,
        };

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(reply)) => reply.map_err(Error::from),
            Ok(Err(_)) => Err(CommandError::ConnectionLost {
                command: command.to_string(),
            }
            .into()),
            Err(_) => {
                let (expired, events) = {
                    let mut core = self.inner.core.lock();
                    let expired = core.expire(id);
                    (expired, core.take_events())
                };
                self.inner.publish_all(events);
                if expired.is_none() {
                    if let Ok(reply) = rx.try_recv() {
                        return reply.map_err(Error::from);
                    }
                }
                Err(CommandError::Timeout {
                    command: command.trim().to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into())
            }
        }
    }

    /// Send and wait with the configured default timeout
    pub async fn execute(&self, command: &str) -> Result<CommandReply> {
        self.send_and_wait(command, self.inner.config.streaming.command_timeout())
            .await
    }

    fn realtime(&self, command: RealtimeCommand) -> Result<()> {
        let writer = self
            .inner
            .core
            .lock()
            .writer()
            .ok_or(ConnectionError::NotConnected)?;
        writer.write_realtime(command)?;
        Ok(())
    }

    // ---- streaming ----

    /// Normalize a program and stream it under character-counted flow control
    pub fn stream_gcode<I, S>(&self, lines: I) -> Result<StreamHandle>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let program = normalize_program(lines);
        if program.is_empty() {
            return Err(StreamError::Empty.into());
        }
        let locked = self.inner.estop.is_locked();
        let (result, events) = {
            let mut core = self.inner.core.lock();
            let result = core.start_stream(program, locked);
            (result, core.take_events())
        };
        self.inner.publish_all(events);
        let ticket = result?;
        Ok(StreamHandle {
            controller: self.clone(),
            session: ticket.session,
            progress: ticket.progress,
            outcome: ticket.outcome,
        })
    }

    /// Feed hold the active stream
    pub fn pause_stream(&self) -> Result<()> {
        let (result, events) = {
            let mut core = self.inner.core.lock();
            (core.pause_stream(), core.take_events())
        };
        self.inner.publish_all(events);
        result.map_err(Error::from)
    }

    /// Resume a paused stream
    pub fn resume_stream(&self) -> Result<()> {
        let (result, events) = {
            let mut core = self.inner.core.lock();
            (core.resume_stream(), core.take_events())
        };
        self.inner.publish_all(events);
        result.map_err(Error::from)
    }

    /// Graceful stop: clear everything now, feed hold, then soft reset after
    /// the settle delay. Returns the dropped pending count on the first call
    /// and `None` afterwards.
    pub fn stop_stream(&self) -> Option<usize> {
        let (dropped, events) = {
            let mut core = self.inner.core.lock();
            (core.begin_stop(), core.take_events())
        };
        self.inner.publish_all(events);

        if dropped.is_some() {
            let inner = Arc::clone(&self.inner);
            let settle = inner.config.streaming.stop_settle();
            tokio::spawn(async move {
                tokio::time::sleep(settle).await;
                let events = {
                    let mut core = inner.core.lock();
                    core.finish_stop();
                    core.take_events()
                };
                inner.publish_all(events);
            });
        }
        dropped
    }

    // ---- machine helpers ----

    fn check_soft_limit(&self, axis: Axis, distance: f64) -> Result<()> {
        let (current, travel) = {
            let core = self.inner.core.lock();
            let state = core.state();
            (state.machine_position.get(axis), state.travel)
        };
        let safety = &self.inner.config.safety;
        let bounds = match &safety.soft_limits {
            Some(limits) => Some(limits.bounds(axis)),
            None if safety.derive_limits_from_settings => travel.envelope(axis),
            None => None,
        };
        let Some((min, max)) = bounds else {
            return Ok(());
        };

        let target = current + distance;
        if target < min || target > max {
            warn!(
                "Soft limit: {} target {:.3} outside [{:.3}, {:.3}]",
                axis, target, min, max
            );
            self.inner
                .publish(CncEvent::Safety(SafetyEvent::SoftLimitBlocked {
                    axis: axis.letter(),
                    target,
                    min,
                    max,
                }));
            return Err(ValidationError::SoftLimit {
                axis: axis.letter(),
                target,
                min,
                max,
            }
            .into());
        }
        Ok(())
    }

    fn check_motion_args(distance: f64, feed: f64) -> Result<()> {
        if !distance.is_finite() || distance == 0.0 {
            return Err(ValidationError::InvalidArgument {
                reason: format!("distance must be finite and non-zero, got {}", distance),
            }
            .into());
        }
        if !feed.is_finite() || feed <= 0.0 {
            return Err(ValidationError::InvalidArgument {
                reason: format!("feed must be positive, got {}", feed),
            }
            .into());
        }
        Ok(())
    }

    /// Relative jog, checked against the soft limits
    pub fn jog(&self, axis: Axis, distance: f64, feed: f64) -> Result<SendOutcome> {
        Self::check_motion_args(distance, feed)?;
        self.check_soft_limit(axis, distance)?;
        let command = format!("$J=G91 G21 {}{:.3} F{:.0}", axis.letter(), distance, feed);
        self.send(&command, SendOptions::no_queue())
    }

    /// Cancel an active jog
    pub fn jog_cancel(&self) -> Result<()> {
        self.realtime(RealtimeCommand::JogCancel)
    }

    /// Home all axes, or only the given ones
    pub async fn home(&self, axes: &[Axis]) -> Result<CommandReply> {
        let mut command = "$H".to_string();
        for axis in axes {
            command.push(axis.letter());
        }
        self.send_and_wait(&command, self.inner.config.streaming.long_command_timeout())
            .await
    }

    /// Clear an alarm lock (`$X`)
    pub async fn unlock(&self) -> Result<CommandReply> {
        self.execute("$X").await
    }

    /// Dump every firmware setting (`$$`)
    pub async fn read_settings(&self) -> Result<BTreeMap<u16, String>> {
        self.inner.core.lock().clear_settings();
        self.execute("$$").await?;
        Ok(self.inner.core.lock().state().settings.clone())
    }

    /// Write one firmware setting (`$N=value`) through the gate
    pub async fn write_setting(&self, number: u16, value: &str) -> Result<CommandReply> {
        let value = value.trim();
        if value.is_empty() || value.contains(['\n', '\r']) {
            return Err(ValidationError::InvalidArgument {
                reason: format!("bad value for ${}", number),
            }
            .into());
        }
        let reply = self.execute(&format!("${}={}", number, value)).await?;
        info!("Setting ${} = {}", number, value);
        let events = {
            let mut core = self.inner.core.lock();
            core.record_setting(number, value.to_string());
            core.take_events()
        };
        self.inner.publish_all(events);
        Ok(reply)
    }

    /// Query build info (`$I`) and report it with the last banner
    pub async fn firmware_info(&self) -> Result<FirmwareInfo> {
        self.execute("$I").await?;
        let core = self.inner.core.lock();
        let state = core.state();
        Ok(FirmwareInfo {
            banner: state.banner.clone(),
            version: state.firmware_version.clone(),
            options: state.build_options.clone(),
        })
    }

    /// Soft reset (Ctrl-X)
    pub fn soft_reset(&self) -> Result<()> {
        self.realtime(RealtimeCommand::SoftReset)
    }

    /// Feed hold
    pub fn feed_hold(&self) -> Result<()> {
        self.realtime(RealtimeCommand::FeedHold)
    }

    /// Cycle start
    pub fn cycle_start(&self) -> Result<()> {
        self.realtime(RealtimeCommand::CycleStart)
    }

    /// Start the spindle
    pub async fn spindle_on(&self, rpm: f64, direction: SpindleDirection) -> Result<CommandReply> {
        if !rpm.is_finite() || rpm < 0.0 {
            return Err(ValidationError::InvalidArgument {
                reason: format!("spindle speed must be non-negative, got {}", rpm),
            }
            .into());
        }
        let word = match direction {
            SpindleDirection::Clockwise => "M3",
            SpindleDirection::CounterClockwise => "M4",
            SpindleDirection::Off => return self.spindle_off().await,
        };
        self.execute(&format!("{} S{:.0}", word, rpm)).await
    }

    /// Stop the spindle
    pub async fn spindle_off(&self) -> Result<CommandReply> {
        self.execute("M5").await
    }

    /// Switch coolant
    pub async fn coolant(&self, command: CoolantCommand) -> Result<CommandReply> {
        self.execute(command.gcode()).await
    }

    /// Single-axis probe cycle (`G38.2`). Returns the `[PRB:...]` result.
    pub async fn probe(&self, axis: Axis, distance: f64, feed: f64) -> Result<ProbeResult> {
        Self::check_motion_args(distance, feed)?;
        self.inner.core.lock().clear_last_probe();

        let command = format!("G91 G38.2 {}{:.3} F{:.0}", axis.letter(), distance, feed);
        self.send_and_wait(&command, self.inner.config.streaming.long_command_timeout())
            .await?;
        if let Err(e) = self.execute("G90").await {
            warn!("Could not restore absolute mode after probing: {}", e);
        }

        self.inner
            .core
            .lock()
            .state()
            .last_probe
            .ok_or_else(|| Error::other("probe cycle finished without a probe report"))
    }

    /// Adjust the feed override
    pub fn feed_override(&self, adjust: OverrideAdjust) -> Result<()> {
        self.realtime(adjust.feed())
    }

    /// Adjust the spindle override
    pub fn spindle_override(&self, adjust: OverrideAdjust) -> Result<()> {
        self.realtime(adjust.spindle())
    }

    /// Select a rapid override
    pub fn rapid_override(&self, rapid: RapidOverride) -> Result<()> {
        self.realtime(rapid.command())
    }

    // ---- emergency stop ----

    /// Feed hold and soft reset on every live link, bypassing the gate, the
    /// correlator and the connection state. Engages the motion lockout.
    pub fn emergency_stop(&self) -> EstopReport {
        let report = self.inner.estop.emergency_stop();
        if report.already_engaged {
            return report;
        }

        if report.delivered() {
            error!("EMERGENCY STOP sent to {}", report.delivered_to.join(", "));
            self.inner
                .publish(CncEvent::Safety(SafetyEvent::EmergencyStop {
                    delivered_to: report.delivered_to.clone(),
                }));
        } else {
            let reason = report.failure_reason();
            error!("EMERGENCY STOP FAILED: {}", reason);
            self.inner
                .publish(CncEvent::Safety(SafetyEvent::EmergencyStopFailed { reason }));
        }

        let events = {
            let mut core = self.inner.core.lock();
            core.abort_stream("emergency stop");
            core.flush_outstanding();
            core.take_events()
        };
        self.inner.publish_all(events);
        report
    }

    /// Whether jog and spindle-on are locked out
    pub fn is_motion_locked(&self) -> bool {
        self.inner.estop.is_locked()
    }

    /// Clear the lockout after the minimum hold time, from a resting state
    pub fn clear_motion_lockout(&self) -> std::result::Result<(), LockoutError> {
        let status = self.inner.core.lock().state().status;
        self.inner
            .estop
            .clear(status, self.inner.config.safety.lockout_min())?;
        self.inner.publish(CncEvent::Safety(SafetyEvent::LockoutCleared));
        Ok(())
    }
}

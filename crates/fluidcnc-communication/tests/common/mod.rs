//! Shared fixtures: a transport whose link is driven by the test

#![allow(dead_code)]

use async_trait::async_trait;
use fluidcnc_communication::communication::{Inbound, LinkWriter, Transport, TransportLink};
use fluidcnc_communication::firmware::connection_watch::ActivityClock;
use fluidcnc_communication::RealtimeCommand;
use fluidcnc_core::{CncEvent, ConnectionError, EventBus, EventFilter, TransportKind};
use fluidcnc_settings::Config;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One open scripted link
pub struct ScriptedLink {
    inbound: mpsc::UnboundedSender<Inbound>,
    activity: ActivityClock,
    lines: Mutex<Vec<String>>,
    realtime: Mutex<Vec<u8>>,
    open: AtomicBool,
}

impl ScriptedLink {
    /// Deliver controller output
    pub fn push(&self, text: &str) {
        self.activity.touch();
        let _ = self.inbound.send(Inbound::Text(text.to_string()));
    }

    /// Simulate a pulled cable
    pub fn drop_link(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.inbound.send(Inbound::Closed {
            clean: false,
            reason: "cable pulled".to_string(),
        });
    }

    /// Lines written so far
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().clone()
    }

    /// Realtime bytes written so far
    pub fn realtime(&self) -> Vec<u8> {
        self.realtime.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        !self.open.load(Ordering::SeqCst)
    }
}

impl LinkWriter for ScriptedLink {
    fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::NotConnected);
        }
        self.lines.lock().push(line.to_string());
        Ok(())
    }

    fn write_realtime(&self, command: RealtimeCommand) -> Result<(), ConnectionError> {
        if self.is_closed() {
            return Err(ConnectionError::NotConnected);
        }
        self.realtime.lock().push(command.byte());
        Ok(())
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.inbound.send(Inbound::Closed {
                clean: true,
                reason: "closed locally".to_string(),
            });
        }
    }

    fn is_open(&self) -> bool {
        !self.is_closed()
    }

    fn name(&self) -> String {
        "scripted".to_string()
    }
}

#[derive(Default)]
struct ScriptState {
    failures_left: u32,
    connects: u32,
    current: Option<Arc<ScriptedLink>>,
}

/// Transport handing out [`ScriptedLink`]s
#[derive(Clone)]
pub struct ScriptedTransport {
    kind: TransportKind,
    state: Arc<Mutex<ScriptState>>,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind) -> Self {
        Self {
            kind,
            state: Arc::new(Mutex::new(ScriptState::default())),
        }
    }

    /// Fail the next `n` connect attempts
    pub fn fail_next(&self, n: u32) {
        self.state.lock().failures_left = n;
    }

    /// Successful connects so far
    pub fn connects(&self) -> u32 {
        self.state.lock().connects
    }

    /// Most recently opened link
    pub fn link(&self) -> Arc<ScriptedLink> {
        self.state
            .lock()
            .current
            .clone()
            .expect("no link opened yet")
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    fn endpoint(&self) -> String {
        "scripted".to_string()
    }

    async fn connect(&self) -> Result<TransportLink, ConnectionError> {
        let mut state = self.state.lock();
        if state.failures_left > 0 {
            state.failures_left -= 1;
            return Err(ConnectionError::FailedToOpen {
                endpoint: "scripted".to_string(),
                reason: "refused".to_string(),
            });
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let activity = ActivityClock::new();
        let link = Arc::new(ScriptedLink {
            inbound: tx,
            activity: activity.clone(),
            lines: Mutex::new(Vec::new()),
            realtime: Mutex::new(Vec::new()),
            open: AtomicBool::new(true),
        });
        state.connects += 1;
        state.current = Some(Arc::clone(&link));
        Ok(TransportLink {
            writer: link,
            inbound: rx,
            activity,
        })
    }
}

/// Defaults with polling and persistence off
pub fn test_config(kind: TransportKind) -> Config {
    let mut config = Config::default();
    config.connection.transport = kind;
    config.supervisor.status_poll_interval_ms = 0;
    config.persistence.enabled = false;
    config
}

/// Collects every published event
#[derive(Clone, Default)]
pub struct EventLog {
    events: Arc<Mutex<Vec<CncEvent>>>,
}

impl EventLog {
    pub fn attach(bus: &EventBus) -> Self {
        let log = Self::default();
        let sink = Arc::clone(&log.events);
        bus.subscribe(EventFilter::All, move |event| sink.lock().push(event));
        log
    }

    pub fn events(&self) -> Vec<CncEvent> {
        self.events.lock().clone()
    }

    pub fn any(&self, predicate: impl Fn(&CncEvent) -> bool) -> bool {
        self.events.lock().iter().any(predicate)
    }

    pub fn count(&self, predicate: impl Fn(&CncEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| predicate(e)).count()
    }
}

/// Let spawned tasks run
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

//! # Transports
//!
//! Every transport opens a [`TransportLink`]: a cloneable writer handle plus
//! an inbound channel of raw text chunks. The rest of the link layer never
//! knows which variant it is talking to.
//!
//! - [`websocket::WebSocketTransport`] speaks the JSON bridge protocol
//! - [`serial::SerialTransport`] talks to the controller directly
//! - [`simulated::SimulatedTransport`] is an in-process firmware model

pub mod buffered;
pub mod offline_queue;
pub mod serial;
pub mod simulated;
pub mod websocket;

use async_trait::async_trait;
use fluidcnc_core::{ConnectionError, TransportKind};
use fluidcnc_settings::Config;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::firmware::connection_watch::ActivityClock;
use crate::firmware::grbl::realtime::RealtimeCommand;

pub use buffered::{
    normalize_program, LineSink, StreamOutcome, StreamProgress, StreamState, StreamTicket,
    StreamTrigger, StreamingEngine,
};
pub use offline_queue::{OfflineQueue, OfflineQueueItem};
pub use serial::{list_ports, SerialPortInfo, SerialTransport};
pub use simulated::SimulatedTransport;
pub use websocket::WebSocketTransport;

/// Item read from a link
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    /// Raw protocol text; may hold partial or several lines
    Text(String),
    /// A framed bridge message, kept apart from protocol lines
    Auxiliary(serde_json::Value),
    /// The link closed
    Closed {
        /// Closed on purpose by either side
        clean: bool,
        /// Close reason
        reason: String,
    },
}

/// Options for a non-realtime send
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendOptions {
    /// Queue the command for replay when the link is down
    pub queue_if_offline: bool,
}

impl Default for SendOptions {
    fn default() -> Self {
        Self {
            queue_if_offline: true,
        }
    }
}

impl SendOptions {
    /// Fail immediately when disconnected
    pub fn no_queue() -> Self {
        Self {
            queue_if_offline: false,
        }
    }
}

/// Write half of an open link. Writes never block on the controller.
pub trait LinkWriter: Send + Sync {
    /// Send one protocol line (the terminator is added by the transport)
    fn write_line(&self, line: &str) -> Result<(), ConnectionError>;

    /// Send one realtime byte
    fn write_realtime(&self, command: RealtimeCommand) -> Result<(), ConnectionError>;

    /// Close the link. Idempotent.
    fn close(&self);

    /// Whether the link is still open
    fn is_open(&self) -> bool;

    /// Human-readable link name for logs and e-stop reports
    fn name(&self) -> String;

    /// Send a raw realtime byte, refusing anything outside the whitelist
    fn write_realtime_byte(&self, byte: u8) -> Result<(), ConnectionError> {
        match RealtimeCommand::from_byte(byte) {
            Some(command) => self.write_realtime(command),
            None => Err(ConnectionError::InvalidParameters {
                reason: format!("0x{:02X} is not a realtime command", byte),
            }),
        }
    }
}

/// An open link
pub struct TransportLink {
    /// Write handle
    pub writer: Arc<dyn LinkWriter>,
    /// Inbound chunks, ending with [`Inbound::Closed`]
    pub inbound: mpsc::UnboundedReceiver<Inbound>,
    /// Touched on every read
    pub activity: ActivityClock,
}

impl std::fmt::Debug for TransportLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportLink")
            .field("writer", &self.writer.name())
            .finish_non_exhaustive()
    }
}

/// Something that can open a link to a controller
#[async_trait]
pub trait Transport: Send + Sync {
    /// Transport variant
    fn kind(&self) -> TransportKind;

    /// URL or port name
    fn endpoint(&self) -> String;

    /// Open the link. Failures are returned, never panicked.
    async fn connect(&self) -> Result<TransportLink, ConnectionError>;
}

/// Build the transport selected in the configuration
pub fn build_transport(config: &Config) -> Arc<dyn Transport> {
    let connection = &config.connection;
    match connection.transport {
        TransportKind::WebSocket => Arc::new(WebSocketTransport::new(
            connection.websocket_url.clone(),
            connection.connect_timeout(),
        )),
        TransportKind::Serial => Arc::new(SerialTransport::new(
            connection.serial_port.clone(),
            connection.baud_rate,
        )),
        TransportKind::Simulated => Arc::new(SimulatedTransport::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Recorder {
        bytes: Mutex<Vec<u8>>,
    }

    impl LinkWriter for Recorder {
        fn write_line(&self, _line: &str) -> Result<(), ConnectionError> {
            Ok(())
        }

        fn write_realtime(&self, command: RealtimeCommand) -> Result<(), ConnectionError> {
            self.bytes.lock().push(command.byte());
            Ok(())
        }

        fn close(&self) {}

        fn is_open(&self) -> bool {
            true
        }

        fn name(&self) -> String {
            "recorder".to_string()
        }
    }

    #[test]
    fn test_realtime_whitelist_enforced() {
        let writer = Recorder::default();
        assert!(writer.write_realtime_byte(b'!').is_ok());
        assert!(writer.write_realtime_byte(0x18).is_ok());
        assert!(matches!(
            writer.write_realtime_byte(b'G'),
            Err(ConnectionError::InvalidParameters { .. })
        ));
        assert_eq!(*writer.bytes.lock(), vec![b'!', 0x18]);
    }

    #[test]
    fn test_build_transport_follows_config() {
        let mut config = Config::default();
        config.connection.transport = TransportKind::Serial;
        config.connection.serial_port = "/dev/ttyACM0".to_string();
        let transport = build_transport(&config);
        assert_eq!(transport.kind(), TransportKind::Serial);
        assert_eq!(transport.endpoint(), "/dev/ttyACM0");

        config.connection.transport = TransportKind::Simulated;
        assert_eq!(build_transport(&config).kind(), TransportKind::Simulated);
    }
}

//! # FluidCNC Communication
//!
//! grblHAL link layer: WebSocket, serial and simulated transports, response
//! parsing, command correlation, character-counted streaming, the safety
//! gate, the emergency-stop path and link supervision.
//!
//! [`CncController`] is the entry point.

pub mod communication;
pub mod firmware;
pub mod persistence;
pub mod safety;

pub use communication::{
    build_transport, list_ports, normalize_program, Inbound, LinkWriter, SendOptions,
    SerialPortInfo, SerialTransport, SimulatedTransport, StreamOutcome, StreamProgress,
    StreamState, Transport, TransportLink, WebSocketTransport,
};

pub use firmware::grbl::{
    CncController, CommandReply, CoolantCommand, FirmwareInfo, OverrideAdjust, RapidOverride,
    RealtimeCommand, SendOutcome, StreamHandle,
};

pub use persistence::{MachineSnapshot, SnapshotStore};

pub use safety::{CommandFixer, EstopReport, FixerVerdict};

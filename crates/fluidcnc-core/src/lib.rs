//! # FluidCNC Core
//!
//! Core types shared by every FluidCNC crate: the error taxonomy, the typed
//! event bus, and the machine-state data model.

pub mod data;
pub mod error;
pub mod event_bus;

pub use data::{
    Axis, BufferState, CoolantState, MachineState, MachineStatus, Overrides, Position,
    ProbeResult, SpindleDirection, TransportKind, TravelLimits,
};

pub use error::{
    CommandError, ConnectionError, Error, LockoutError, ProtocolError, Result, StreamError,
    ValidationError,
};

pub use event_bus::{
    CncEvent, CommandEvent, ConnectionEvent, DisconnectReason, EventBus, EventCategory,
    EventFilter, MachineEvent, SafetyEvent, StreamEvent, SubscriptionId,
};

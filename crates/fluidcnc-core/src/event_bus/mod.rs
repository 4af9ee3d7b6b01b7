//! # Event Bus Module
//!
//! Typed publish/subscribe hub between the machine link and its
//! collaborators (UI, analytics, loggers).
//!
//! ## Overview
//!
//! - Publishers emit typed [`CncEvent`]s without knowing subscribers
//! - Subscribers filter by [`EventCategory`] and receive events of interest
//! - Supports both sync handlers and async broadcast receivers
//!
//! ## Usage
//!
//! ```rust,ignore
//! use fluidcnc_core::event_bus::{CncEvent, EventBus, EventCategory, EventFilter, MachineEvent};
//! use std::sync::Arc;
//!
//! let bus = Arc::new(EventBus::new());
//! let subscription = bus.subscribe(
//!     EventFilter::Categories(vec![EventCategory::Machine]),
//!     |event| {
//!         if let CncEvent::Machine(MachineEvent::Alarm { code, message, .. }) = event {
//!             eprintln!("ALARM:{} {}", code, message);
//!         }
//!     },
//! );
//!
//! bus.unsubscribe(subscription);
//! ```

mod bus;
mod events;

pub use bus::*;
pub use events::*;

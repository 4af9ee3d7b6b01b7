//! Event Bus implementation.
//!
//! Provides the EventBus struct. There is no global instance: the bus is
//! constructed by the owner and handed to collaborators explicitly.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use super::events::{CncEvent, EventCategory};

/// Subscription handle for unsubscribing from events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    /// Create a new unique subscription ID
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Sub({})", &self.0.to_string()[..8])
    }
}

/// Filter to receive only specific event types
#[derive(Debug, Clone, Default)]
pub enum EventFilter {
    /// Receive all events.
    #[default]
    All,
    /// Receive events matching any of these categories.
    Categories(Vec<EventCategory>),
}

impl EventFilter {
    /// Check if an event matches this filter
    pub fn matches(&self, event: &CncEvent) -> bool {
        match self {
            EventFilter::All => true,
            EventFilter::Categories(categories) => categories.contains(&event.category()),
        }
    }
}

/// Type alias for event handler functions
type EventHandler = Arc<dyn Fn(CncEvent) + Send + Sync>;

/// Broadcast channel capacity; slow async receivers lag past this
const CHANNEL_CAPACITY: usize = 1024;

/// Error types for event bus operations
#[derive(Debug, Clone, thiserror::Error)]
pub enum EventBusError {
    /// No subscribers are listening
    #[error("No active subscribers")]
    NoSubscribers,
}

/// Typed publish/subscribe hub for machine-link events
pub struct EventBus {
    /// Broadcast channel sender
    sender: broadcast::Sender<CncEvent>,
    /// Registered synchronous handlers
    handlers: Arc<RwLock<HashMap<SubscriptionId, (EventFilter, EventHandler)>>>,
}

impl EventBus {
    /// Create a new event bus
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Publish an event to all subscribers
    ///
    /// Returns the number of async receivers that will receive the event.
    /// Safety-critical events are logged at error level when nobody is
    /// listening, so they are never silently lost.
    pub fn publish(&self, event: CncEvent) -> Result<usize, EventBusError> {
        tracing::trace!("publish: {}", event.description());

        // Handlers may subscribe or unsubscribe from inside the callback, so
        // dispatch from a snapshot rather than holding the read lock.
        let matching: Vec<EventHandler> = self
            .handlers
            .read()
            .values()
            .filter(|(filter, _)| filter.matches(&event))
            .map(|(_, handler)| Arc::clone(handler))
            .collect();
        let handled = !matching.is_empty();
        for handler in matching {
            handler(event.clone());
        }

        let critical = event.is_safety_critical();
        let description = if critical {
            Some(event.description())
        } else {
            None
        };

        match self.sender.send(event) {
            Ok(count) => Ok(count),
            Err(_) if handled => Ok(0),
            Err(_) => {
                if let Some(description) = description {
                    tracing::error!("Unobserved safety event: {}", description);
                }
                Err(EventBusError::NoSubscribers)
            }
        }
    }

    /// Subscribe to events with a synchronous handler
    ///
    /// The handler will be called on the publishing thread, so it should
    /// return quickly to avoid blocking event dispatch.
    pub fn subscribe<F>(&self, filter: EventFilter, handler: F) -> SubscriptionId
    where
        F: Fn(CncEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId::new();
        let mut handlers = self.handlers.write();
        handlers.insert(id, (filter, Arc::new(handler)));
        tracing::debug!("Subscription {} added", id);
        id
    }

    /// Get a receiver for manual event polling
    ///
    /// This is useful for async contexts where you want to receive events
    /// in a tokio task.
    pub fn receiver(&self) -> broadcast::Receiver<CncEvent> {
        self.sender.subscribe()
    }

    /// Unsubscribe from events
    ///
    /// Returns true if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = self.handlers.write();
        let removed = handlers.remove(&id).is_some();
        if removed {
            tracing::debug!("Subscription {} removed", id);
        }
        removed
    }

    /// Get the number of active subscriptions
    pub fn subscriber_count(&self) -> usize {
        self.handlers.read().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

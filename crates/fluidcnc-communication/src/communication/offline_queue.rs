//! Offline command queue
//!
//! Bounded FIFO of commands issued while the link is down. On overflow the
//! oldest entry is evicted. Items are removed as they are replayed, so an
//! interrupted replay never sends anything twice.

use std::collections::VecDeque;
use tokio::time::Instant;

use super::SendOptions;

/// One queued command
#[derive(Debug, Clone)]
pub struct OfflineQueueItem {
    /// Queue-local id
    pub id: u64,
    /// Command text
    pub command: String,
    /// Options the command was sent with
    pub options: SendOptions,
    /// When it was queued
    pub enqueued_at: Instant,
}

/// Bounded offline queue
#[derive(Debug)]
pub struct OfflineQueue {
    items: VecDeque<OfflineQueueItem>,
    capacity: usize,
    next_id: u64,
}

impl OfflineQueue {
    /// Create a queue holding at most `capacity` commands
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            next_id: 1,
        }
    }

    /// Append a command. Returns the new item's id and the evicted item, if any.
    pub fn push(
        &mut self,
        command: impl Into<String>,
        options: SendOptions,
    ) -> (u64, Option<OfflineQueueItem>) {
        let evicted = if self.capacity > 0 && self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };
        if let Some(item) = &evicted {
            tracing::warn!("Offline queue full, dropping '{}'", item.command);
        }

        let id = self.next_id;
        self.next_id += 1;
        self.items.push_back(OfflineQueueItem {
            id,
            command: command.into(),
            options,
            enqueued_at: Instant::now(),
        });
        tracing::debug!("Queued offline command #{} ({} queued)", id, self.items.len());
        (id, evicted)
    }

    /// Remove and return the oldest item
    pub fn pop_front(&mut self) -> Option<OfflineQueueItem> {
        self.items.pop_front()
    }

    /// Queued commands in replay order
    pub fn commands(&self) -> Vec<String> {
        self.items.iter().map(|i| i.command.clone()).collect()
    }

    /// Number of queued commands
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Maximum number of queued commands
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop everything
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = OfflineQueue::new(10);
        queue.push("G0 X1", SendOptions::default());
        queue.push("G0 X2", SendOptions::default());
        assert_eq!(queue.pop_front().map(|i| i.command), Some("G0 X1".to_string()));
        assert_eq!(queue.pop_front().map(|i| i.command), Some("G0 X2".to_string()));
        assert!(queue.pop_front().is_none());
    }

    #[test]
    fn test_overflow_evicts_oldest() {
        let mut queue = OfflineQueue::new(3);
        for i in 0..3 {
            let (_, evicted) = queue.push(format!("G0 X{}", i), SendOptions::default());
            assert!(evicted.is_none());
        }
        let (id, evicted) = queue.push("G0 X3", SendOptions::default());
        assert_eq!(id, 4);
        assert_eq!(evicted.map(|i| i.command), Some("G0 X0".to_string()));
        assert_eq!(queue.commands(), vec!["G0 X1", "G0 X2", "G0 X3"]);
    }
}

//! Command correlator
//!
//! The controller answers every non-realtime line with exactly one `ok` or
//! `error:N`, in the order the lines were received. The correlator keeps one
//! entry per line in flight and hands each answer to the oldest entry.

use fluidcnc_core::CommandError;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tokio::sync::oneshot;
use tokio::time::Instant;

use super::error_decoder::decode_error;

/// Successful result of a correlated command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
    /// Correlation id (0 for realtime commands)
    pub id: u64,
    /// Command as transmitted
    pub command: String,
    /// `ok`, or `realtime` for fire-and-forget bytes
    pub response: String,
}

/// Channel a waiting caller listens on
pub type ReplySender = oneshot::Sender<Result<CommandReply, CommandError>>;

/// Who is waiting for an answer
#[derive(Debug)]
pub enum CommandOrigin {
    /// A direct command, optionally awaited
    Direct(Option<ReplySender>),
    /// A line sent by the streaming engine
    Stream,
    /// A trusted prefix command inserted by the fixer
    Prefix,
}

impl CommandOrigin {
    /// The kind without the channel
    pub fn kind(&self) -> OriginKind {
        match self {
            CommandOrigin::Direct(_) => OriginKind::Direct,
            CommandOrigin::Stream => OriginKind::Stream,
            CommandOrigin::Prefix => OriginKind::Prefix,
        }
    }
}

/// [`CommandOrigin`] without the reply channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OriginKind {
    /// Direct command
    Direct,
    /// Streamed line
    Stream,
    /// Fixer prefix
    Prefix,
}

/// One line in flight
#[derive(Debug)]
pub struct OutstandingCommand {
    /// Monotonic id
    pub id: u64,
    /// Command text
    pub command: String,
    /// Who is waiting
    pub origin: CommandOrigin,
    /// When it was written
    pub sent_at: Instant,
}

/// What an answer was matched to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolved {
    /// Correlation id
    pub id: u64,
    /// Command text
    pub command: String,
    /// Origin of the command
    pub origin: OriginKind,
}

/// FIFO correlator
#[derive(Debug)]
pub struct CommandCorrelator {
    queue: VecDeque<OutstandingCommand>,
    next_id: u64,
}

impl Default for CommandCorrelator {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandCorrelator {
    /// Create an empty correlator
    pub fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            next_id: 1,
        }
    }

    /// Record a line that has just been written. Returns its id.
    pub fn register(&mut self, command: impl Into<String>, origin: CommandOrigin) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push_back(OutstandingCommand {
            id,
            command: command.into(),
            origin,
            sent_at: Instant::now(),
        });
        id
    }

    fn pop(&mut self) -> Option<OutstandingCommand> {
        let entry = self.queue.pop_front();
        if entry.is_none() {
            tracing::debug!("Response with no outstanding command");
        }
        entry
    }

    /// `ok`: resolve the oldest entry
    pub fn resolve_ok(&mut self) -> Option<Resolved> {
        let entry = self.pop()?;
        let resolved = Resolved {
            id: entry.id,
            command: entry.command.clone(),
            origin: entry.origin.kind(),
        };
        if let CommandOrigin::Direct(Some(tx)) = entry.origin {
            let _ = tx.send(Ok(CommandReply {
                id: entry.id,
                command: entry.command,
                response: "ok".to_string(),
            }));
        }
        Some(resolved)
    }

    /// `error:N`: reject only the oldest entry
    pub fn reject_error(&mut self, code: u32) -> Option<Resolved> {
        let entry = self.pop()?;
        let resolved = Resolved {
            id: entry.id,
            command: entry.command.clone(),
            origin: entry.origin.kind(),
        };
        if let CommandOrigin::Direct(Some(tx)) = entry.origin {
            let _ = tx.send(Err(CommandError::Rejected {
                code,
                message: decode_error(code),
                command: entry.command,
            }));
        }
        Some(resolved)
    }

    /// Drop an entry whose waiter timed out. Returns its command text if it
    /// was still outstanding.
    pub fn expire(&mut self, id: u64) -> Option<String> {
        let index = self.queue.iter().position(|e| e.id == id)?;
        let entry = self.queue.remove(index)?;
        tracing::warn!("Command #{} '{}' expired without a response", id, entry.command);
        Some(entry.command)
    }

    /// Reject everything, e.g. on alarm, reset or connection loss. Returns the
    /// number of entries dropped.
    pub fn reject_all<F>(&mut self, make_error: F) -> usize
    where
        F: Fn(&str) -> CommandError,
    {
        let count = self.queue.len();
        for entry in self.queue.drain(..) {
            if let CommandOrigin::Direct(Some(tx)) = entry.origin {
                let _ = tx.send(Err(make_error(&entry.command)));
            }
        }
        if count > 0 {
            tracing::debug!("Rejected {} outstanding commands", count);
        }
        count
    }

    /// Entries in flight
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Nothing in flight
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Commands in flight, oldest first
    pub fn outstanding(&self) -> Vec<(u64, String)> {
        self.queue
            .iter()
            .map(|e| (e.id, e.command.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_resolves_oldest() {
        let mut correlator = CommandCorrelator::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        correlator.register("G0 X10", CommandOrigin::Direct(Some(tx1)));
        correlator.register("G0 Y10", CommandOrigin::Direct(Some(tx2)));

        let resolved = correlator.resolve_ok().expect("resolved");
        assert_eq!(resolved.command, "G0 X10");
        let reply = rx1.try_recv().expect("sent").expect("ok");
        assert_eq!(reply.command, "G0 X10");
        assert!(rx2.try_recv().is_err());
    }

    #[test]
    fn test_error_rejects_only_one() {
        let mut correlator = CommandCorrelator::new();
        let (tx1, mut rx1) = oneshot::channel();
        let (tx2, mut rx2) = oneshot::channel();
        correlator.register("G0 X10", CommandOrigin::Direct(Some(tx1)));
        correlator.register("G0 Y10", CommandOrigin::Direct(Some(tx2)));

        correlator.reject_error(9);
        match rx1.try_recv().expect("sent") {
            Err(CommandError::Rejected { code, message, .. }) => {
                assert_eq!(code, 9);
                assert_eq!(message, decode_error(9));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(correlator.len(), 1);
        correlator.resolve_ok();
        assert!(rx2.try_recv().expect("sent").is_ok());
    }

    #[test]
    fn test_expire_and_reject_all() {
        let mut correlator = CommandCorrelator::new();
        let id = correlator.register("$H", CommandOrigin::Direct(None));
        let (tx, mut rx) = oneshot::channel();
        correlator.register("G0 X1", CommandOrigin::Direct(Some(tx)));
        correlator.register("G1 X2", CommandOrigin::Stream);

        assert_eq!(correlator.expire(id), Some("$H".to_string()));
        assert_eq!(correlator.expire(id), None);

        let dropped = correlator.reject_all(|command| CommandError::ConnectionLost {
            command: command.to_string(),
        });
        assert_eq!(dropped, 2);
        assert!(correlator.is_empty());
        assert!(matches!(
            rx.try_recv().expect("sent"),
            Err(CommandError::ConnectionLost { .. })
        ));
    }

    #[test]
    fn test_unsolicited_ok() {
        let mut correlator = CommandCorrelator::new();
        assert!(correlator.resolve_ok().is_none());
        assert!(correlator.reject_error(1).is_none());
    }
}

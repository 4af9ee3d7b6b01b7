//! WebSocket bridge transport
//!
//! Talks to a serial-to-WebSocket bridge. Outbound lines and realtime bytes are
//! wrapped in small JSON envelopes; inbound text frames each carry protocol
//! text, except JSON objects with a `type` key which are bridge messages
//! (`bridge_status`, `vfd_status`, ...) and are passed on as auxiliary payloads.

use async_trait::async_trait;
use fluidcnc_core::{ConnectionError, TransportKind};
use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use super::{Inbound, LinkWriter, Transport, TransportLink};
use crate::firmware::connection_watch::ActivityClock;
use crate::firmware::grbl::realtime::RealtimeCommand;

/// Encode a G-code line for the bridge
pub fn encode_line(line: &str) -> String {
    serde_json::json!({ "type": "gcode", "command": line }).to_string()
}

/// Encode a realtime byte for the bridge
pub fn encode_realtime(command: RealtimeCommand) -> String {
    let c = char::from(command.byte());
    serde_json::json!({ "type": "realtime", "char": c.to_string() }).to_string()
}

/// Classify one inbound text frame
pub fn decode_frame(text: &str) -> Inbound {
    let trimmed = text.trim();
    if trimmed.starts_with('{') {
        if let Ok(value) = serde_json::from_str::<serde_json::Value>(trimmed) {
            if value.get("type").is_some_and(|t| t.is_string()) {
                return Inbound::Auxiliary(value);
            }
        }
    }
    if text.ends_with('\n') {
        Inbound::Text(text.to_string())
    } else {
        Inbound::Text(format!("{}\n", text))
    }
}

/// WebSocket transport to a bridge
#[derive(Debug, Clone)]
pub struct WebSocketTransport {
    url: String,
    connect_timeout: Duration,
}

impl WebSocketTransport {
    /// Create a transport for `url` (`ws://host:port/path`)
    pub fn new(url: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            connect_timeout,
        }
    }
}

struct WebSocketWriter {
    url: String,
    outbound: mpsc::UnboundedSender<Message>,
    open: Arc<AtomicBool>,
}

impl WebSocketWriter {
    fn send(&self, text: String) -> Result<(), ConnectionError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(ConnectionError::NotConnected);
        }
        self.outbound
            .send(Message::Text(text))
            .map_err(|_| ConnectionError::WriteFailed {
                endpoint: self.url.clone(),
                reason: "writer task stopped".to_string(),
            })
    }
}

impl LinkWriter for WebSocketWriter {
    fn write_line(&self, line: &str) -> Result<(), ConnectionError> {
        tracing::trace!("TX {}", line);
        self.send(encode_line(line))
    }

    fn write_realtime(&self, command: RealtimeCommand) -> Result<(), ConnectionError> {
        tracing::trace!("TX realtime {}", command);
        self.send(encode_realtime(command))
    }

    fn close(&self) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.outbound.send(Message::Close(None));
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn name(&self) -> String {
        self.url.clone()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    async fn connect(&self) -> Result<TransportLink, ConnectionError> {
        let failed = |reason: String| ConnectionError::FailedToOpen {
            endpoint: self.url.clone(),
            reason,
        };

        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| failed(format!("timed out after {:?}", self.connect_timeout)))?
            .map_err(|e| failed(e.to_string()))?;
        info!("WebSocket connected to {}", self.url);

        let (mut sink, mut source) = stream.split();
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let activity = ActivityClock::new();
        let open = Arc::new(AtomicBool::new(true));

        let url = self.url.clone();
        tokio::spawn(async move {
            while let Some(message) = out_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    warn!("WebSocket send to {} failed: {}", url, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            debug!("WebSocket writer for {} finished", url);
        });

        let reader_activity = activity.clone();
        let reader_open = Arc::clone(&open);
        tokio::spawn(async move {
            let closed = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        reader_activity.touch();
                        if in_tx.send(decode_frame(&text)).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => {
                        reader_activity.touch();
                        let text = String::from_utf8_lossy(&bytes).into_owned();
                        if in_tx.send(Inbound::Text(text)).is_err() {
                            break None;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let reason = frame
                            .map(|f| f.reason.to_string())
                            .unwrap_or_else(|| "closed by peer".to_string());
                        break Some(Inbound::Closed {
                            clean: true,
                            reason,
                        });
                    }
                    Some(Ok(_)) => reader_activity.touch(),
                    Some(Err(e)) => {
                        break Some(Inbound::Closed {
                            clean: !reader_open.load(Ordering::SeqCst),
                            reason: e.to_string(),
                        })
                    }
                    None => {
                        break Some(Inbound::Closed {
                            clean: !reader_open.load(Ordering::SeqCst),
                            reason: "stream ended".to_string(),
                        })
                    }
                }
            };
            reader_open.store(false, Ordering::SeqCst);
            if let Some(closed) = closed {
                let _ = in_tx.send(closed);
            }
        });

        Ok(TransportLink {
            writer: Arc::new(WebSocketWriter {
                url: self.url.clone(),
                outbound: out_tx,
                open,
            }),
            inbound: in_rx,
            activity,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelopes() {
        let line: serde_json::Value = serde_json::from_str(&encode_line("G0 X10")).expect("json");
        assert_eq!(line["type"], "gcode");
        assert_eq!(line["command"], "G0 X10");

        let rt: serde_json::Value =
            serde_json::from_str(&encode_realtime(RealtimeCommand::FeedHold)).expect("json");
        assert_eq!(rt["type"], "realtime");
        assert_eq!(rt["char"], "!");
    }

    #[test]
    fn test_frames_split_by_framing() {
        assert!(matches!(
            decode_frame(r#"{"type":"vfd_status","rpm":12000}"#),
            Inbound::Auxiliary(_)
        ));
        // JSON-looking text without a type key stays protocol text
        assert_eq!(
            decode_frame("{1,2}"),
            Inbound::Text("{1,2}\n".to_string())
        );
        assert_eq!(decode_frame("ok"), Inbound::Text("ok\n".to_string()));
        assert_eq!(
            decode_frame("<Idle|MPos:0,0,0>\n"),
            Inbound::Text("<Idle|MPos:0,0,0>\n".to_string())
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:1/ws", Duration::from_secs(2));
        match transport.connect().await {
            Err(ConnectionError::FailedToOpen { endpoint, .. }) => {
                assert_eq!(endpoint, "ws://127.0.0.1:1/ws")
            }
            other => panic!("unexpected {:?}", other.map(|_| ())),
        }
    }
}

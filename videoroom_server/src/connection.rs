//! Outbound half of a client connection
//!
//! Everything sent to a client goes through an unbounded queue drained by
//! that client's writer task, so sending never blocks the sender on a slow
//! peer.

use std::fmt;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::debug;
use videoroom_protocol::ServerMessage;

/// Server-assigned identifier of one WebSocket connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A frame queued for a connection's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// A rendered protocol message
    Text(String),
    /// Close the connection; nothing queued after this is written
    Close { code: CloseCode, reason: String },
}

/// Handle used to send to one client
#[derive(Debug, Clone)]
pub struct Connection {
    id: ConnectionId,
    tx: mpsc::UnboundedSender<Outbound>,
}

impl Connection {
    pub fn new(id: ConnectionId, tx: mpsc::UnboundedSender<Outbound>) -> Self {
        Self { id, tx }
    }

    /// Create a handle together with the queue its writer drains
    pub fn channel(id: ConnectionId) -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue a protocol message
    pub fn send(&self, message: &ServerMessage) {
        self.send_text(message.to_string());
    }

    /// Queue already rendered text, for fan-out of one message to many peers
    pub fn send_text(&self, text: String) {
        self.push(Outbound::Text(text));
    }

    /// Queue a close frame with the given status
    pub fn close(&self, code: CloseCode, reason: impl Into<String>) {
        self.push(Outbound::Close {
            code,
            reason: reason.into(),
        });
    }

    fn push(&self, outbound: Outbound) {
        if self.tx.send(outbound).is_err() {
            debug!(conn_id = %self.id, "writer gone, dropping outbound frame");
        }
    }
}

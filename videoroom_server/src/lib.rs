//! WebSocket signaling relay for peer-to-peer WebRTC video rooms
//!
//! Clients join a named room, learn who is already there, and exchange
//! opaque negotiation payloads (session descriptions, ICE candidates) with
//! one another through the server. Media never passes through here.
//!
//! # Protocol
//!
//! One JSON object per WebSocket text frame, on the `/ws` path by default.
//! See [`videoroom_protocol`] for every message.
//!
//! 1. Send `{"type":"join","roomId":"r1","name":"Alice"}`
//! 2. Receive `welcome` with your `clientId`, then `peers` with everyone
//!    already in the room
//! 3. Existing members receive `peer-joined`
//! 4. Send `{"type":"signal","to":"<clientId>","data":...}`; the target
//!    receives `{"type":"signal","from":"<your clientId>","data":...}`
//! 5. On `leave` or disconnect the remaining members receive `peer-left`
//!
//! Rooms hold at most six members unless configured otherwise. A client
//! joining a full room gets `{"type":"error","message":"Room is full"}` and
//! the connection is closed with status 1008.
//!
//! # Example
//!
//! ```bash
//! # Start the server
//! videoroom-signaling --bind 127.0.0.1:8080
//!
//! # Connect with any WebSocket client
//! websocat ws://127.0.0.1:8080/ws
//! {"type":"join","roomId":"r1","name":"Alice"}
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod connection;
pub mod error;
pub mod handler;
pub mod server;
pub mod state;

pub use config::ServerConfig;
pub use connection::{Connection, ConnectionId, Outbound};
pub use error::{ErrorKind, ServerError, SignalingError};
pub use handler::{ConnectionHandler, Phase};
pub use server::{BoundServer, SignalingServer};
pub use state::{MemberId, RoomId, ServerState};

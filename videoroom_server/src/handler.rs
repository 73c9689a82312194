//! Per-connection signaling state machine
//!
//! A connection starts `Unjoined`, becomes `Joined` after a successful join,
//! and ends `Closed` when the transport reports it gone or the server closes
//! it. Errors caused by a message go back to its sender as an `error` message
//! and never reach other connections.

use crate::connection::Connection;
use crate::error::SignalingError;
use crate::state::{Member, RoomId, ServerState};
use serde_json::value::RawValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, info, trace, warn};
use videoroom_protocol::{ClientMessage, DecodeError, PeerSummary, ServerMessage};

/// Where a connection is in the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Unjoined,
    Joined,
    /// Terminal; inbound messages are ignored
    Closed,
}

/// Drives the protocol for one connection
#[derive(Debug)]
pub struct ConnectionHandler {
    state: ServerState,
    connection: Connection,
    phase: Phase,
    /// Set by the first successful join; a connection joins at most once
    joined_once: bool,
}

impl ConnectionHandler {
    pub fn new(state: ServerState, connection: Connection) -> Self {
        Self {
            state,
            connection,
            phase: Phase::Unjoined,
            joined_once: false,
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Handle one inbound text frame
    pub fn on_text_message(&mut self, raw: &str) {
        if self.phase == Phase::Closed {
            trace!(conn_id = %self.connection.id(), "ignoring message on closed connection");
            return;
        }

        let result = match raw.parse::<ClientMessage>() {
            Ok(message) => self.dispatch(message),
            Err(DecodeError::Json(e)) => {
                debug!(conn_id = %self.connection.id(), error = %e, "invalid JSON frame");
                Err(SignalingError::InvalidJson)
            }
            Err(DecodeError::Malformed(e)) => {
                debug!(conn_id = %self.connection.id(), error = %e, "malformed message");
                Err(SignalingError::MalformedMessage)
            }
        };

        if let Err(err) = result {
            self.report(err);
        }
    }

    /// The transport lost the connection. Leaves the room if still in one.
    pub fn on_closed(&mut self) {
        self.leave();
        self.phase = Phase::Closed;
        debug!(conn_id = %self.connection.id(), "connection closed");
    }

    fn dispatch(&mut self, message: ClientMessage) -> Result<(), SignalingError> {
        match message {
            ClientMessage::Join { room_id, name } => self.join(room_id, name),
            ClientMessage::Signal { to, data } => self.signal(&to, data),
            ClientMessage::Leave => {
                self.leave();
                Ok(())
            }
            ClientMessage::Unknown => Err(SignalingError::UnknownMessageType),
        }
    }

    fn join(&mut self, room_id: String, name: String) -> Result<(), SignalingError> {
        if self.joined_once {
            return Err(SignalingError::AlreadyJoined);
        }
        if room_id.trim().is_empty() || name.trim().is_empty() {
            return Err(SignalingError::MissingJoinFields);
        }

        let room_id = RoomId::from(room_id);
        let outcome = self
            .state
            .join(room_id.clone(), name.clone(), &self.connection)?;
        self.phase = Phase::Joined;
        self.joined_once = true;

        info!(
            conn_id = %self.connection.id(),
            %room_id,
            member_id = %outcome.member_id,
            name = %name,
            peers = outcome.peers.len(),
            "member joined"
        );

        self.connection.send(&ServerMessage::Welcome {
            client_id: outcome.member_id.to_string(),
            room_id: room_id.to_string(),
        });
        self.connection.send(&ServerMessage::Peers {
            peers: outcome.peers.iter().map(Member::summary).collect(),
        });

        // Read again after insertion: anyone who joined meanwhile hears about us too
        let Some(members) = self.state.room_members(&room_id) else {
            return Ok(());
        };
        let joined = ServerMessage::PeerJoined {
            peer: PeerSummary {
                id: outcome.member_id.to_string(),
                name,
            },
        };
        broadcast(
            members.iter().filter(|m| m.id != outcome.member_id),
            &joined,
        );
        Ok(())
    }

    fn signal(&mut self, to: &str, data: Option<Box<RawValue>>) -> Result<(), SignalingError> {
        let data = match data {
            Some(data) if !to.trim().is_empty() => data,
            _ => return Err(SignalingError::MissingSignalFields),
        };

        let (from, target) = self.state.route(self.connection.id(), to)?;
        debug!(
            conn_id = %self.connection.id(),
            from = %from,
            to,
            bytes = data.get().len(),
            "relaying signal"
        );
        target.send(&ServerMessage::Signal {
            from: from.to_string(),
            data,
        });
        Ok(())
    }

    fn leave(&mut self) {
        if let Some(outcome) = self.state.leave(self.connection.id()) {
            info!(
                conn_id = %self.connection.id(),
                room_id = %outcome.room_id,
                member_id = %outcome.member.id,
                remaining = outcome.remaining.len(),
                "member left"
            );
            let left = ServerMessage::PeerLeft {
                peer_id: outcome.member.id.to_string(),
            };
            broadcast(outcome.remaining.iter(), &left);
        }
        if self.phase == Phase::Joined {
            self.phase = Phase::Unjoined;
        }
    }

    fn report(&mut self, err: SignalingError) {
        let message = err.to_string();
        self.connection.send(&ServerMessage::error(message.clone()));

        if err.closes_connection() {
            warn!(conn_id = %self.connection.id(), reason = %message, "closing connection");
            self.connection.close(CloseCode::Policy, message);
            self.phase = Phase::Closed;
        } else {
            debug!(
                conn_id = %self.connection.id(),
                kind = ?err.kind(),
                error = %message,
                "rejected message"
            );
        }
    }
}

/// Send one message to many members, rendering it once
fn broadcast<'a>(members: impl Iterator<Item = &'a Member>, message: &ServerMessage) {
    let text = message.to_string();
    for member in members {
        member.connection.send_text(text.clone());
    }
}

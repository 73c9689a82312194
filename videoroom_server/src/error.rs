//! Error types for the signaling server

use thiserror::Error;

/// Errors reported back to the client that caused them
///
/// The `Display` text is what goes out in `{"type":"error","message":...}`.
/// None of these affect any other connection.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignalingError {
    /// `join` without a room or a name
    #[error("roomId and name are required")]
    MissingJoinFields,

    /// `signal` without a target or a payload
    #[error("to and data are required for signal")]
    MissingSignalFields,

    /// The room already holds its capacity; the connection gets closed
    #[error("Room is full")]
    RoomFull,

    #[error("Not joined")]
    NotJoined,

    #[error("Room not found")]
    RoomNotFound,

    #[error("Target not found")]
    TargetNotFound,

    /// A connection may join only once
    #[error("Already joined")]
    AlreadyJoined,

    #[error("Unknown message type")]
    UnknownMessageType,

    #[error("Invalid JSON")]
    InvalidJson,

    #[error("Malformed message")]
    MalformedMessage,
}

/// Broad class of a [`SignalingError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Required fields missing or blank
    Validation,
    /// Room at capacity
    Capacity,
    /// Sender or target not where it should be
    Routing,
    /// Frame could not be understood
    Protocol,
}

impl SignalingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MissingJoinFields | Self::MissingSignalFields => ErrorKind::Validation,
            Self::RoomFull => ErrorKind::Capacity,
            Self::NotJoined | Self::RoomNotFound | Self::TargetNotFound => ErrorKind::Routing,
            Self::AlreadyJoined
            | Self::UnknownMessageType
            | Self::InvalidJson
            | Self::MalformedMessage => ErrorKind::Protocol,
        }
    }

    /// Whether the offending connection must be closed after the report
    pub fn closes_connection(&self) -> bool {
        self.kind() == ErrorKind::Capacity
    }
}

/// Errors that stop the server itself
#[derive(Error, Debug)]
pub enum ServerError {
    /// Failed to bind or accept on the listening socket
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

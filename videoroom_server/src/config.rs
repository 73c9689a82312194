//! Server configuration

use std::num::NonZeroUsize;

/// Members allowed in one room unless configured otherwise
pub const DEFAULT_ROOM_CAPACITY: NonZeroUsize = NonZeroUsize::new(6).unwrap();

/// Path on which WebSocket upgrades are accepted unless configured otherwise
pub const DEFAULT_WS_PATH: &str = "/ws";

/// Server configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind_addr: String,
    /// Request path for the WebSocket upgrade
    pub ws_path: String,
    /// Maximum members per room
    pub room_capacity: NonZeroUsize,
}

impl ServerConfig {
    /// Config with the given bind address and defaults for the rest
    pub fn with_bind_addr(bind_addr: impl Into<String>) -> Self {
        Self {
            bind_addr: bind_addr.into(),
            ..Self::default()
        }
    }

    /// The upgrade path with a leading slash
    pub fn normalized_ws_path(&self) -> String {
        if self.ws_path.starts_with('/') {
            self.ws_path.clone()
        } else {
            format!("/{}", self.ws_path)
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8080".to_string(),
            ws_path: DEFAULT_WS_PATH.to_string(),
            room_capacity: DEFAULT_ROOM_CAPACITY,
        }
    }
}

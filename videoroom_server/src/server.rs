//! WebSocket transport for the signaling server
//!
//! ```text
//! Client A ──┐                       ┌── writer task ──► Client A
//!             ├── reader ── handler ──┤
//! Client B ──┘                       └── writer task ──► Client B
//! ```
//!
//! Each accepted connection gets a reader loop that feeds text frames, in
//! order, to its [`ConnectionHandler`], and a writer task that drains the
//! connection's outbound queue into the socket.

use crate::config::ServerConfig;
use crate::connection::{Connection, ConnectionId, Outbound};
use crate::error::ServerError;
use crate::handler::{ConnectionHandler, Phase};
use crate::state::ServerState;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tracing::{debug, info, warn};

/// The signaling server, before it is bound.
#[derive(Debug)]
pub struct SignalingServer {
    config: ServerConfig,
    state: ServerState,
}

impl SignalingServer {
    /// Create a new signaling server with the given configuration.
    pub fn new(config: ServerConfig) -> Self {
        let state = ServerState::new(config.room_capacity);
        Self { config, state }
    }

    /// Create with default configuration.
    pub fn with_defaults() -> Self {
        Self::new(ServerConfig::default())
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Shared room and session state.
    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Bind the listening socket.
    pub async fn bind(self) -> Result<BoundServer, ServerError> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        let ws_path = self.config.normalized_ws_path();
        info!(
            addr = %listener.local_addr()?,
            path = %ws_path,
            room_capacity = self.config.room_capacity.get(),
            "signaling server listening"
        );
        Ok(BoundServer {
            listener,
            ws_path,
            state: self.state,
        })
    }
}

/// A signaling server with a bound listener, ready to accept connections.
#[derive(Debug)]
pub struct BoundServer {
    listener: TcpListener,
    ws_path: String,
    state: ServerState,
}

impl BoundServer {
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    pub fn state(&self) -> &ServerState {
        &self.state
    }

    /// Accept connections forever.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(std::future::pending()).await
    }

    /// Accept connections until `shutdown` completes.
    ///
    /// Connections already established keep running on their own tasks.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), ServerError> {
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("signaling server shutting down");
                    return Ok(());
                }
                accepted = self.listener.accept() => {
                    let (stream, addr) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "failed to accept connection");
                            continue;
                        }
                    };
                    debug!(%addr, "new TCP connection");

                    let state = self.state.clone();
                    let ws_path = self.ws_path.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, addr, state, ws_path).await;
                    });
                }
            }
        }
    }
}

/// Upgrade one TCP connection and run it until either side closes.
async fn handle_connection(
    stream: TcpStream,
    addr: SocketAddr,
    state: ServerState,
    ws_path: String,
) {
    let check_path = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        if request.uri().path() == ws_path {
            Ok(response)
        } else {
            debug!(%addr, path = request.uri().path(), "rejecting upgrade on unknown path");
            let mut reject = ErrorResponse::new(Some("Not Found".to_string()));
            *reject.status_mut() = StatusCode::NOT_FOUND;
            Err(reject)
        }
    };

    let ws_stream = match tokio_tungstenite::accept_hdr_async(stream, check_path).await {
        Ok(ws_stream) => ws_stream,
        Err(e) => {
            warn!(%addr, error = %e, "WebSocket handshake failed");
            return;
        }
    };
    let (sink, mut incoming) = ws_stream.split();

    let (connection, outbound_rx) = Connection::channel(state.next_connection_id());
    let conn_id = connection.id();
    info!(%conn_id, %addr, "WebSocket connection established");

    let writer = tokio::spawn(write_outbound(conn_id, sink, outbound_rx));

    let mut handler = ConnectionHandler::new(state, connection);
    while let Some(frame) = incoming.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                handler.on_text_message(text.as_str());
                // The close frame is already queued; do not wait for the peer to answer it
                if handler.phase() == Phase::Closed {
                    break;
                }
            }
            Ok(Message::Close(_)) => break,
            // Pings are answered by tungstenite; binary frames carry nothing for us
            Ok(_) => {}
            Err(e) => {
                debug!(%conn_id, error = %e, "WebSocket read error");
                break;
            }
        }
    }

    handler.on_closed();
    // Last sender goes with the handler, which lets the writer finish
    drop(handler);
    if let Err(e) = writer.await {
        warn!(%conn_id, error = %e, "writer task failed");
    }
    // Both halves gone: the socket is closed
    drop(incoming);
    info!(%conn_id, %addr, "connection closed");
}

/// Drain a connection's outbound queue into its socket.
async fn write_outbound(
    conn_id: ConnectionId,
    mut sink: SplitSink<WebSocketStream<TcpStream>, Message>,
    mut outbound_rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(outbound) = outbound_rx.recv().await {
        match outbound {
            Outbound::Text(text) => {
                if let Err(e) = sink.send(Message::text(text)).await {
                    debug!(%conn_id, error = %e, "failed to send, stopping writer");
                    return;
                }
            }
            Outbound::Close { code, reason } => {
                let frame = CloseFrame {
                    code,
                    reason: reason.into(),
                };
                if let Err(e) = sink.send(Message::Close(Some(frame))).await {
                    debug!(%conn_id, error = %e, "failed to send close frame");
                }
                return;
            }
        }
    }
    let _ = sink.close().await;
}

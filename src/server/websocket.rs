//! WebSocket server implementation
//!
//! One listener serves two kinds of connection, chosen by the handshake path:
//! the JSON control channel at `/ws` and a per-session streaming channel at
//! `/sessions/<id>/stream`. Any other path is refused with 404.

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_hdr_async, tungstenite::Message, WebSocketStream};
use tracing::{debug, error, info, warn};

use super::handler::ControlHandler;
use super::protocol::{
    parse_stream_path, valid_dimensions, ServerEnvelope, ServerMessage, StreamFrame, CONTROL_PATH,
};
use crate::config::RelayConfig;
use crate::pty::TerminalSize;
use crate::relay::{BroadcastHub, ObserverId};

type WsSink = SplitSink<WebSocketStream<TcpStream>, Message>;
type WsSource = SplitStream<WebSocketStream<TcpStream>>;

/// Configuration for the WebSocket server
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Identifier announced in the welcome message
    pub server_id: Option<String>,
}

impl ServerConfig {
    pub fn new(bind: String, port: u16) -> Self {
        Self {
            bind,
            port,
            server_id: None,
        }
    }

    pub fn from_relay(config: &RelayConfig) -> Self {
        Self::new(config.bind.clone(), config.port)
    }

    pub fn with_server_id(mut self, server_id: Option<String>) -> Self {
        self.server_id = server_id;
        self
    }

    /// Get the socket address to bind to
    pub fn socket_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Control,
    Stream(String),
}

impl Route {
    fn from_path(path: &str) -> Option<Self> {
        if path == CONTROL_PATH {
            return Some(Route::Control);
        }
        parse_stream_path(path).map(|id| Route::Stream(id.to_string()))
    }
}

/// WebSocket server for control clients and session observers
pub struct WebSocketServer {
    config: ServerConfig,
    hub: Arc<BroadcastHub>,
    control: Arc<ControlHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

impl WebSocketServer {
    pub fn new(config: ServerConfig, hub: Arc<BroadcastHub>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let control = Arc::new(ControlHandler::new(Arc::clone(hub.registry())));
        Self {
            config,
            hub,
            control,
            shutdown_tx,
        }
    }

    /// Get a shutdown signal receiver (for background tasks tied to the server)
    pub fn shutdown_signal(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Trigger server shutdown
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Bind the configured address and serve until shutdown
    pub async fn run(&self) -> anyhow::Result<()> {
        let addr = self.config.socket_addr();
        let listener = TcpListener::bind(&addr).await?;
        info!("WebSocket server listening on ws://{}{}", addr, CONTROL_PATH);
        self.serve(listener).await
    }

    /// Accept connections on `listener` until shutdown
    pub async fn serve(&self, listener: TcpListener) -> anyhow::Result<()> {
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer_addr)) => {
                            let connection = Connection {
                                peer_addr,
                                hub: Arc::clone(&self.hub),
                                control: Arc::clone(&self.control),
                                server_id: self.config.server_id.clone(),
                                shutdown_rx: self.shutdown_tx.subscribe(),
                            };

                            tokio::spawn(async move {
                                if let Err(e) = connection.run(stream).await {
                                    error!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("Failed to accept connection: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping server");
                    break;
                }
            }
        }

        let session_count = self.hub.registry().session_count().await;
        if session_count > 0 {
            info!(
                "Leaving {} sessions running in the backend for reattach",
                session_count
            );
        }

        Ok(())
    }
}

/// State for one accepted socket
struct Connection {
    peer_addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    control: Arc<ControlHandler>,
    server_id: Option<String>,
    shutdown_rx: broadcast::Receiver<()>,
}

impl Connection {
    async fn run(self, stream: TcpStream) -> anyhow::Result<()> {
        info!("New connection from {}", self.peer_addr);

        let mut route = None;
        let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
            match Route::from_path(request.uri().path()) {
                Some(found) => {
                    route = Some(found);
                    Ok(response)
                }
                None => Err(not_found(request.uri().path())),
            }
        })
        .await?;

        match route {
            Some(Route::Control) => self.run_control(ws_stream).await,
            Some(Route::Stream(id)) => self.run_stream(ws_stream, id).await,
            None => Ok(()),
        }
    }

    async fn run_control(mut self, ws_stream: WebSocketStream<TcpStream>) -> anyhow::Result<()> {
        let peer_addr = self.peer_addr;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        let welcome = match self.server_id.take() {
            Some(id) => ServerMessage::welcome_with_id(id),
            None => ServerMessage::welcome(),
        };
        send_envelope(&mut ws_sender, welcome).await?;
        debug!("Sent welcome message to {}", peer_addr);

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            debug!("Received message from {}: {}", peer_addr, text);
                            let response = self.control.handle_text(&text).await;
                            send_envelope(&mut ws_sender, response).await?;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            warn!("Received binary message from {} ({} bytes), ignoring", peer_addr, data.len());
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Client {} requested close", peer_addr);
                            break;
                        }
                        Some(Err(e)) => {
                            error!("WebSocket error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => {
                            info!("Connection closed by {}", peer_addr);
                            break;
                        }
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    info!("Shutdown signal received, closing connection to {}", peer_addr);
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        info!("Connection from {} closed", peer_addr);
        Ok(())
    }

    async fn run_stream(
        mut self,
        ws_stream: WebSocketStream<TcpStream>,
        id: String,
    ) -> anyhow::Result<()> {
        let (mut ws_sender, ws_receiver) = ws_stream.split();
        let (tx, rx) = self.hub.observer_channel();

        let observer = match self.hub.attach(&id, tx).await {
            Ok(observer) => observer,
            Err(e) => {
                warn!("Stream from {} refused: {}", self.peer_addr, e);
                let frame = CloseFrame {
                    code: CloseCode::Policy,
                    reason: format!("unknown session {}", id).into(),
                };
                let _ = ws_sender.send(Message::Close(Some(frame))).await;
                return Ok(());
            }
        };

        let result = self
            .pump_stream(&id, observer, rx, ws_sender, ws_receiver)
            .await;
        self.hub.detach(&id, observer).await;
        info!("Stream from {} for session {} closed", self.peer_addr, id);
        result
    }

    async fn pump_stream(
        &mut self,
        id: &str,
        observer: ObserverId,
        mut rx: tokio::sync::mpsc::Receiver<Vec<u8>>,
        mut ws_sender: WsSink,
        mut ws_receiver: WsSource,
    ) -> anyhow::Result<()> {
        let peer_addr = self.peer_addr;

        loop {
            tokio::select! {
                frame = rx.recv() => {
                    match frame {
                        Some(data) => {
                            ws_sender.send(Message::Binary(data)).await?;
                        }
                        None => {
                            // Queue closed: session deleted or this observer fell behind
                            debug!("Observer {} queue for session {} closed", observer, id);
                            let frame = CloseFrame {
                                code: CloseCode::Away,
                                reason: format!("session {} closed", id).into(),
                            };
                            let _ = ws_sender.send(Message::Close(Some(frame))).await;
                            break;
                        }
                    }
                }
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.apply_frame(id, StreamFrame::from_text(&text)).await;
                        }
                        Some(Ok(Message::Binary(data))) => {
                            match StreamFrame::from_binary(&data) {
                                Some(frame) => self.apply_frame(id, frame).await,
                                None => debug!("Dropped malformed binary frame from {} ({} bytes)", peer_addr, data.len()),
                            }
                        }
                        Some(Ok(Message::Ping(data))) => {
                            ws_sender.send(Message::Pong(data)).await?;
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("Observer {} requested close", peer_addr);
                            break;
                        }
                        Some(Err(e)) => {
                            warn!("Stream error from {}: {}", peer_addr, e);
                            break;
                        }
                        None => break,
                    }
                }
                _ = self.shutdown_rx.recv() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }

        Ok(())
    }

    async fn apply_frame(&self, id: &str, frame: StreamFrame) {
        match frame {
            StreamFrame::Input(data) => {
                if data.is_empty() {
                    return;
                }
                match self.hub.submit_input(id, &data).await {
                    Ok(true) => {}
                    Ok(false) => debug!("Session {} has no live process, input dropped", id),
                    Err(e) => warn!("Input for session {} rejected: {}", id, e),
                }
            }
            StreamFrame::Resize { cols, rows } => {
                if !valid_dimensions(cols, rows) {
                    debug!("Ignoring resize to {}x{} for session {}", cols, rows, id);
                    return;
                }
                if let Err(e) = self.hub.resize(id, TerminalSize::new(cols, rows)).await {
                    warn!("Resize for session {} rejected: {}", id, e);
                }
            }
        }
    }
}

async fn send_envelope(ws_sender: &mut WsSink, message: ServerMessage) -> anyhow::Result<()> {
    let json = ServerEnvelope::new(message).to_json()?;
    ws_sender.send(Message::Text(json)).await?;
    Ok(())
}

fn not_found(path: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(format!("no route for {}", path)));
    *response.status_mut() = StatusCode::NOT_FOUND;
    response
}

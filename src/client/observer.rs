//! Reconnecting observer for one session's streaming channel

use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use crate::server::{stream_path, StreamFrame};

/// How one connection ended
#[derive(Debug, PartialEq, Eq)]
enum Disconnect {
    /// Network drop or server close; retry
    Lost,
    /// The relay does not know the session
    Rejected(String),
    /// Local input ended
    InputClosed,
    Shutdown,
}

/// Streams a session's output to a local sink and forwards local input,
/// reconnecting with backoff until input ends or shutdown fires
pub struct ObserverClient {
    url: String,
    session_id: String,
    backoff: Backoff,
}

impl ObserverClient {
    /// `base_url` is the relay root, e.g. `ws://127.0.0.1:7681`
    pub fn new(base_url: &str, session_id: impl Into<String>) -> Self {
        let session_id = session_id.into();
        Self {
            url: format!("{}{}", base_url.trim_end_matches('/'), stream_path(&session_id)),
            session_id,
            backoff: Backoff::new(),
        }
    }

    /// Run the observer loop.
    ///
    /// Output frames are written to `output` in arrival order. Returns `Ok`
    /// when `input` closes or `shutdown` fires, and an error if the relay
    /// rejects the session.
    pub async fn run<W>(
        &mut self,
        mut input: mpsc::Receiver<StreamFrame>,
        output: &mut W,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<()>
    where
        W: AsyncWrite + Unpin + Send,
    {
        loop {
            let ws = tokio::select! {
                result = connect_async(self.url.as_str()) => result,
                _ = shutdown.recv() => return Ok(()),
            };

            let outcome = match ws {
                Ok((ws, _)) => {
                    self.backoff.reset();
                    info!("Observing session {} at {}", self.session_id, self.url);
                    self.pump(ws, &mut input, output, &mut shutdown).await
                }
                Err(e) => {
                    warn!("Connect to {} failed: {}", self.url, e);
                    Disconnect::Lost
                }
            };

            match outcome {
                Disconnect::Lost => {}
                Disconnect::Rejected(reason) => {
                    anyhow::bail!("relay rejected session {}: {}", self.session_id, reason)
                }
                Disconnect::InputClosed | Disconnect::Shutdown => return Ok(()),
            }

            let delay = self.backoff.next_delay();
            info!(
                "Reconnecting to session {} in {:?} (attempt {})",
                self.session_id,
                delay,
                self.backoff.attempts()
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = shutdown.recv() => return Ok(()),
            }
        }
    }

    async fn pump<W>(
        &self,
        ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
        input: &mut mpsc::Receiver<StreamFrame>,
        output: &mut W,
        shutdown: &mut broadcast::Receiver<()>,
    ) -> Disconnect
    where
        W: AsyncWrite + Unpin + Send,
    {
        let (mut ws_sender, mut ws_receiver) = ws.split();

        loop {
            tokio::select! {
                msg = ws_receiver.next() => {
                    match msg {
                        Some(Ok(Message::Binary(data))) => {
                            if output.write_all(&data).await.is_err() || output.flush().await.is_err() {
                                warn!("Output sink for session {} closed", self.session_id);
                                return Disconnect::InputClosed;
                            }
                        }
                        Some(Ok(Message::Close(Some(frame)))) if frame.code == CloseCode::Policy => {
                            return Disconnect::Rejected(frame.reason.to_string());
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            debug!("Stream for session {} closed by relay", self.session_id);
                            return Disconnect::Lost;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!("Stream error for session {}: {}", self.session_id, e);
                            return Disconnect::Lost;
                        }
                    }
                }
                frame = input.recv() => {
                    match frame {
                        Some(frame) => {
                            if ws_sender.send(Message::Binary(frame.to_binary())).await.is_err() {
                                return Disconnect::Lost;
                            }
                        }
                        None => {
                            let _ = ws_sender.send(Message::Close(None)).await;
                            return Disconnect::InputClosed;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    return Disconnect::Shutdown;
                }
            }
        }
    }
}

#[cfg(test)]
impl ObserverClient {
    fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    fn url(&self) -> &str {
        &self.url
    }

    fn backoff(&self) -> &Backoff {
        &self.backoff
    }
}

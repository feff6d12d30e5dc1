//! Control channel client used by the CLI subcommands

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::relay::SessionRecord;
use crate::server::{
    ClientEnvelope, ClientMessage, ServerEnvelope, ServerMessage, CONTROL_PATH,
    MIN_PROTOCOL_VERSION,
};

/// One request/response connection to the relay's control channel
pub struct ControlClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl ControlClient {
    /// Connect to `base_url` (e.g. `ws://127.0.0.1:7681`) and read the welcome
    pub async fn connect(base_url: &str) -> anyhow::Result<Self> {
        let url = format!("{}{}", base_url.trim_end_matches('/'), CONTROL_PATH);
        let (ws, _) = connect_async(url.as_str()).await?;
        let mut client = Self { ws };

        match client.receive().await? {
            ServerMessage::Welcome { version, .. } if version >= MIN_PROTOCOL_VERSION => {
                debug!("Connected to relay at {} (protocol v{})", url, version);
                Ok(client)
            }
            ServerMessage::Welcome { version, .. } => {
                anyhow::bail!("relay speaks protocol v{}, need v{}", version, MIN_PROTOCOL_VERSION)
            }
            other => anyhow::bail!("expected welcome, got {:?}", other),
        }
    }

    /// Send one message and wait for its reply
    pub async fn request(&mut self, message: ClientMessage) -> anyhow::Result<ServerMessage> {
        let json = ClientEnvelope::new(message).to_json()?;
        self.ws.send(Message::Text(json)).await?;
        self.receive().await
    }

    pub async fn list_sessions(&mut self, include_archived: bool) -> anyhow::Result<Vec<SessionRecord>> {
        match self
            .request(ClientMessage::list_sessions(include_archived))
            .await?
        {
            ServerMessage::SessionList { sessions } => Ok(sessions),
            other => Err(unexpected(other)),
        }
    }

    pub async fn create_session(
        &mut self,
        name: String,
        group: Option<String>,
        working_dir: Option<String>,
    ) -> anyhow::Result<SessionRecord> {
        let message = ClientMessage::CreateSession {
            name,
            group,
            working_dir,
            initial_input: None,
        };
        match self.request(message).await? {
            ServerMessage::SessionCreated { session } => Ok(session),
            other => Err(unexpected(other)),
        }
    }

    pub async fn delete_session(&mut self, session_id: &str) -> anyhow::Result<()> {
        match self.request(ClientMessage::delete_session(session_id)).await? {
            ServerMessage::SessionDeleted { .. } => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        self.ws.close(None).await?;
        Ok(())
    }

    async fn receive(&mut self) -> anyhow::Result<ServerMessage> {
        while let Some(msg) = self.ws.next().await {
            match msg? {
                Message::Text(text) => return Ok(ServerEnvelope::from_json(&text)?.message),
                Message::Close(_) => break,
                _ => {}
            }
        }
        anyhow::bail!("control channel closed")
    }
}

fn unexpected(message: ServerMessage) -> anyhow::Error {
    match message {
        ServerMessage::Error { message, code, .. } => match code {
            Some(code) => anyhow::anyhow!("{} ({:?})", message, code),
            None => anyhow::anyhow!(message),
        },
        other => anyhow::anyhow!("unexpected reply: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::testing::harness;
    use crate::server::testing::start;

    #[tokio::test]
    async fn test_create_list_delete() {
        let h = harness();
        let (server, addr) = start(&h).await;
        let mut client = ControlClient::connect(&format!("ws://{}", addr)).await.unwrap();

        let dir = std::env::temp_dir().to_string_lossy().into_owned();
        let session = client
            .create_session("remote".to_string(), Some("ops".to_string()), Some(dir))
            .await
            .unwrap();
        assert_eq!(session.group.as_deref(), Some("ops"));

        let sessions = client.list_sessions(false).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].id, session.id);

        client.delete_session(&session.id).await.unwrap();
        let err = client.delete_session(&session.id).await.unwrap_err();
        assert!(err.to_string().contains("NotFound"));

        client.close().await.unwrap();
        server.shutdown();
    }
}

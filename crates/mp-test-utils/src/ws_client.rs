//! WebSocket test client.
//!
//! Connects to a running server, speaks the `type`-tagged JSON protocol,
//! and skips control frames so tests read application messages only.

use futures_util::{SinkExt, StreamExt};
use mp_protocol::{AuthRequest, ClientMessage, ServerMessage};
use std::time::Duration;
use tokio_tungstenite::MaybeTlsStream;
use tokio_tungstenite::tungstenite::protocol::Message;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(5);

pub struct TestWsClient {
    write: futures_util::stream::SplitSink<WsStream, Message>,
    read: futures_util::stream::SplitStream<WsStream>,
}

impl TestWsClient {
    pub async fn connect(url: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let (ws_stream, _response) = tokio_tungstenite::connect_async(url).await?;
        let (write, read) = ws_stream.split();
        Ok(Self { write, read })
    }

    /// Connect and run the `auth` handshake; returns the `auth:success`
    /// payload or fails on `auth:error`.
    pub async fn connect_and_auth(
        url: &str,
        token: &str,
    ) -> Result<(Self, mp_protocol::AuthSuccess), Box<dyn std::error::Error>> {
        let mut client = Self::connect(url).await?;
        client
            .send(&ClientMessage::Auth(AuthRequest {
                token: token.to_owned(),
            }))
            .await?;
        match client.recv().await? {
            ServerMessage::AuthSuccess(success) => Ok((client, success)),
            ServerMessage::AuthError(e) => Err(format!("auth rejected: {}", e.message).into()),
            other => Err(format!("expected auth reply, got {other:?}").into()),
        }
    }

    pub async fn send(&mut self, msg: &ClientMessage) -> Result<(), Box<dyn std::error::Error>> {
        let json = serde_json::to_string(msg)?;
        self.write.send(Message::Text(json.into())).await?;
        Ok(())
    }

    /// Next application message, skipping pings/pongs; errors after 5 s.
    pub async fn recv(&mut self) -> Result<ServerMessage, Box<dyn std::error::Error>> {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.read.next())
                .await
                .map_err(|_| "timed out waiting for a server message")?;
            match msg {
                Some(Ok(Message::Text(text))) => {
                    let parsed: ServerMessage = serde_json::from_str(&text)?;
                    return Ok(parsed);
                }
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Close(_))) => return Err("connection closed by server".into()),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(e.into()),
                None => return Err("connection stream ended".into()),
            }
        }
    }

    /// Next message that is not a `user:count` tick (those arrive on their
    /// own schedule and tests rarely want them).
    pub async fn recv_event(&mut self) -> Result<ServerMessage, Box<dyn std::error::Error>> {
        loop {
            match self.recv().await? {
                ServerMessage::UserCount(_) => continue,
                other => return Ok(other),
            }
        }
    }

    pub async fn close(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.write.send(Message::Close(None)).await?;
        Ok(())
    }
}

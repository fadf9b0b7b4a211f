//! Relay sessions over an axum WebSocket.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket};
use tracing::{debug, info};

use crate::error::ChannelError;
use crate::session::controller::{SessionController, SessionMode};
use crate::session::protocol::{RelayConnection, RelayReply};

const CHANNEL_NAME: &str = "relay";

/// A [`RelayConnection`] backed by an upgraded WebSocket.
pub struct WsRelay {
    socket: WebSocket,
}

impl WsRelay {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

#[async_trait]
impl RelayConnection for WsRelay {
    async fn recv_text(&mut self) -> Result<Option<String>, ChannelError> {
        loop {
            match self.socket.recv().await {
                Some(Ok(Message::Text(text))) => return Ok(Some(text.to_string())),
                Some(Ok(Message::Ping(data))) => {
                    if self.socket.send(Message::Pong(data)).await.is_err() {
                        return Ok(None);
                    }
                }
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => debug!("Skipping non-text relay frame"),
                Some(Err(e)) => {
                    return Err(ChannelError::Disconnected {
                        name: CHANNEL_NAME.to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }
    }

    async fn send(&mut self, reply: &RelayReply) -> Result<(), ChannelError> {
        let json = serde_json::to_string(reply)
            .map_err(|e| ChannelError::InvalidMessage(e.to_string()))?;
        self.socket
            .send(Message::Text(json.into()))
            .await
            .map_err(|e| ChannelError::SendFailed {
                name: CHANNEL_NAME.to_string(),
                reason: e.to_string(),
            })
    }
}

/// Serve one upgraded relay socket until the session ends.
pub async fn serve_relay(socket: WebSocket, controller: Arc<SessionController>, mode: SessionMode) {
    info!(?mode, "Relay connected");
    let exit = controller.run(WsRelay::new(socket), mode).await;
    info!(?mode, exit = ?exit, "Relay connection closed");
}

//! Relay wire protocol: JSON events over the call's WebSocket.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ChannelError;

/// An event received from the relay.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayEvent {
    /// First event of every call.
    Setup {
        #[serde(rename = "callSid", default)]
        call_sid: Option<String>,
        #[serde(default)]
        from: Option<String>,
        #[serde(default)]
        to: Option<String>,
    },
    /// One caller utterance.
    Prompt {
        #[serde(rename = "voicePrompt", default)]
        voice_prompt: String,
    },
    Dtmf {
        #[serde(default)]
        digit: String,
    },
    End {
        #[serde(default)]
        reason: Option<String>,
    },
    /// Anything else the relay may send (interrupts, errors, info).
    #[serde(other)]
    Other,
}

/// An event sent back to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RelayReply {
    /// A speakable chunk. `last` closes the agent's turn.
    Text { token: String, last: bool },
    /// Hang up.
    End,
}

impl RelayReply {
    pub fn text(token: impl Into<String>, last: bool) -> Self {
        Self::Text {
            token: token.into(),
            last,
        }
    }
}

/// Parse one inbound frame.
pub fn parse_event(raw: &str) -> Result<RelayEvent, ChannelError> {
    serde_json::from_str(raw).map_err(|e| ChannelError::InvalidMessage(format!("{e}: {raw}")))
}

/// A duplex relay connection, one per call.
#[async_trait]
pub trait RelayConnection: Send {
    /// Next text frame. `Ok(None)` once the peer has closed.
    async fn recv_text(&mut self) -> Result<Option<String>, ChannelError>;

    async fn send(&mut self, reply: &RelayReply) -> Result<(), ChannelError>;
}

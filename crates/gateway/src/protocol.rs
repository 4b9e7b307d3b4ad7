//! WebSocket protocol message types.
//!
//! Defines the JSON message format for the push channel.

use crate::sequencer::ChangeEvent;
use axum::extract::ws::Message;
use serde::{Deserialize, Serialize};

// ============================================================================
// Client → Server Messages
// ============================================================================

/// Message sent from client to server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Application-level keepalive.
    Ping,
}

// ============================================================================
// Server → Client Messages
// ============================================================================

/// Message sent from server to client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// First message on every connection: the sequence the subscriber starts from.
    Sync {
        sequence: u64,
    },
    /// One accepted mutation.
    Change {
        sequence: u64,
        key: String,
        value: String,
    },
    /// The subscriber missed changes that can no longer be replayed and must
    /// re-fetch full state.
    ResyncRequired {
        /// Current sequence at the time the gap was detected.
        sequence: u64,
        reason: ResyncReason,
    },
    /// Pong response to ping.
    Pong,
    /// Error message.
    Error {
        message: String,
        code: String,
    },
}

/// Why a subscriber was told to resync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    /// The requested resume point is older than the retained backlog, or
    /// belongs to a previous gateway lifetime.
    BacklogGap,
    /// The subscriber fell too far behind live delivery and was dropped.
    Lagged,
}

impl ServerMessage {
    /// Serialize into a WebSocket text frame.
    pub fn to_frame(&self) -> serde_json::Result<Message> {
        Ok(Message::Text(serde_json::to_string(self)?.into()))
    }
}

impl From<&ChangeEvent> for ServerMessage {
    fn from(event: &ChangeEvent) -> Self {
        ServerMessage::Change {
            sequence: event.sequence,
            key: event.key.clone(),
            value: event.value.clone(),
        }
    }
}

/// Decode a frame produced by [`ServerMessage::to_frame`].
#[cfg(test)]
pub(crate) fn decode_frame(frame: Message) -> ServerMessage {
    match frame {
        Message::Text(text) => serde_json::from_str(text.as_str()).unwrap(),
        other => panic!("expected text frame, got {:?}", other),
    }
}

//! # Client Wire Protocol
//!
//! Messages exchanged with the connecting client over the duplex socket.
//!
//! ## Payload Kinds:
//! - **Binary frames**: raw PCM audio (16-bit LE, 16kHz, mono). Inbound is
//!   microphone input, outbound is synthesized agent speech sent as produced.
//! - **Text frames**: JSON events tagged by `type`, see [`ClientEvent`] and
//!   [`ServerEvent`].

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Structured events sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// User is about to start a new utterance
    StartAudioTurn,

    /// Keep-alive; refreshes the idle timer
    Heartbeat,
}

/// Structured events sent to the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Session established, conversation can begin
    ConnectionReady {
        #[serde(rename = "connectionId")]
        connection_id: String,
    },

    AgentSpeakingStarted,

    AgentTurnComplete,

    AgentTurnInterrupted,

    /// User spoke over the agent; agent output was cancelled
    BargeInDetected,

    Error {
        /// Human-readable error message
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }
}

/// Inbound traffic handed from the socket to the connection's orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientInbound {
    Audio(Bytes),
    Event(ClientEvent),
}

/// Outbound traffic handed from the orchestrator to the socket.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientOutbound {
    Audio(Bytes),
    Event(ServerEvent),
    /// Terminal signal: close the socket normally
    Close,
}

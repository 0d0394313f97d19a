//! Message envelope and route names.
//!
//! Every message is a `(payload, route)` pair, optionally addressed to a
//! single peer (`to`, a pipe) or to a whole channel (`channel`, a broadcast).
//! The relay stamps `from` on everything it forwards.

use fl0w_core::{Channel, PeerId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

// ============================================================================
// Routes
// ============================================================================

pub mod routes {
    //! Route names understood by the relay and the agents.

    pub const SUBSCRIBE: &str = "subscribe";
    pub const PEERS: &str = "peers";
    pub const INFO: &str = "info";
    pub const WHOAMI: &str = "whoami";
    pub const SENSOR: &str = "sensor";
    pub const WALLABY_CONTROL: &str = "wallaby_control";
    pub const STD_STREAM: &str = "std_stream";
    pub const SYNC: &str = "sync";
    pub const HOSTNAME: &str = "hostname";
    pub const PROCESSES: &str = "processes";

    /// Routes the relay handles itself.
    pub const RELAY_ROUTES: [&str; 4] = [INFO, WHOAMI, SUBSCRIBE, PEERS];

    /// Routes the relay forwards between peers without interpreting them.
    pub const PIPE_ROUTES: [&str; 12] = [
        HOSTNAME,
        PROCESSES,
        SENSOR,
        WALLABY_CONTROL,
        STD_STREAM,
        SYNC,
        "identify",
        "list_programs",
        "run_program",
        "stop_programs",
        "shutdown",
        "reboot",
    ];

    /// Returns true if the relay forwards this route between peers.
    pub fn is_pipe_route(route: &str) -> bool {
        PIPE_ROUTES.contains(&route)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Maximum encoded envelope size (1 MB)
pub const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// One message on the wire (newline-delimited JSON).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Logical endpoint used for dispatch
    pub route: String,

    /// Route-specific payload
    #[serde(default)]
    pub data: Value,

    /// Target peer for a pipe
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to: Option<PeerId>,

    /// Originating peer, stamped by the relay
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<PeerId>,

    /// Target channel for a broadcast
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<Channel>,
}

impl Envelope {
    /// Creates a plain message to the directly connected peer.
    pub fn send(route: &str, data: impl Into<Value>) -> Self {
        Self {
            route: route.to_string(),
            data: data.into(),
            to: None,
            from: None,
            channel: None,
        }
    }

    /// Creates a message addressed to one peer via the relay.
    pub fn pipe(route: &str, data: impl Into<Value>, to: PeerId) -> Self {
        Self {
            to: Some(to),
            ..Self::send(route, data)
        }
    }

    /// Creates a message for every peer on a channel.
    pub fn broadcast(route: &str, data: impl Into<Value>, channel: Channel) -> Self {
        Self {
            channel: Some(channel),
            ..Self::send(route, data)
        }
    }

    /// Returns a copy prepared for delivery: `from` stamped, addressing cleared.
    pub fn forwarded_from(mut self, from: PeerId) -> Self {
        self.from = Some(from);
        self.to = None;
        self.channel = None;
        self
    }

    /// Parses one line of input.
    pub fn decode(line: &str) -> Result<Self, ProtocolError> {
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::Parse(e.to_string()))
    }

    /// Encodes the envelope as a single line (without the trailing newline).
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|e| ProtocolError::Serialize(e.to_string()))
    }
}

/// Errors produced while decoding or encoding envelopes.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

//! Peer identity and channel tags.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::DomainError;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Relay-assigned identifier for a connected peer.
///
/// Assigned once at accept time (e.g. "peer-7") and never reused within a
/// relay process.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

/// Prefix used for relay-assigned peer IDs.
pub const PEER_ID_PREFIX: &str = "peer-";

impl PeerId {
    /// Creates a new PeerId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Creates the ID for the n-th accepted connection.
    pub fn from_connection_number(n: u64) -> Self {
        Self(format!("{PEER_ID_PREFIX}{n}"))
    }

    /// Returns the underlying string reference.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PeerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl AsRef<str> for PeerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

// ============================================================================
// Channel
// ============================================================================

/// Coarse peer category used for presence grouping and broadcast scoping.
///
/// Encoded on the wire as an integer: 1 = Editor, 2 = Controller, 3 = Web.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Channel {
    /// Editor / IDE clients
    Editor,

    /// Robot controllers
    Controller,

    /// Browser observers
    Web,
}

impl Channel {
    /// Every channel, in wire order.
    pub const ALL: [Channel; 3] = [Channel::Editor, Channel::Controller, Channel::Web];

    /// Returns the wire tag for this channel.
    pub const fn tag(self) -> u8 {
        match self {
            Self::Editor => 1,
            Self::Controller => 2,
            Self::Web => 3,
        }
    }

    /// Parses a wire tag, returning `None` for anything outside the closed set.
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(Self::Editor),
            2 => Some(Self::Controller),
            3 => Some(Self::Web),
            _ => None,
        }
    }

    /// Parses a JSON value holding a wire tag.
    pub fn from_value(value: &serde_json::Value) -> Option<Self> {
        value.as_i64().and_then(Self::from_tag)
    }

    /// Returns a human-readable label.
    pub fn label(self) -> &'static str {
        match self {
            Self::Editor => "Editor",
            Self::Controller => "Controller",
            Self::Web => "Web",
        }
    }
}

impl TryFrom<u8> for Channel {
    type Error = DomainError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        Self::from_tag(i64::from(tag)).ok_or_else(|| DomainError::InvalidFieldValue {
            field: "channel".to_string(),
            value: tag.to_string(),
            expected: "1, 2 or 3".to_string(),
        })
    }
}

impl From<Channel> for u8 {
    fn from(channel: Channel) -> Self {
        channel.tag()
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

// ============================================================================
// Peer
// ============================================================================

/// Default display name for peers that never sent one.
pub const DEFAULT_PEER_NAME: &str = "Unknown";

/// Identity and presence data for a connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    /// Relay-assigned ID
    pub id: PeerId,

    /// Remote address of the connection
    pub address: String,

    /// Remote port of the connection
    pub port: u16,

    /// Display name (defaults to "Unknown")
    pub name: String,

    /// Channel tag, unset until the peer sends `subscribe`
    pub channel: Option<Channel>,
}

impl PeerInfo {
    /// Creates an untagged peer with the default name.
    pub fn new(id: PeerId, address: impl Into<String>, port: u16) -> Self {
        Self {
            id,
            address: address.into(),
            port,
            name: DEFAULT_PEER_NAME.to_string(),
            channel: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_id_from_connection_number() {
        let id = PeerId::from_connection_number(3);
        assert_eq!(id.as_str(), "peer-3");
        assert_eq!(id.to_string(), "peer-3");
    }

    #[test]
    fn test_channel_tags() {
        for channel in Channel::ALL {
            assert_eq!(Channel::from_tag(i64::from(channel.tag())), Some(channel));
        }
        assert_eq!(Channel::from_tag(0), None);
        assert_eq!(Channel::from_tag(4), None);
        assert_eq!(Channel::from_tag(-1), None);
    }

    #[test]
    fn test_channel_serde_as_integer() {
        let json = serde_json::to_string(&Channel::Controller).unwrap();
        assert_eq!(json, "2");

        let parsed: Channel = serde_json::from_str("3").unwrap();
        assert_eq!(parsed, Channel::Web);

        assert!(serde_json::from_str::<Channel>("9").is_err());
    }

    #[test]
    fn test_channel_from_value_rejects_non_integers() {
        assert_eq!(Channel::from_value(&serde_json::json!(1)), Some(Channel::Editor));
        assert_eq!(Channel::from_value(&serde_json::json!("1")), None);
        assert_eq!(Channel::from_value(&serde_json::json!(1.5)), None);
    }

    #[test]
    fn test_peer_info_defaults() {
        let info = PeerInfo::new(PeerId::new("peer-1"), "127.0.0.1", 40000);
        assert_eq!(info.name, "Unknown");
        assert!(info.channel.is_none());
    }
}

//! Registry actor commands and errors.
//!
//! Every command that expects an answer carries a `oneshot` sender; the
//! actor ignores send failures on it (the caller may have gone away).

use fl0w_core::{Channel, PeerId, PeerInfo};
use fl0w_protocol::{Envelope, PeersRequest, Roster};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

/// Sender half of a connection's outbound queue.
pub type Outbox = mpsc::Sender<Envelope>;

// ============================================================================
// Registry Commands
// ============================================================================

#[derive(Debug)]
pub enum RegistryCommand {
    /// Register an accepted connection.
    ///
    /// # Errors
    /// - `RegistryError::PeerAlreadyConnected` if the id is taken
    /// - `RegistryError::RegistryFull` if at capacity
    Connect {
        info: PeerInfo,
        outbox: Outbox,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Apply a `subscribe` message: tag and/or rename, then push rosters.
    Identify {
        peer: PeerId,
        channel: Option<Channel>,
        name: Option<String>,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Apply a `peers` message to the peer's Interest Set.
    Interest {
        peer: PeerId,
        request: PeersRequest,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Forward an envelope to one peer.
    ///
    /// # Errors
    /// - `RegistryError::PeerNotFound` if the target is not connected
    /// - `RegistryError::DeliveryFailed` if its outbound queue is full or closed
    Pipe {
        from: PeerId,
        to: PeerId,
        envelope: Envelope,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Forward an envelope to every member of a channel except the sender.
    ///
    /// Responds with the number of peers it was queued for.
    Broadcast {
        from: PeerId,
        channel: Channel,
        envelope: Envelope,
        respond_to: oneshot::Sender<usize>,
    },

    /// Tear down a peer: leave its channel, drop its interest, push rosters.
    Disconnect {
        peer: PeerId,
        respond_to: oneshot::Sender<Result<(), RegistryError>>,
    },

    /// Roster for the observer's persisted Interest Set.
    GetRoster {
        observer: PeerId,
        respond_to: oneshot::Sender<Roster>,
    },

    GetInterest {
        observer: PeerId,
        respond_to: oneshot::Sender<Vec<Channel>>,
    },

    GetChannelMembers {
        channel: Channel,
        respond_to: oneshot::Sender<Vec<PeerId>>,
    },

    GetPeer {
        peer: PeerId,
        respond_to: oneshot::Sender<Option<PeerInfo>>,
    },

    PeerCount {
        respond_to: oneshot::Sender<usize>,
    },
}

// ============================================================================
// Registry Errors
// ============================================================================

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("registry is full (max: {max} peers)")]
    RegistryFull { max: usize },

    #[error("peer not found: {0}")]
    PeerNotFound(PeerId),

    #[error("peer already connected: {0}")]
    PeerAlreadyConnected(PeerId),

    #[error("delivery to {0} failed")]
    DeliveryFailed(PeerId),

    /// The actor has shut down.
    #[error("response channel closed")]
    ChannelClosed,
}

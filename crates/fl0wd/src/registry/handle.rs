//! Client interface for the registry actor.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `RegistryError::ChannelClosed`; query methods
//! fall back to empty results when the actor is gone.

use fl0w_core::{Channel, PeerId, PeerInfo};
use fl0w_protocol::{Envelope, PeersRequest, Roster};
use tokio::sync::{mpsc, oneshot};

use super::commands::{Outbox, RegistryCommand, RegistryError};

// ============================================================================
// Registry Handle
// ============================================================================

/// Cheap-to-clone handle shared by every connection task.
#[derive(Clone)]
pub struct RegistryHandle {
    sender: mpsc::Sender<RegistryCommand>,
}

impl RegistryHandle {
    pub fn new(sender: mpsc::Sender<RegistryCommand>) -> Self {
        Self { sender }
    }

    /// Sends a command and waits for its reply.
    async fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<T>) -> RegistryCommand,
    ) -> Result<T, RegistryError> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(build(tx))
            .await
            .map_err(|_| RegistryError::ChannelClosed)?;
        rx.await.map_err(|_| RegistryError::ChannelClosed)
    }

    /// Registers an accepted connection and its outbound queue.
    pub async fn connect(&self, info: PeerInfo, outbox: Outbox) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Connect {
            info,
            outbox,
            respond_to,
        })
        .await?
    }

    /// Tags and/or renames a peer (a `subscribe` message).
    pub async fn identify(
        &self,
        peer: PeerId,
        channel: Option<Channel>,
        name: Option<String>,
    ) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Identify {
            peer,
            channel,
            name,
            respond_to,
        })
        .await?
    }

    /// Applies a `peers` message.
    pub async fn interest(&self, peer: PeerId, request: PeersRequest) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Interest {
            peer,
            request,
            respond_to,
        })
        .await?
    }

    pub async fn pipe(&self, from: PeerId, to: PeerId, envelope: Envelope) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Pipe {
            from,
            to,
            envelope,
            respond_to,
        })
        .await?
    }

    /// Returns how many peers the envelope was queued for.
    pub async fn broadcast(
        &self,
        from: PeerId,
        channel: Channel,
        envelope: Envelope,
    ) -> Result<usize, RegistryError> {
        self.request(|respond_to| RegistryCommand::Broadcast {
            from,
            channel,
            envelope,
            respond_to,
        })
        .await
    }

    pub async fn disconnect(&self, peer: PeerId) -> Result<(), RegistryError> {
        self.request(|respond_to| RegistryCommand::Disconnect { peer, respond_to })
            .await?
    }

    /// Roster for the observer's persisted Interest Set.
    pub async fn roster(&self, observer: PeerId) -> Roster {
        self.request(|respond_to| RegistryCommand::GetRoster {
            observer,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn interest_of(&self, observer: PeerId) -> Vec<Channel> {
        self.request(|respond_to| RegistryCommand::GetInterest {
            observer,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn channel_members(&self, channel: Channel) -> Vec<PeerId> {
        self.request(|respond_to| RegistryCommand::GetChannelMembers {
            channel,
            respond_to,
        })
        .await
        .unwrap_or_default()
    }

    pub async fn get_peer(&self, peer: PeerId) -> Option<PeerInfo> {
        self.request(|respond_to| RegistryCommand::GetPeer { peer, respond_to })
            .await
            .ok()
            .flatten()
    }

    pub async fn peer_count(&self) -> usize {
        self.request(|respond_to| RegistryCommand::PeerCount { respond_to })
            .await
            .unwrap_or(0)
    }
}

//! Registry actor - owns channel membership, interest sets and outboxes.
//!
//! The actor is the single owner of presence state. Commands are processed
//! one at a time, so no two mutations of the same map ever race even though
//! connections dispatch concurrently.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Outbound sends use `try_send`; a full or closed queue counts as a failed send

use std::collections::HashMap;

use fl0w_core::{Channel, PeerId, PeerInfo};
use fl0w_protocol::{routes, Envelope, InterestOp, PeersRequest, Roster};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::channels::ChannelRegistry;
use super::commands::{Outbox, RegistryCommand, RegistryError};
use super::presence::{roster_for, InterestTable};

/// Maximum number of simultaneously connected peers.
pub const MAX_PEERS: usize = 256;

// ============================================================================
// Registry Actor
// ============================================================================

pub struct RegistryActor {
    receiver: mpsc::Receiver<RegistryCommand>,

    /// Peer identity and channel membership
    channels: ChannelRegistry,

    /// Per-observer roster interest
    interests: InterestTable,

    /// Outbound queue of every connected peer
    outboxes: HashMap<PeerId, Outbox>,
}

impl RegistryActor {
    pub fn new(receiver: mpsc::Receiver<RegistryCommand>) -> Self {
        Self {
            receiver,
            channels: ChannelRegistry::new(),
            interests: InterestTable::new(),
            outboxes: HashMap::new(),
        }
    }

    /// Processes commands until every handle is dropped.
    pub async fn run(mut self) {
        info!("Registry actor starting");

        while let Some(cmd) = self.receiver.recv().await {
            self.handle_command(cmd);
        }

        info!(peers = self.channels.len(), "Registry actor stopped");
    }

    fn handle_command(&mut self, cmd: RegistryCommand) {
        match cmd {
            RegistryCommand::Connect {
                info,
                outbox,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_connect(info, outbox));
            }
            RegistryCommand::Identify {
                peer,
                channel,
                name,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_identify(&peer, channel, name));
            }
            RegistryCommand::Interest {
                peer,
                request,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_interest(&peer, request));
            }
            RegistryCommand::Pipe {
                from,
                to,
                envelope,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_pipe(from, &to, envelope));
            }
            RegistryCommand::Broadcast {
                from,
                channel,
                envelope,
                respond_to,
            } => {
                let _ = respond_to.send(self.handle_broadcast(from, channel, envelope));
            }
            RegistryCommand::Disconnect { peer, respond_to } => {
                let _ = respond_to.send(self.handle_disconnect(&peer));
            }
            RegistryCommand::GetRoster {
                observer,
                respond_to,
            } => {
                let interest = self.interests.get(&observer);
                let _ = respond_to.send(roster_for(&self.channels, &observer, &interest));
            }
            RegistryCommand::GetInterest {
                observer,
                respond_to,
            } => {
                let _ = respond_to.send(self.interests.get(&observer));
            }
            RegistryCommand::GetChannelMembers {
                channel,
                respond_to,
            } => {
                let _ = respond_to.send(self.channels.members(channel));
            }
            RegistryCommand::GetPeer { peer, respond_to } => {
                let _ = respond_to.send(self.channels.get(&peer).cloned());
            }
            RegistryCommand::PeerCount { respond_to } => {
                let _ = respond_to.send(self.channels.len());
            }
        }
    }

    fn handle_connect(&mut self, info: PeerInfo, outbox: Outbox) -> Result<(), RegistryError> {
        if self.channels.contains(&info.id) {
            return Err(RegistryError::PeerAlreadyConnected(info.id));
        }
        if self.channels.len() >= MAX_PEERS {
            warn!(max = MAX_PEERS, peer_id = %info.id, "Registry full, rejecting peer");
            return Err(RegistryError::RegistryFull { max: MAX_PEERS });
        }

        debug!(
            peer_id = %info.id,
            address = %info.address,
            port = info.port,
            "Peer registered"
        );
        self.outboxes.insert(info.id.clone(), outbox);
        self.channels.insert(info);
        Ok(())
    }

    fn handle_identify(
        &mut self,
        peer: &PeerId,
        channel: Option<Channel>,
        name: Option<String>,
    ) -> Result<(), RegistryError> {
        if !self.channels.contains(peer) {
            return Err(RegistryError::PeerNotFound(peer.clone()));
        }

        if let Some(name) = name {
            self.channels.rename(peer, &name);
        }
        if let Some(channel) = channel {
            if self.channels.tag(peer, channel) {
                info!(peer_id = %peer, channel = %channel, "Peer tagged");
            }
        }

        self.push_changes(peer);
        Ok(())
    }

    fn handle_interest(&mut self, peer: &PeerId, request: PeersRequest) -> Result<(), RegistryError> {
        if !self.channels.contains(peer) {
            return Err(RegistryError::PeerNotFound(peer.clone()));
        }

        for (op, channels) in request.ops {
            match op {
                InterestOp::Subscribe => self.interests.subscribe(peer, &channels),
                InterestOp::Unsubscribe => self.interests.unsubscribe(peer, &channels),
                InterestOp::Snapshot => {}
            }
            debug!(peer_id = %peer, op = op.key(), channels = ?channels, "Interest updated");

            if op.pushes_roster() {
                // Scoped to this request, not the accumulated interest.
                let roster = roster_for(&self.channels, peer, &channels);
                if !self.send_roster(peer, &roster) {
                    self.interests.remove(peer);
                }
            }
        }
        Ok(())
    }

    fn handle_pipe(&mut self, from: PeerId, to: &PeerId, envelope: Envelope) -> Result<(), RegistryError> {
        let Some(outbox) = self.outboxes.get(to) else {
            debug!(from = %from, to = %to, route = %envelope.route, "Pipe target not connected");
            return Err(RegistryError::PeerNotFound(to.clone()));
        };

        if outbox.try_send(envelope.forwarded_from(from)).is_err() {
            warn!(to = %to, "Pipe delivery failed");
            return Err(RegistryError::DeliveryFailed(to.clone()));
        }
        Ok(())
    }

    fn handle_broadcast(&mut self, from: PeerId, channel: Channel, envelope: Envelope) -> usize {
        let forwarded = envelope.forwarded_from(from.clone());
        let mut delivered = 0;

        for member in self.channels.members(channel) {
            if member == from {
                continue;
            }
            match self.outboxes.get(&member) {
                Some(outbox) if outbox.try_send(forwarded.clone()).is_ok() => delivered += 1,
                _ => warn!(to = %member, channel = %channel, "Broadcast delivery failed"),
            }
        }

        debug!(
            from = %from,
            channel = %channel,
            route = %forwarded.route,
            delivered,
            "Broadcast forwarded"
        );
        delivered
    }

    fn handle_disconnect(&mut self, peer: &PeerId) -> Result<(), RegistryError> {
        let info = self
            .channels
            .remove(peer)
            .ok_or_else(|| RegistryError::PeerNotFound(peer.clone()))?;
        self.interests.remove(peer);
        self.outboxes.remove(peer);

        info!(peer_id = %peer, channel = ?info.channel, name = %info.name, "Peer disconnected");
        self.push_changes(peer);
        Ok(())
    }

    /// Pushes fresh rosters to every interested observer.
    ///
    /// An observer whose send fails loses its Interest Set; it is not retried.
    fn push_changes(&mut self, trigger: &PeerId) {
        let mut failed = Vec::new();

        for observer in self.interests.observers() {
            let interest = self.interests.get(&observer);
            let roster = roster_for(&self.channels, &observer, &interest);
            if !self.send_roster(&observer, &roster) {
                failed.push(observer);
            }
        }

        for observer in failed {
            debug!(observer = %observer, trigger = %trigger, "Dropping unreachable observer's interest");
            self.interests.remove(&observer);
        }
    }

    fn send_roster(&self, observer: &PeerId, roster: &Roster) -> bool {
        let Some(outbox) = self.outboxes.get(observer) else {
            return false;
        };
        let data = match serde_json::to_value(roster) {
            Ok(data) => data,
            Err(e) => {
                warn!(error = %e, "Failed to serialize roster");
                return true;
            }
        };
        outbox.try_send(Envelope::send(routes::PEERS, data)).is_ok()
    }

    pub fn peer_count(&self) -> usize {
        self.channels.len()
    }
}

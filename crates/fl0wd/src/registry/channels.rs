//! Channel membership: which connected peer carries which tag.
//!
//! A peer belongs to at most one channel. Retagging moves it in one step, so
//! every membership set always equals the set of peers whose current tag is
//! that channel.

use std::collections::{BTreeSet, HashMap};

use fl0w_core::{Channel, PeerId, PeerInfo};

#[derive(Debug, Default)]
pub struct ChannelRegistry {
    peers: HashMap<PeerId, PeerInfo>,
    members: HashMap<Channel, BTreeSet<PeerId>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly accepted peer (untagged). Returns false if the id is taken.
    pub fn insert(&mut self, info: PeerInfo) -> bool {
        if self.peers.contains_key(&info.id) {
            return false;
        }
        let id = info.id.clone();
        let channel = info.channel;
        self.peers.insert(id.clone(), info);
        if let Some(channel) = channel {
            self.members.entry(channel).or_default().insert(id);
        }
        true
    }

    /// Removes a peer from its channel and forgets it.
    pub fn remove(&mut self, id: &PeerId) -> Option<PeerInfo> {
        let info = self.peers.remove(id)?;
        if let Some(channel) = info.channel {
            self.leave(channel, id);
        }
        Some(info)
    }

    /// Tags a peer with `channel`. Returns true if its membership changed.
    pub fn tag(&mut self, id: &PeerId, channel: Channel) -> bool {
        let Some(info) = self.peers.get_mut(id) else {
            return false;
        };
        let previous = info.channel.replace(channel);
        if previous == Some(channel) {
            return false;
        }

        if let Some(old) = previous {
            self.leave(old, id);
        }
        self.members.entry(channel).or_default().insert(id.clone());
        true
    }

    /// Sets a peer's display name. Returns true if it changed.
    pub fn rename(&mut self, id: &PeerId, name: &str) -> bool {
        match self.peers.get_mut(id) {
            Some(info) if info.name != name => {
                info.name = name.to_string();
                true
            }
            _ => false,
        }
    }

    fn leave(&mut self, channel: Channel, id: &PeerId) {
        if let Some(set) = self.members.get_mut(&channel) {
            set.remove(id);
            if set.is_empty() {
                self.members.remove(&channel);
            }
        }
    }

    pub fn get(&self, id: &PeerId) -> Option<&PeerInfo> {
        self.peers.get(id)
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.contains_key(id)
    }

    /// Members of `channel`, in id order.
    pub fn members(&self, channel: Channel) -> Vec<PeerId> {
        self.members
            .get(&channel)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(n: u64) -> PeerInfo {
        PeerInfo::new(PeerId::from_connection_number(n), "127.0.0.1", 40000 + n as u16)
    }

    /// Membership must equal "peers whose tag is this channel".
    fn assert_consistent(registry: &ChannelRegistry) {
        for channel in Channel::ALL {
            let expected: Vec<PeerId> = {
                let mut ids: Vec<PeerId> = registry
                    .peers
                    .values()
                    .filter(|p| p.channel == Some(channel))
                    .map(|p| p.id.clone())
                    .collect();
                ids.sort();
                ids
            };
            assert_eq!(registry.members(channel), expected, "channel {channel}");
        }
    }

    #[test]
    fn test_tag_moves_between_channels() {
        let mut registry = ChannelRegistry::new();
        let a = peer(1);
        let id = a.id.clone();
        registry.insert(a);

        assert!(registry.tag(&id, Channel::Editor));
        assert_eq!(registry.members(Channel::Editor), vec![id.clone()]);

        assert!(registry.tag(&id, Channel::Web));
        assert!(registry.members(Channel::Editor).is_empty());
        assert_eq!(registry.members(Channel::Web), vec![id.clone()]);

        // Same tag again is a no-op.
        assert!(!registry.tag(&id, Channel::Web));
        assert_consistent(&registry);
    }

    #[test]
    fn test_remove_clears_membership() {
        let mut registry = ChannelRegistry::new();
        let a = peer(1);
        let id = a.id.clone();
        registry.insert(a);
        registry.tag(&id, Channel::Controller);

        let removed = registry.remove(&id).unwrap();
        assert_eq!(removed.channel, Some(Channel::Controller));
        assert!(registry.members(Channel::Controller).is_empty());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_tag_unknown_peer_is_ignored() {
        let mut registry = ChannelRegistry::new();
        assert!(!registry.tag(&PeerId::new("ghost"), Channel::Editor));
        assert!(registry.members(Channel::Editor).is_empty());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut registry = ChannelRegistry::new();
        assert!(registry.insert(peer(1)));
        assert!(!registry.insert(peer(1)));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_membership_consistent_over_mixed_sequence() {
        let mut registry = ChannelRegistry::new();
        for n in 0..6 {
            registry.insert(peer(n));
        }

        // Deterministic interleaving of retags and disconnects.
        let steps: [(u64, Option<Channel>); 12] = [
            (0, Some(Channel::Editor)),
            (1, Some(Channel::Editor)),
            (2, Some(Channel::Controller)),
            (0, Some(Channel::Web)),
            (3, Some(Channel::Controller)),
            (1, None),
            (4, Some(Channel::Editor)),
            (2, Some(Channel::Editor)),
            (5, Some(Channel::Web)),
            (3, None),
            (0, Some(Channel::Controller)),
            (4, Some(Channel::Editor)),
        ];

        for (n, action) in steps {
            let id = PeerId::from_connection_number(n);
            match action {
                Some(channel) => {
                    registry.tag(&id, channel);
                }
                None => {
                    registry.remove(&id);
                }
            }
            assert_consistent(&registry);
        }

        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn test_rename() {
        let mut registry = ChannelRegistry::new();
        let a = peer(1);
        let id = a.id.clone();
        registry.insert(a);

        assert_eq!(registry.get(&id).unwrap().name, "Unknown");
        assert!(registry.rename(&id, "bot-7"));
        assert!(!registry.rename(&id, "bot-7"));
        assert_eq!(registry.get(&id).unwrap().name, "bot-7");
    }
}

//! Interest sets and roster computation.

use std::collections::{BTreeSet, HashMap};

use fl0w_core::{Channel, PeerId};
use fl0w_protocol::{Roster, RosterEntry};

use super::channels::ChannelRegistry;

/// Per-observer set of channels it wants rosters for.
#[derive(Debug, Default)]
pub struct InterestTable {
    interests: HashMap<PeerId, BTreeSet<Channel>>,
}

impl InterestTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: &PeerId, channels: &[Channel]) {
        if channels.is_empty() {
            return;
        }
        self.interests
            .entry(observer.clone())
            .or_default()
            .extend(channels.iter().copied());
    }

    /// Removes channels; an emptied set is dropped entirely.
    pub fn unsubscribe(&mut self, observer: &PeerId, channels: &[Channel]) {
        if let Some(set) = self.interests.get_mut(observer) {
            for channel in channels {
                set.remove(channel);
            }
            if set.is_empty() {
                self.interests.remove(observer);
            }
        }
    }

    /// Drops an observer's whole Interest Set.
    pub fn remove(&mut self, observer: &PeerId) -> bool {
        self.interests.remove(observer).is_some()
    }

    pub fn get(&self, observer: &PeerId) -> Vec<Channel> {
        self.interests
            .get(observer)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Observers with a non-empty Interest Set.
    pub fn observers(&self) -> Vec<PeerId> {
        self.interests
            .iter()
            .filter(|(_, set)| !set.is_empty())
            .map(|(id, _)| id.clone())
            .collect()
    }
}

/// Every peer on one of `channels`, excluding `observer`.
pub fn roster_for(registry: &ChannelRegistry, observer: &PeerId, channels: &[Channel]) -> Roster {
    let mut roster = Roster::new();
    for &channel in channels {
        for id in registry.members(channel) {
            if &id == observer {
                continue;
            }
            if let Some(info) = registry.get(&id) {
                roster.insert(
                    id,
                    RosterEntry {
                        name: info.name.clone(),
                        address: info.address.clone(),
                        port: info.port,
                        channel,
                    },
                );
            }
        }
    }
    roster
}

#[cfg(test)]
mod tests {
    use fl0w_core::PeerInfo;

    use super::*;

    fn tagged(registry: &mut ChannelRegistry, n: u64, channel: Channel) -> PeerId {
        let id = PeerId::from_connection_number(n);
        registry.insert(PeerInfo::new(id.clone(), "10.0.0.1", 5000 + n as u16));
        registry.tag(&id, channel);
        id
    }

    #[test]
    fn test_roster_excludes_observer_and_other_channels() {
        let mut registry = ChannelRegistry::new();
        let editor = tagged(&mut registry, 1, Channel::Editor);
        let other_editor = tagged(&mut registry, 2, Channel::Editor);
        let controller = tagged(&mut registry, 3, Channel::Controller);
        let _web = tagged(&mut registry, 4, Channel::Web);

        let roster = roster_for(&registry, &editor, &[Channel::Editor, Channel::Controller]);
        assert_eq!(roster.len(), 2);
        assert!(roster.contains_key(&other_editor));
        assert_eq!(roster[&controller].channel, Channel::Controller);
        assert_eq!(roster[&controller].port, 5003);
        assert!(!roster.contains_key(&editor));
    }

    #[test]
    fn test_interest_subscribe_unsubscribe() {
        let mut table = InterestTable::new();
        let observer = PeerId::new("obs");

        table.subscribe(&observer, &[Channel::Controller, Channel::Web]);
        table.subscribe(&observer, &[Channel::Controller]);
        assert_eq!(table.get(&observer), vec![Channel::Controller, Channel::Web]);

        table.unsubscribe(&observer, &[Channel::Web]);
        assert_eq!(table.get(&observer), vec![Channel::Controller]);

        table.unsubscribe(&observer, &[Channel::Controller]);
        assert!(table.observers().is_empty());
    }

    #[test]
    fn test_empty_subscribe_creates_nothing() {
        let mut table = InterestTable::new();
        table.subscribe(&PeerId::new("obs"), &[]);
        assert!(table.observers().is_empty());
    }

    #[test]
    fn test_roster_matches_interest_over_sequence() {
        let mut registry = ChannelRegistry::new();
        let observer = tagged(&mut registry, 0, Channel::Web);
        tagged(&mut registry, 1, Channel::Editor);
        tagged(&mut registry, 2, Channel::Controller);
        tagged(&mut registry, 3, Channel::Web);

        let mut table = InterestTable::new();
        let ops: [(bool, &[Channel]); 5] = [
            (true, &[Channel::Editor]),
            (true, &[Channel::Web, Channel::Controller]),
            (false, &[Channel::Editor]),
            (false, &[Channel::Web]),
            (true, &[Channel::Editor]),
        ];

        for (subscribe, channels) in ops {
            if subscribe {
                table.subscribe(&observer, channels);
            } else {
                table.unsubscribe(&observer, channels);
            }

            let interest = table.get(&observer);
            let roster = roster_for(&registry, &observer, &interest);
            for (id, entry) in &roster {
                assert_ne!(id, &observer);
                assert!(interest.contains(&entry.channel));
            }
            let expected: usize = interest
                .iter()
                .map(|c| registry.members(*c).iter().filter(|id| **id != observer).count())
                .sum();
            assert_eq!(roster.len(), expected);
        }
    }
}

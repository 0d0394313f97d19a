//! Sensor subscription engine.
//!
//! Peers subscribe to (mode, port) pairs; the engine polls the union of all
//! subscriptions (the global required set) once per tick and pipes each peer
//! only the ports it asked for.
//!
//! # Panic-Free Guarantees
//!
//! Out-of-range ports are dropped on entry. A failed pipe ends the poll loop,
//! since the relay session it belongs to is gone.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use fl0w_core::{PeerId, Port, SensorMode};
use fl0w_protocol::{routes, SensorReadings, SensorRequest, SubscriptionOp};
use tokio::sync::Mutex;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::source::SensorSource;
use crate::client::RelayLink;

type PortSets = BTreeMap<SensorMode, BTreeSet<Port>>;

// ============================================================================
// Subscription Table
// ============================================================================

/// Per-peer subscriptions and the global required set derived from them.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SubscriptionTable {
    peers: BTreeMap<PeerId, PortSets>,
    required: PortSets,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds one subscription. Returns false for out-of-range ports.
    pub fn subscribe(&mut self, peer: &PeerId, mode: SensorMode, port: Port) -> bool {
        if mode.validate_port(i64::from(port)).is_none() {
            return false;
        }
        self.peers
            .entry(peer.clone())
            .or_default()
            .entry(mode)
            .or_default()
            .insert(port);
        self.required.entry(mode).or_default().insert(port);
        true
    }

    /// Removes one subscription and drops the port from the required set if
    /// no other peer still wants it.
    pub fn unsubscribe(&mut self, peer: &PeerId, mode: SensorMode, port: Port) {
        let Some(sets) = self.peers.get_mut(peer) else {
            return;
        };
        if let Some(ports) = sets.get_mut(&mode) {
            ports.remove(&port);
            if ports.is_empty() {
                sets.remove(&mode);
            }
        }
        if sets.is_empty() {
            self.peers.remove(peer);
        }
        self.recheck(mode, port);
    }

    /// Applies a parsed `sensor` request in order.
    pub fn apply(&mut self, peer: &PeerId, request: &SensorRequest) {
        for &(op, mode, port) in &request.changes {
            match op {
                SubscriptionOp::Subscribe => {
                    self.subscribe(peer, mode, port);
                }
                SubscriptionOp::Unsubscribe => self.unsubscribe(peer, mode, port),
            }
        }
    }

    /// Drops every subscription of `peer`.
    pub fn remove_peer(&mut self, peer: &PeerId) {
        let Some(sets) = self.peers.remove(peer) else {
            return;
        };
        for (mode, ports) in sets {
            for port in ports {
                self.recheck(mode, port);
            }
        }
    }

    /// Drops every peer for which `keep` returns false.
    pub fn retain_peers(&mut self, mut keep: impl FnMut(&PeerId) -> bool) {
        let gone: Vec<PeerId> = self.peers.keys().filter(|id| !keep(id)).cloned().collect();
        for peer in &gone {
            debug!(peer_id = %peer, "Dropping sensor subscriptions of departed peer");
            self.remove_peer(peer);
        }
    }

    pub fn clear(&mut self) {
        self.peers.clear();
        self.required.clear();
    }

    pub fn is_required(&self, mode: SensorMode, port: Port) -> bool {
        self.required
            .get(&mode)
            .is_some_and(|ports| ports.contains(&port))
    }

    /// Every (mode, port) some peer subscribes to.
    pub fn required(&self) -> Vec<(SensorMode, Port)> {
        self.required
            .iter()
            .flat_map(|(&mode, ports)| ports.iter().map(move |&port| (mode, port)))
            .collect()
    }

    pub fn subscriptions_of(&self, peer: &PeerId) -> Vec<(SensorMode, Port)> {
        self.peers
            .get(peer)
            .map(|sets| {
                sets.iter()
                    .flat_map(|(&mode, ports)| ports.iter().map(move |&port| (mode, port)))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Reads every required port once and builds each peer's readings.
    ///
    /// Peers without subscriptions are absent from the result.
    pub fn sample(&self, source: &dyn SensorSource) -> Vec<(PeerId, SensorReadings)> {
        let values: BTreeMap<(SensorMode, Port), i32> = self
            .required()
            .into_iter()
            .map(|(mode, port)| ((mode, port), source.read(mode, port)))
            .collect();

        self.peers
            .iter()
            .filter_map(|(peer, sets)| {
                let mut readings = SensorReadings::default();
                for (&mode, ports) in sets {
                    for &port in ports {
                        if let Some(&value) = values.get(&(mode, port)) {
                            readings.insert(mode, port, value);
                        }
                    }
                }
                (!readings.is_empty()).then(|| (peer.clone(), readings))
            })
            .collect()
    }

    fn recheck(&mut self, mode: SensorMode, port: Port) {
        let still_needed = self
            .peers
            .values()
            .any(|sets| sets.get(&mode).is_some_and(|ports| ports.contains(&port)));
        if still_needed {
            return;
        }
        if let Some(ports) = self.required.get_mut(&mode) {
            ports.remove(&port);
            if ports.is_empty() {
                self.required.remove(&mode);
            }
        }
    }
}

// ============================================================================
// Sensor Engine
// ============================================================================

/// Shared subscription table plus the source it samples.
#[derive(Clone)]
pub struct SensorEngine {
    table: Arc<Mutex<SubscriptionTable>>,
    source: Arc<dyn SensorSource>,
}

impl SensorEngine {
    pub fn new(source: Arc<dyn SensorSource>) -> Self {
        Self {
            table: Arc::new(Mutex::new(SubscriptionTable::new())),
            source,
        }
    }

    pub async fn apply(&self, peer: &PeerId, request: &SensorRequest) {
        let mut table = self.table.lock().await;
        table.apply(peer, request);
        debug!(
            peer_id = %peer,
            subscriptions = table.subscriptions_of(peer).len(),
            "Sensor subscriptions updated"
        );
    }

    pub async fn retain_peers(&self, keep: impl FnMut(&PeerId) -> bool) {
        self.table.lock().await.retain_peers(keep);
    }

    pub async fn clear(&self) {
        self.table.lock().await.clear();
    }

    pub async fn snapshot(&self) -> SubscriptionTable {
        self.table.lock().await.clone()
    }

    /// One tick, sampled under the table lock.
    pub async fn poll_once(&self) -> Vec<(PeerId, SensorReadings)> {
        self.table.lock().await.sample(self.source.as_ref())
    }

    /// Pipes readings every `period` until cancelled or the link closes.
    pub async fn run_poll_loop(self, period: Duration, link: RelayLink, cancel: CancellationToken) {
        info!(period_ms = period.as_millis() as u64, source = self.source.name(), "Sensor poll loop started");
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            for (peer, readings) in self.poll_once().await {
                let data = match serde_json::to_value(&readings) {
                    Ok(data) => data,
                    Err(e) => {
                        debug!(error = %e, "Failed to encode sensor readings");
                        continue;
                    }
                };
                if link.pipe(routes::SENSOR, data, peer).await.is_err() {
                    debug!("Relay link closed, stopping sensor poll loop");
                    return;
                }
            }
        }

        info!("Sensor poll loop stopped");
    }
}

impl std::fmt::Debug for SensorEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SensorEngine")
            .field("source", &self.source.name())
            .finish()
    }
}

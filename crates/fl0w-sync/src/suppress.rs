//! Suppression of self-caused filesystem events.
//!
//! A marker is inserted right before a write/delete performed on behalf of
//! a peer and consumed by the one (debounced) watcher event that write
//! produces. A failed write cancels its marker right away. Markers that
//! were never consumed expire after [`MARKER_TTL`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Lifetime of an unconsumed marker.
pub const MARKER_TTL: Duration = Duration::from_secs(2);

#[derive(Debug, Default)]
pub struct SuppressionSet {
    markers: HashMap<String, Instant>,
    ttl: Option<Duration>,
}

impl SuppressionSet {
    pub fn new() -> Self {
        Self::with_ttl(MARKER_TTL)
    }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            markers: HashMap::new(),
            ttl: Some(ttl),
        }
    }

    /// Marks `path` so its next watcher event is swallowed.
    pub fn insert(&mut self, path: &str) {
        self.markers.insert(path.to_string(), Instant::now());
    }

    /// Drops a marker whose write never happened.
    pub fn cancel(&mut self, path: &str) {
        self.markers.remove(path);
    }

    /// Check-and-clear: returns true (and removes the marker) if `path` was suppressed.
    pub fn take(&mut self, path: &str) -> bool {
        self.expire();
        self.markers.remove(path).is_some()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.markers.contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.markers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.markers.is_empty()
    }

    fn expire(&mut self) {
        if let Some(ttl) = self.ttl {
            let now = Instant::now();
            self.markers
                .retain(|_, inserted| now.duration_since(*inserted) < ttl);
        }
    }
}

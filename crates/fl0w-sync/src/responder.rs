//! Responder role: reconciles a remote listing against the local tree.
//!
//! The policy is prune-on-conflict: a remote file older than the last stop
//! is deleted remotely when it is missing here or differs from the local
//! copy, and anything newer is always pulled. Conflicting edits made on both
//! sides during the same offline window lose the remote side.

use std::collections::BTreeMap;
use std::path::Path;

use fl0w_protocol::{ListedFile, SyncMessage};
use tracing::{debug, info, warn};

use crate::folder::{error_report, SyncFolder};

/// Controller-side endpoint serving many editors.
#[derive(Debug)]
pub struct Responder {
    folder: SyncFolder,
    last_stop: f64,
}

impl Responder {
    pub fn new(folder: SyncFolder) -> Self {
        Self {
            folder,
            last_stop: 0.0,
        }
    }

    pub fn folder(&self) -> &SyncFolder {
        &self.folder
    }

    pub fn last_stop(&self) -> f64 {
        self.last_stop
    }

    /// Records when this side went offline.
    pub fn mark_stopped(&mut self, at: f64) {
        debug!(at, "Recorded last stop time");
        self.last_stop = at;
    }

    /// Decides `del`/`req` for a remote listing.
    pub fn reconcile(&self, listing: &BTreeMap<String, ListedFile>) -> Vec<SyncMessage> {
        let mut del = Vec::new();
        let mut req = Vec::new();

        for (path, remote) in listing {
            if remote.mtime < self.last_stop {
                match self.folder.local_record(path) {
                    Some(local) if local.hash == remote.hash => {}
                    _ => del.push(path.clone()),
                }
            } else {
                req.push(path.clone());
            }
        }

        info!(
            listed = listing.len(),
            delete = del.len(),
            request = req.len(),
            last_stop = self.last_stop,
            "Reconciled remote listing"
        );

        let mut out = Vec::new();
        if !del.is_empty() {
            out.push(SyncMessage::Del(del));
        }
        if !req.is_empty() {
            out.push(SyncMessage::Req(req));
        }
        out
    }

    /// Applies an inbound message, returning the replies for the sender.
    pub fn handle(&mut self, message: SyncMessage) -> Vec<SyncMessage> {
        debug!(kind = message.kind(), "Responder received sync message");

        match message {
            SyncMessage::List(listing) => self.reconcile(&listing),
            SyncMessage::Add(entries) => error_report(self.folder.apply_add(&entries))
                .into_iter()
                .collect(),
            SyncMessage::Del(paths) => error_report(self.folder.apply_del(&paths))
                .into_iter()
                .collect(),
            SyncMessage::Req(paths) => {
                let (mut replies, errors) = self.folder.add_messages(&paths);
                replies.extend(error_report(errors));
                replies
            }
            SyncMessage::Err(failures) => {
                for (path, reason) in failures {
                    warn!(path = %path, reason = %reason, "Peer failed to apply file");
                }
                Vec::new()
            }
        }
    }

    /// Turns a watcher event into the message to broadcast to editors.
    pub fn local_change(&mut self, path: &Path) -> Option<SyncMessage> {
        let change = self.folder.local_event(path)?;
        self.folder.message_for(change)
    }
}

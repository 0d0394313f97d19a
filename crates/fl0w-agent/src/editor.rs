//! Editor agent: keeps a local folder in sync with one controller.
//!
//! The editor tags itself on the editor channel and subscribes to controller
//! presence. When a controller matching the configured name (or any, if none
//! is configured) appears, the [`Initiator`] starts a session by piping its
//! listing to it; from then on local edits are piped to that controller and
//! inbound `add`/`del`/`req` from any peer are applied. If the target leaves,
//! the session stops until another controller shows up.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use fl0w_core::{Channel, EditorConfig, PeerId};
use fl0w_protocol::{
    routes, Envelope, InterestOp, PeersRequest, Roster, SubscribeRequest, SyncMessage,
};
use fl0w_sync::{FolderWatcher, IgnoreSet, Initiator, SyncFolder};
use serde_json::Value;
use sysinfo::System;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::client::{Flow, RelayAgent, RelayLink};
use crate::error::Result;

/// Name announced when the host name is unknown.
const FALLBACK_NAME: &str = "editor";

pub struct EditorAgent {
    /// Controller name to sync with; first listed if unset
    controller: Option<String>,
    name: String,
    initiator: Arc<Mutex<Initiator>>,

    /// Controller the current session talks to
    target: Arc<Mutex<Option<PeerId>>>,

    session: Mutex<Option<CancellationToken>>,
}

impl EditorAgent {
    pub fn new(config: &EditorConfig) -> Result<Self> {
        let folder = SyncFolder::open(&config.folder, IgnoreSet::default())?;
        let name = System::host_name()
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| FALLBACK_NAME.to_string());

        Ok(Self {
            controller: config.controller.clone(),
            name,
            initiator: Arc::new(Mutex::new(Initiator::new(folder))),
            target: Arc::new(Mutex::new(None)),
            session: Mutex::new(None),
        })
    }

    pub async fn folder_root(&self) -> PathBuf {
        self.initiator.lock().await.folder().root().to_path_buf()
    }

    pub async fn target(&self) -> Option<PeerId> {
        self.target.lock().await.clone()
    }

    /// Picks the controller to sync with from a roster.
    pub fn select_target(&self, roster: &Roster) -> Option<PeerId> {
        roster
            .iter()
            .filter(|(_, entry)| entry.channel == Channel::Controller)
            .find(|(_, entry)| self.controller.as_ref().map_or(true, |want| *want == entry.name))
            .map(|(id, _)| id.clone())
    }

    async fn on_roster(&self, data: &Value, link: &RelayLink) {
        let Ok(roster) = serde_json::from_value::<Roster>(data.clone()) else {
            debug!("Ignoring malformed roster");
            return;
        };

        let mut target = self.target.lock().await;
        if let Some(current) = target.as_ref() {
            if roster.contains_key(current) {
                return;
            }
            info!(peer_id = %current, "Sync target left");
            *target = None;
            self.initiator.lock().await.stop();
        }

        let Some(selected) = self.select_target(&roster) else {
            debug!(wanted = ?self.controller, "No matching controller yet");
            return;
        };

        let listing = match self.initiator.lock().await.start() {
            Ok(listing) => listing,
            Err(e) => {
                warn!(error = %e, "Failed to scan sync folder");
                return;
            }
        };
        info!(peer_id = %selected, "Starting sync with controller");
        if link
            .pipe(routes::SYNC, listing.to_value(), selected.clone())
            .await
            .is_ok()
        {
            *target = Some(selected);
        }
    }

    async fn on_sync(&self, data: &Value, from: PeerId, link: &RelayLink) {
        let Some(message) = SyncMessage::parse(data) else {
            debug!(peer_id = %from, "Ignoring malformed sync message");
            return;
        };

        let replies = self.initiator.lock().await.handle(message);
        for reply in replies {
            if link.pipe(routes::SYNC, reply.to_value(), from.clone()).await.is_err() {
                return;
            }
        }
    }
}

#[async_trait]
impl RelayAgent for EditorAgent {
    async fn on_connect(&self, link: RelayLink) -> Result<()> {
        link.send_route(
            routes::SUBSCRIBE,
            SubscribeRequest::to_value(Channel::Editor, &self.name),
        )
        .await?;
        link.send_route(
            routes::PEERS,
            PeersRequest::to_value(InterestOp::Subscribe, &[Channel::Controller]),
        )
        .await?;

        let session = CancellationToken::new();
        if let Some(previous) = self.session.lock().await.replace(session.clone()) {
            previous.cancel();
        }

        let root = self.folder_root().await;
        let (watcher, events) = FolderWatcher::spawn(&root)?;
        tokio::spawn(watch_folder(
            watcher,
            events,
            Arc::clone(&self.initiator),
            Arc::clone(&self.target),
            link,
            session,
        ));

        info!(name = %self.name, folder = %root.display(), "Editor connected");
        Ok(())
    }

    async fn on_message(&self, envelope: Envelope, link: &RelayLink) -> Flow {
        match (envelope.route.as_str(), envelope.from) {
            (routes::PEERS, _) => self.on_roster(&envelope.data, link).await,
            (routes::SYNC, Some(from)) => self.on_sync(&envelope.data, from, link).await,
            (other, _) => debug!(route = %other, "Ignoring unhandled route"),
        }
        Flow::Continue
    }

    async fn on_disconnect(&self) {
        if let Some(session) = self.session.lock().await.take() {
            session.cancel();
        }
        *self.target.lock().await = None;
        self.initiator.lock().await.stop();
    }
}

/// Pipes local edits to the current target.
async fn watch_folder(
    _watcher: FolderWatcher,
    mut events: mpsc::UnboundedReceiver<PathBuf>,
    initiator: Arc<Mutex<Initiator>>,
    target: Arc<Mutex<Option<PeerId>>>,
    link: RelayLink,
    cancel: CancellationToken,
) {
    loop {
        let path = tokio::select! {
            _ = cancel.cancelled() => break,
            path = events.recv() => match path {
                Some(path) => path,
                None => break,
            },
        };

        let Some(to) = target.lock().await.clone() else {
            continue;
        };
        let message = initiator.lock().await.local_change(&path);
        if let Some(message) = message {
            debug!(path = %path.display(), kind = message.kind(), "Sending local change");
            if link.pipe(routes::SYNC, message.to_value(), to).await.is_err() {
                break;
            }
        }
    }
    debug!("Sync folder watch stopped");
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::Duration;

    use super::*;
    use serde_json::json;
    use tokio::time::timeout;

    fn agent(controller: Option<&str>) -> (tempfile::TempDir, EditorAgent) {
        let dir = tempfile::tempdir().unwrap();
        let config = EditorConfig {
            folder: dir.path().to_path_buf(),
            controller: controller.map(str::to_string),
            ..EditorConfig::default()
        };
        let agent = EditorAgent::new(&config).unwrap();
        (dir, agent)
    }

    fn roster(entries: &[(&str, &str, u8)]) -> Value {
        let mut map = serde_json::Map::new();
        for (id, name, channel) in entries {
            map.insert(
                id.to_string(),
                json!({"name": name, "address": "10.0.0.1", "port": 4000, "channel": channel}),
            );
        }
        Value::Object(map)
    }

    async fn next(outbox: &mut mpsc::Receiver<Envelope>) -> Envelope {
        timeout(Duration::from_secs(2), outbox.recv())
            .await
            .expect("timed out waiting for outbound message")
            .expect("outbox closed")
    }

    #[test]
    fn test_select_target_by_name_or_first() {
        let parsed: Roster =
            serde_json::from_value(roster(&[("peer-1", "alpha", 2), ("peer-2", "beta", 2)])).unwrap();

        let (_dir, any) = agent(None);
        assert_eq!(any.select_target(&parsed), Some(PeerId::new("peer-1")));

        let (_dir, named) = agent(Some("beta"));
        assert_eq!(named.select_target(&parsed), Some(PeerId::new("peer-2")));

        let (_dir, missing) = agent(Some("gamma"));
        assert_eq!(missing.select_target(&parsed), None);
    }

    #[tokio::test]
    async fn test_roster_starts_session_with_listing() {
        let (dir, agent) = agent(None);
        fs::write(dir.path().join("main.c"), "int main() {}").unwrap();
        let (tx, mut outbox) = mpsc::channel(16);
        let link = RelayLink::new(tx);

        agent
            .on_message(Envelope::send(routes::PEERS, roster(&[("peer-7", "bot", 2)])), &link)
            .await;

        let list = next(&mut outbox).await;
        assert_eq!(list.route, routes::SYNC);
        assert_eq!(list.to, Some(PeerId::new("peer-7")));
        assert!(list.data["list"]["main.c"]["hash"].is_string());
        assert_eq!(agent.target().await, Some(PeerId::new("peer-7")));

        // Same target again: no new session.
        agent
            .on_message(Envelope::send(routes::PEERS, roster(&[("peer-7", "bot", 2)])), &link)
            .await;
        assert!(outbox.try_recv().is_err());

        // Target gone: session stops.
        agent
            .on_message(Envelope::send(routes::PEERS, json!({})), &link)
            .await;
        assert_eq!(agent.target().await, None);
    }

    #[tokio::test]
    async fn test_req_is_answered_to_sender() {
        let (dir, agent) = agent(None);
        fs::write(dir.path().join("a.c"), "abc").unwrap();
        let (tx, mut outbox) = mpsc::channel(16);
        let link = RelayLink::new(tx);

        let req = Envelope::send(routes::SYNC, json!({"req": ["a.c"]}))
            .forwarded_from(PeerId::new("peer-3"));
        agent.on_message(req, &link).await;

        let add = next(&mut outbox).await;
        assert_eq!(add.to, Some(PeerId::new("peer-3")));
        assert_eq!(add.data["add"]["a.c"]["content"], json!("YWJj"));
    }
}

//! Initiator role: owns the canonical tree and drives a session.

use std::path::Path;

use fl0w_protocol::SyncMessage;
use tracing::{debug, info, warn};

use crate::error::SyncError;
use crate::folder::{error_report, SyncFolder};

/// Editor-side endpoint of a sync session.
#[derive(Debug)]
pub struct Initiator {
    folder: SyncFolder,
    started: bool,
}

impl Initiator {
    pub fn new(folder: SyncFolder) -> Self {
        Self {
            folder,
            started: false,
        }
    }

    pub fn folder(&self) -> &SyncFolder {
        &self.folder
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    /// Scans the tree and returns the `list` to send.
    pub fn start(&mut self) -> Result<SyncMessage, SyncError> {
        let listing = self.folder.listing()?;
        info!(
            root = %self.folder.root().display(),
            files = listing.len(),
            "Starting sync session"
        );
        self.started = true;
        Ok(SyncMessage::List(listing))
    }

    /// Stops emitting local changes until the next `start`.
    pub fn stop(&mut self) {
        self.started = false;
    }

    /// Applies an inbound message, returning the replies for the sender.
    pub fn handle(&mut self, message: SyncMessage) -> Vec<SyncMessage> {
        debug!(kind = message.kind(), "Initiator received sync message");
        let mut replies = Vec::new();

        let errors = match message {
            SyncMessage::Add(entries) => self.folder.apply_add(&entries),
            SyncMessage::Del(paths) => self.folder.apply_del(&paths),
            SyncMessage::Req(paths) => {
                let (adds, errors) = self.folder.add_messages(&paths);
                replies.extend(adds);
                errors
            }
            SyncMessage::Err(failures) => {
                for (path, reason) in failures {
                    warn!(path = %path, reason = %reason, "Peer failed to apply file");
                }
                Vec::new()
            }
            SyncMessage::List(_) => {
                debug!("Ignoring list sent to initiator");
                Vec::new()
            }
        };

        replies.extend(error_report(errors));
        replies
    }

    /// Turns a watcher event into the message for the session peer.
    pub fn local_change(&mut self, path: &Path) -> Option<SyncMessage> {
        if !self.started {
            return None;
        }
        let change = self.folder.local_event(path)?;
        self.folder.message_for(change)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::fs;

    use base64::engine::general_purpose::STANDARD as BASE64;
    use base64::Engine;
    use fl0w_protocol::{routes, Envelope, FileContent};

    use super::*;
    use crate::files::{self, IgnoreSet};

    fn initiator() -> (tempfile::TempDir, Initiator) {
        let dir = tempfile::tempdir().unwrap();
        let folder = SyncFolder::open(dir.path(), IgnoreSet::default()).unwrap();
        (dir, Initiator::new(folder))
    }

    #[test]
    fn test_start_lists_every_file() {
        let (dir, mut initiator) = initiator();
        fs::write(dir.path().join("a.c"), b"a").unwrap();
        fs::create_dir_all(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.c"), b"b").unwrap();

        match initiator.start().unwrap() {
            SyncMessage::List(files) => {
                assert_eq!(files.len(), 2);
                assert_eq!(files["a.c"].hash, files::hash_bytes(b"a"));
                assert!(files.contains_key("sub/b.c"));
            }
            other => panic!("Expected List, got {other:?}"),
        }
    }

    #[test]
    fn test_local_changes_only_after_start() {
        let (dir, mut initiator) = initiator();
        let path = dir.path().canonicalize().unwrap().join("new.c");
        fs::write(&path, b"new").unwrap();

        assert_eq!(initiator.local_change(&path), None);

        initiator.start().unwrap();
        fs::write(&path, b"newer").unwrap();
        match initiator.local_change(&path) {
            Some(SyncMessage::Add(files)) => {
                assert_eq!(BASE64.decode(&files["new.c"].content).unwrap(), b"newer");
            }
            other => panic!("Expected Add, got {other:?}"),
        }

        fs::remove_file(&path).unwrap();
        assert_eq!(
            initiator.local_change(&path),
            Some(SyncMessage::Del(vec!["new.c".to_string()]))
        );
    }

    #[test]
    fn test_add_then_req_round_trips_content_and_mtime() {
        let (_dir, mut initiator) = initiator();
        let original: Vec<u8> = (0u8..=255).collect();
        let mut entries = BTreeMap::new();
        entries.insert(
            "bin/blob".to_string(),
            FileContent {
                content: BASE64.encode(&original),
                mtime: 1_600_000_000.5,
            },
        );

        assert!(initiator.handle(SyncMessage::Add(entries.clone())).is_empty());

        let replies = initiator.handle(SyncMessage::Req(vec!["bin/blob".to_string()]));
        assert_eq!(replies, vec![SyncMessage::Add(entries)]);
    }

    #[test]
    fn test_req_for_missing_file_is_skipped() {
        let (_dir, mut initiator) = initiator();
        let replies = initiator.handle(SyncMessage::Req(vec!["nope.c".to_string()]));
        assert!(replies.is_empty());
    }

    #[test]
    fn test_failed_apply_reports_err() {
        let (_dir, mut initiator) = initiator();
        let replies = initiator.handle(SyncMessage::Del(vec!["../escape".to_string()]));
        assert!(matches!(replies.as_slice(), [SyncMessage::Err(map)] if map.contains_key("../escape")));
    }

    #[test]
    fn test_req_answers_each_file_on_its_own_line() {
        let (dir, mut initiator) = initiator();
        fs::write(dir.path().join("a.bin"), vec![b'a'; 500_000]).unwrap();
        fs::write(dir.path().join("b.bin"), vec![b'b'; 500_000]).unwrap();

        let replies =
            initiator.handle(SyncMessage::Req(vec!["a.bin".to_string(), "b.bin".to_string()]));

        assert_eq!(replies.len(), 2);
        for reply in replies {
            assert!(matches!(&reply, SyncMessage::Add(files) if files.len() == 1));
            let line = Envelope::send(routes::SYNC, reply.to_value()).encode().unwrap();
            let decoded = Envelope::decode(&line).unwrap();
            assert!(matches!(
                SyncMessage::parse(&decoded.data),
                Some(SyncMessage::Add(files)) if files.len() == 1
            ));
        }
    }

    #[test]
    fn test_req_reports_file_too_large_for_one_line() {
        let (dir, mut initiator) = initiator();
        fs::write(dir.path().join("huge.bin"), vec![0u8; 800_000]).unwrap();
        fs::write(dir.path().join("small.c"), b"int x;").unwrap();

        let replies =
            initiator.handle(SyncMessage::Req(vec!["huge.bin".to_string(), "small.c".to_string()]));

        match replies.as_slice() {
            [SyncMessage::Add(files), SyncMessage::Err(failures)] => {
                assert!(files.contains_key("small.c"));
                assert!(failures["huge.bin"].contains("too large"));
            }
            other => panic!("Expected Add then Err, got {other:?}"),
        }
    }
}

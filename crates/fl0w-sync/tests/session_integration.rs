//! Sync sessions driven by the real filesystem watcher.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use fl0w_protocol::{FileContent, SyncMessage};
use fl0w_sync::{FolderWatcher, IgnoreSet, Initiator, Responder, SyncFolder};
use tokio::sync::mpsc::UnboundedReceiver;

/// Collects every path the watcher reports within `window`.
async fn drain(rx: &mut UnboundedReceiver<PathBuf>, window: Duration) -> Vec<PathBuf> {
    let mut paths = Vec::new();
    let deadline = tokio::time::Instant::now() + window;
    while let Ok(Some(path)) = tokio::time::timeout_at(deadline, rx.recv()).await {
        paths.push(path);
    }
    paths
}

#[tokio::test]
async fn test_inbound_add_and_del_produce_no_outward_messages() {
    let dir = tempfile::tempdir().unwrap();
    let folder = SyncFolder::open(dir.path(), IgnoreSet::default()).unwrap();
    let root = folder.root().to_path_buf();
    let (_watcher, mut rx) = FolderWatcher::spawn(&root).unwrap();
    let mut initiator = Initiator::new(folder);
    initiator.start().unwrap();

    let mut entries = BTreeMap::new();
    entries.insert(
        "prog/main.c".to_string(),
        FileContent {
            content: "aW50IG1haW4oKSB7fQ==".to_string(),
            mtime: 1_600_000_000.5,
        },
    );
    assert!(initiator.handle(SyncMessage::Add(entries)).is_empty());

    for path in drain(&mut rx, Duration::from_millis(600)).await {
        assert_eq!(initiator.local_change(&path), None, "echo for {path:?}");
    }

    assert!(initiator
        .handle(SyncMessage::Del(vec!["prog/main.c".to_string()]))
        .is_empty());

    for path in drain(&mut rx, Duration::from_millis(600)).await {
        assert_eq!(initiator.local_change(&path), None, "echo for {path:?}");
    }
}

#[tokio::test]
async fn test_external_edit_reaches_peer() {
    let dir = tempfile::tempdir().unwrap();
    let folder = SyncFolder::open(dir.path(), IgnoreSet::default()).unwrap();
    let root = folder.root().to_path_buf();
    let (_watcher, mut rx) = FolderWatcher::spawn(&root).unwrap();
    let mut responder = Responder::new(folder);

    fs::write(root.join("edited.c"), b"by hand").unwrap();

    let mut outward = Vec::new();
    for path in drain(&mut rx, Duration::from_millis(600)).await {
        outward.extend(responder.local_change(&path));
    }

    assert!(outward.iter().any(|msg| matches!(
        msg,
        SyncMessage::Add(files) if files.contains_key("edited.c")
    )));
}

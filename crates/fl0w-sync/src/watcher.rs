//! Debounced filesystem watcher feeding a tokio channel.
//!
//! ```text
//! ┌──────────┐     ┌───────────┐     ┌─────────────────┐
//! │  notify  │────>│ debouncer │────>│ mpsc<PathBuf>   │──> sync session
//! └──────────┘     └───────────┘     └─────────────────┘
//! ```
//!
//! One self-caused write produces one debounced event per path, which is
//! what the suppression markers in [`crate::SyncFolder`] rely on.

use std::path::{Path, PathBuf};
use std::time::Duration;

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use notify_debouncer_mini::{new_debouncer, DebounceEventResult, Debouncer};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::SyncError;

/// Debounce window for filesystem events.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

/// Keeps the underlying watcher alive; dropping it stops event delivery.
pub struct FolderWatcher {
    _debouncer: Debouncer<RecommendedWatcher>,
    root: PathBuf,
}

impl std::fmt::Debug for FolderWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderWatcher")
            .field("root", &self.root)
            .finish()
    }
}

impl FolderWatcher {
    /// Watches `root` recursively. Changed paths arrive on the returned receiver.
    pub fn spawn(root: &Path) -> Result<(Self, mpsc::UnboundedReceiver<PathBuf>), SyncError> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut debouncer = new_debouncer(DEBOUNCE, move |result: DebounceEventResult| {
            match result {
                Ok(events) => {
                    for event in events {
                        // Receiver gone means the session ended.
                        if tx.send(event.path).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Filesystem watcher error"),
            }
        })
        .map_err(|e| SyncError::Watcher {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;

        debouncer
            .watcher()
            .watch(root, RecursiveMode::Recursive)
            .map_err(|e| SyncError::Watcher {
                path: root.to_path_buf(),
                reason: e.to_string(),
            })?;

        debug!(root = %root.display(), "Watching folder");
        Ok((
            Self {
                _debouncer: debouncer,
                root: root.to_path_buf(),
            },
            rx,
        ))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

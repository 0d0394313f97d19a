//! Bidirectional directory synchronization for fl0w.
//!
//! Two roles share the `list`/`add`/`del`/`req` vocabulary:
//!
//! - [`Initiator`] owns the canonical tree (the editor) and opens a session
//!   by sending its listing.
//! - [`Responder`] serves many editors (the controller) and reconciles
//!   listings against its last stop time.
//!
//! Both roles are synchronous state machines; callers serialize inbound
//! messages and watcher events for one session behind a single lock.

pub mod error;
pub mod files;
pub mod folder;
pub mod initiator;
pub mod responder;
pub mod suppress;
pub mod watcher;

pub use error::{FileError, SyncError};
pub use files::{hash_bytes, now_secs, FileRecord, IgnoreSet, KnownFiles};
pub use folder::{LocalChange, SyncFolder};
pub use initiator::Initiator;
pub use responder::Responder;
pub use suppress::SuppressionSet;
pub use watcher::FolderWatcher;

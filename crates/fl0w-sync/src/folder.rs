//! A watched session folder: known files, suppression and local I/O.
//!
//! Shared by both sync roles. Every write or delete performed on behalf of a
//! peer is bracketed by a suppression marker so the watcher event it causes
//! never turns into an outward message.
//!
//! # Panic-Free Guarantees
//!
//! Per-file failures are collected as [`FileError`]s and never abort the
//! surrounding operation.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use fl0w_protocol::{FileContent, ListedFile, SyncMessage, MAX_MESSAGE_SIZE};
use tracing::{debug, warn};

use crate::error::{FileError, SyncError};
use crate::files::{self, FileRecord, IgnoreSet, KnownFiles};
use crate::suppress::SuppressionSet;

/// Room left on a line for the envelope around a `sync` payload.
const ENVELOPE_HEADROOM: usize = 512;

/// Largest encoded single-file `add` payload that still fits on one line.
pub const MAX_ADD_PAYLOAD: usize = MAX_MESSAGE_SIZE - ENVELOPE_HEADROOM;

/// Local change that should leave this endpoint.
#[derive(Debug, Clone, PartialEq)]
pub enum LocalChange {
    /// File created or modified
    Changed(String),
    /// File (or every known file below a directory) removed
    Removed(Vec<String>),
}

#[derive(Debug)]
pub struct SyncFolder {
    root: PathBuf,
    ignore: IgnoreSet,
    known: KnownFiles,
    suppressed: SuppressionSet,
}

impl SyncFolder {
    /// Opens `root`, creating it if missing.
    pub fn open(root: impl AsRef<Path>, ignore: IgnoreSet) -> Result<Self, SyncError> {
        let root = root.as_ref();
        fs::create_dir_all(root).map_err(|e| SyncError::io(root, e))?;
        let root = root.canonicalize().map_err(|e| SyncError::io(root, e))?;

        Ok(Self {
            root,
            ignore,
            known: KnownFiles::new(),
            suppressed: SuppressionSet::new(),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn known(&self) -> &KnownFiles {
        &self.known
    }

    pub fn suppressed(&self) -> &SuppressionSet {
        &self.suppressed
    }

    /// Rescans the tree and returns it as a `list` payload.
    pub fn listing(&mut self) -> Result<BTreeMap<String, ListedFile>, SyncError> {
        self.known = files::scan(&self.root, &self.ignore)?;
        Ok(self
            .known
            .values()
            .map(|record| {
                (
                    record.path.clone(),
                    ListedFile {
                        mtime: record.mtime,
                        hash: record.hash.clone(),
                    },
                )
            })
            .collect())
    }

    /// Current record for `rel`, read from disk. `None` if the file is absent.
    pub fn local_record(&self, rel: &str) -> Option<FileRecord> {
        let full = files::resolve_relative(&self.root, rel).ok()?;
        if !full.is_file() {
            return None;
        }
        files::record_for(&self.root, rel).ok()
    }

    /// Writes every file of an `add`, setting its mtime.
    pub fn apply_add(&mut self, entries: &BTreeMap<String, FileContent>) -> Vec<FileError> {
        let mut errors = Vec::new();
        for (rel, entry) in entries {
            if let Err(e) = self.write_one(rel, entry) {
                warn!(path = %rel, error = %e.reason, "Failed to apply add");
                errors.push(e);
            }
        }
        errors
    }

    fn write_one(&mut self, rel: &str, entry: &FileContent) -> Result<(), FileError> {
        if self.ignore.is_ignored(rel) {
            return Err(FileError::new(rel, "path is ignored"));
        }
        let full = files::resolve_relative(&self.root, rel).map_err(|r| FileError::new(rel, r))?;
        let bytes = BASE64
            .decode(entry.content.as_bytes())
            .map_err(|e| FileError::new(rel, format!("invalid base64: {e}")))?;
        if files::secs_to_system_time(entry.mtime).is_none() {
            return Err(FileError::new(rel, format!("invalid mtime {}", entry.mtime)));
        }

        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).map_err(|e| FileError::new(rel, e))?;
        }

        self.suppressed.insert(rel);
        let written = fs::write(&full, &bytes).and_then(|()| files::set_mtime(&full, entry.mtime));
        if let Err(e) = written {
            self.suppressed.cancel(rel);
            return Err(FileError::new(rel, e));
        }

        self.known.insert(
            rel.to_string(),
            FileRecord {
                path: rel.to_string(),
                hash: files::hash_bytes(&bytes),
                mtime: entry.mtime,
            },
        );
        debug!(path = %rel, bytes = bytes.len(), "Wrote synced file");
        Ok(())
    }

    /// Deletes every path of a `del`. Paths already absent are not errors.
    pub fn apply_del(&mut self, paths: &[String]) -> Vec<FileError> {
        let mut errors = Vec::new();
        for rel in paths {
            if let Err(e) = self.delete_one(rel) {
                warn!(path = %rel, error = %e.reason, "Failed to apply del");
                errors.push(e);
            }
        }
        errors
    }

    fn delete_one(&mut self, rel: &str) -> Result<(), FileError> {
        let full = files::resolve_relative(&self.root, rel).map_err(|r| FileError::new(rel, r))?;
        self.known.remove(rel);
        if !full.exists() {
            return Ok(());
        }

        self.suppressed.insert(rel);
        if let Err(e) = fs::remove_file(&full) {
            self.suppressed.cancel(rel);
            return Err(FileError::new(rel, e));
        }
        debug!(path = %rel, "Deleted synced file");
        Ok(())
    }

    /// Builds one `add` per requested path still present locally.
    ///
    /// Missing files are skipped. Unreadable files and files whose `add`
    /// would not fit on one line are reported instead.
    pub fn add_messages(&self, paths: &[String]) -> (Vec<SyncMessage>, Vec<FileError>) {
        let mut messages = Vec::new();
        let mut errors = Vec::new();

        for rel in paths {
            let full = match files::resolve_relative(&self.root, rel) {
                Ok(full) => full,
                Err(reason) => {
                    errors.push(FileError::new(rel.as_str(), reason));
                    continue;
                }
            };
            if !full.is_file() {
                continue;
            }
            let content = match self.read_content(&full) {
                Ok(content) => content,
                Err(e) => {
                    errors.push(FileError::new(rel.as_str(), e));
                    continue;
                }
            };

            let message = SyncMessage::Add(BTreeMap::from([(rel.clone(), content)]));
            let size = payload_size(&message);
            if size > MAX_ADD_PAYLOAD {
                warn!(path = %rel, size, max = MAX_ADD_PAYLOAD, "File too large to sync");
                errors.push(FileError::new(
                    rel.as_str(),
                    format!("file too large to sync ({size} bytes encoded, max {MAX_ADD_PAYLOAD})"),
                ));
                continue;
            }
            messages.push(message);
        }

        (messages, errors)
    }

    fn read_content(&self, full: &Path) -> Result<FileContent, SyncError> {
        let bytes = fs::read(full).map_err(|e| SyncError::io(full, e))?;
        Ok(FileContent {
            content: BASE64.encode(bytes),
            mtime: files::mtime_of(full)?,
        })
    }

    /// Classifies a watcher event for an absolute path.
    ///
    /// Returns `None` for ignored paths, suppressed (self-caused) events,
    /// directories and files whose content and mtime are unchanged.
    pub fn local_event(&mut self, path: &Path) -> Option<LocalChange> {
        let rel = files::to_relative(&self.root, path)?;
        if self.ignore.is_ignored(&rel) {
            return None;
        }
        if self.suppressed.take(&rel) {
            debug!(path = %rel, "Suppressed self-caused event");
            return None;
        }

        if path.is_dir() {
            return None;
        }

        if path.is_file() {
            let record = match files::record_for(&self.root, &rel) {
                Ok(record) => record,
                Err(e) => {
                    warn!(path = %rel, error = %e, "Failed to read changed file");
                    return None;
                }
            };
            if self.known.get(&rel) == Some(&record) {
                return None;
            }
            self.known.insert(rel.clone(), record);
            return Some(LocalChange::Changed(rel));
        }

        // Gone: either one file or a whole directory of known files.
        let prefix = format!("{rel}/");
        let removed: Vec<String> = self
            .known
            .keys()
            .filter(|k| **k == rel || k.starts_with(&prefix))
            .cloned()
            .collect();
        if removed.is_empty() {
            return None;
        }
        for k in &removed {
            self.known.remove(k);
        }
        Some(LocalChange::Removed(removed))
    }

    /// Converts a local change into the outward message.
    pub fn message_for(&self, change: LocalChange) -> Option<SyncMessage> {
        match change {
            LocalChange::Changed(rel) => {
                let (messages, errors) = self.add_messages(std::slice::from_ref(&rel));
                for e in errors {
                    warn!(path = %e.path, error = %e.reason, "Failed to send local change");
                }
                messages.into_iter().next()
            }
            LocalChange::Removed(paths) => Some(SyncMessage::Del(paths)),
        }
    }
}

fn payload_size(message: &SyncMessage) -> usize {
    serde_json::to_string(&message.to_value()).map_or(usize::MAX, |line| line.len())
}

/// Folds per-file failures into an `err` message, if any.
pub fn error_report(errors: Vec<FileError>) -> Option<SyncMessage> {
    if errors.is_empty() {
        return None;
    }
    Some(SyncMessage::Err(
        errors.into_iter().map(|e| (e.path, e.reason)).collect(),
    ))
}

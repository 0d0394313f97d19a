//! File listing, hashing and timestamps.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use walkdir::WalkDir;

use crate::error::SyncError;

/// Names skipped by default (matched against every path component).
pub const DEFAULT_IGNORE: [&str; 2] = [".DS_Store", ".git"];

/// Number of digest bytes kept (128 bits).
const HASH_BYTES: usize = 16;

/// Metadata of one synced file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileRecord {
    /// Forward-slash relative path
    pub path: String,
    /// 128-bit content digest, lowercase hex
    pub hash: String,
    /// Seconds since epoch, fractional
    pub mtime: f64,
}

/// Known File Set: relative path to record.
pub type KnownFiles = BTreeMap<String, FileRecord>;

/// Set of file and directory names excluded from syncing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IgnoreSet {
    names: Vec<String>,
}

impl IgnoreSet {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            names: names.into_iter().map(Into::into).collect(),
        }
    }

    /// Returns true if any component of the relative path is ignored.
    pub fn is_ignored(&self, rel: &str) -> bool {
        rel.split('/').any(|part| self.names.iter().any(|n| n == part))
    }

    fn is_ignored_name(&self, name: &str) -> bool {
        self.names.iter().any(|n| n == name)
    }
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::new(DEFAULT_IGNORE)
    }
}

/// Digest of a byte slice: first 128 bits of SHA-256 as hex.
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    hex::encode(digest.get(..HASH_BYTES).unwrap_or(&digest[..]))
}

/// Digest of a file's content.
pub fn hash_file(path: &Path) -> Result<String, SyncError> {
    let bytes = fs::read(path).map_err(|e| SyncError::io(path, e))?;
    Ok(hash_bytes(&bytes))
}

/// Modification time in fractional seconds since epoch.
pub fn mtime_of(path: &Path) -> Result<f64, SyncError> {
    let modified = fs::metadata(path)
        .and_then(|m| m.modified())
        .map_err(|e| SyncError::io(path, e))?;
    Ok(system_time_to_secs(modified))
}

/// Sets a file's modification time.
pub fn set_mtime(path: &Path, mtime: f64) -> std::io::Result<()> {
    let time = secs_to_system_time(mtime).ok_or_else(|| {
        std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("invalid mtime {mtime}"))
    })?;
    let file = fs::File::options().write(true).open(path)?;
    file.set_modified(time)
}

pub fn system_time_to_secs(time: SystemTime) -> f64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs_f64(),
        Err(e) => -e.duration().as_secs_f64(),
    }
}

/// Converts wire seconds to a `SystemTime`; negative or non-finite values are rejected.
pub fn secs_to_system_time(secs: f64) -> Option<SystemTime> {
    Duration::try_from_secs_f64(secs)
        .ok()
        .and_then(|d| UNIX_EPOCH.checked_add(d))
}

/// Current time in fractional seconds since epoch.
pub fn now_secs() -> f64 {
    let now = chrono::Utc::now();
    now.timestamp_micros() as f64 / 1_000_000.0
}

/// Builds a record for a file on disk.
pub fn record_for(root: &Path, rel: &str) -> Result<FileRecord, SyncError> {
    let full = root.join(rel);
    Ok(FileRecord {
        path: rel.to_string(),
        hash: hash_file(&full)?,
        mtime: mtime_of(&full)?,
    })
}

/// Recursively lists files under `root` as forward-slash relative paths.
pub fn list_relative(root: &Path, ignore: &IgnoreSet) -> Result<Vec<String>, SyncError> {
    let mut files = Vec::new();

    let walker = WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .filter_entry(|entry| {
            !entry
                .file_name()
                .to_str()
                .is_some_and(|name| ignore.is_ignored_name(name))
        });

    for entry in walker {
        let entry = entry.map_err(|e| SyncError::Walk {
            path: root.to_path_buf(),
            reason: e.to_string(),
        })?;
        if !entry.file_type().is_file() {
            continue;
        }
        if let Some(rel) = to_relative(root, entry.path()) {
            files.push(rel);
        }
    }

    files.sort();
    Ok(files)
}

/// Scans `root` into a Known File Set.
pub fn scan(root: &Path, ignore: &IgnoreSet) -> Result<KnownFiles, SyncError> {
    let mut known = KnownFiles::new();
    for rel in list_relative(root, ignore)? {
        let record = record_for(root, &rel)?;
        known.insert(rel, record);
    }
    Ok(known)
}

/// Converts an absolute path under `root` into a forward-slash relative path.
pub fn to_relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_str()?.to_string()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Validates a wire path and resolves it under `root`.
///
/// Rejects absolute paths, `..`, empty components and backslashes so that no
/// message can reach outside the session folder.
pub fn resolve_relative(root: &Path, rel: &str) -> Result<PathBuf, String> {
    if rel.is_empty() {
        return Err("empty path".to_string());
    }
    if rel.starts_with('/') || rel.contains('\\') {
        return Err("path must be relative and forward-slash separated".to_string());
    }

    let mut full = root.to_path_buf();
    for part in rel.split('/') {
        if part.is_empty() || part == "." || part == ".." {
            return Err(format!("invalid path component '{part}'"));
        }
        full.push(part);
    }
    Ok(full)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_128_bit_hex() {
        let hash = hash_bytes(b"hello");
        assert_eq!(hash.len(), 32);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(hash, hash_bytes(b"hello"));
        assert_ne!(hash, hash_bytes(b"hello!"));
    }

    #[test]
    fn test_list_relative_skips_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("src/lib")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::write(root.join("main.c"), "int main() {}").unwrap();
        fs::write(root.join("src/lib/util.c"), "").unwrap();
        fs::write(root.join(".git/HEAD"), "ref").unwrap();
        fs::write(root.join("src/.DS_Store"), "").unwrap();

        let files = list_relative(root, &IgnoreSet::default()).unwrap();
        assert_eq!(files, vec!["main.c".to_string(), "src/lib/util.c".to_string()]);
    }

    #[test]
    fn test_ignore_set_matches_components() {
        let ignore = IgnoreSet::default();
        assert!(ignore.is_ignored(".git/config"));
        assert!(ignore.is_ignored("a/b/.DS_Store"));
        assert!(!ignore.is_ignored("a/git/config"));
    }

    #[test]
    fn test_resolve_relative_rejects_escapes() {
        let root = Path::new("/srv/sync");
        assert_eq!(
            resolve_relative(root, "a/b.c").unwrap(),
            PathBuf::from("/srv/sync/a/b.c")
        );
        assert!(resolve_relative(root, "../etc/passwd").is_err());
        assert!(resolve_relative(root, "/etc/passwd").is_err());
        assert!(resolve_relative(root, "a//b").is_err());
        assert!(resolve_relative(root, "a\\b").is_err());
        assert!(resolve_relative(root, "").is_err());
    }

    #[test]
    fn test_to_relative() {
        let root = Path::new("/srv/sync");
        assert_eq!(
            to_relative(root, Path::new("/srv/sync/a/b.c")).as_deref(),
            Some("a/b.c")
        );
        assert_eq!(to_relative(root, Path::new("/srv/sync")), None);
        assert_eq!(to_relative(root, Path::new("/elsewhere/x")), None);
    }

    #[test]
    fn test_set_and_read_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, "x").unwrap();

        set_mtime(&path, 1_600_000_000.5).unwrap();
        assert_eq!(mtime_of(&path).unwrap(), 1_600_000_000.5);

        assert!(set_mtime(&path, -1.0).is_err());
        assert!(set_mtime(&path, f64::NAN).is_err());
    }
}

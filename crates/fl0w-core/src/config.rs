//! TOML configuration files for the relay and its agents.
//!
//! Every binary reads one file. A missing file is recovered by writing the
//! defaults and reading them back; every other failure is reported to the
//! caller, which treats it as fatal at startup.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ConfigError;

/// Default relay listen address.
pub const DEFAULT_SERVER_ADDRESS: &str = "127.0.0.1:3077";

/// Default sensor poll period in milliseconds.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 200;

/// Relay (`fl0wd`) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Address the relay listens on
    pub server_address: String,

    /// Verbose logging
    pub debug: bool,

    /// Root of compiled program trees
    pub binary_path: PathBuf,

    /// Root of synced source trees
    pub source_path: PathBuf,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            debug: true,
            binary_path: PathBuf::from("Binaries"),
            source_path: PathBuf::from("Source"),
        }
    }
}

impl RelayConfig {
    /// Creates the configured folders if they do not exist yet.
    pub fn ensure_folders(&self) -> Result<(), ConfigError> {
        ensure_folder(&self.binary_path)?;
        ensure_folder(&self.source_path)
    }
}

/// Controller agent (`fl0w-controller`) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Relay address to connect to
    pub server_address: String,

    /// Verbose logging
    pub debug: bool,

    /// Command used to disable output buffering of started programs
    pub output_unbuffer: String,

    /// Folder holding one sub-folder per runnable program
    pub programs_path: PathBuf,

    /// Sensor poll period
    pub poll_interval_ms: u64,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            debug: false,
            output_unbuffer: "stdbuf".to_string(),
            programs_path: PathBuf::from("programs"),
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

/// Editor agent (`fl0w-editor`) configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EditorConfig {
    /// Relay address to connect to
    pub server_address: String,

    /// Verbose logging
    pub debug: bool,

    /// Folder kept in sync with the controller
    pub folder: PathBuf,

    /// Name of the controller to sync with (first listed if unset)
    pub controller: Option<String>,
}

impl Default for EditorConfig {
    fn default() -> Self {
        Self {
            server_address: DEFAULT_SERVER_ADDRESS.to_string(),
            debug: false,
            folder: PathBuf::from("."),
            controller: None,
        }
    }
}

/// Reads a config file, writing and re-reading the defaults if it is missing.
pub fn load_or_init<T>(path: &Path) -> Result<T, ConfigError>
where
    T: Serialize + DeserializeOwned + Default,
{
    match read_config(path) {
        Ok(config) => Ok(config),
        Err(ConfigError::Io { source, .. }) if source.kind() == ErrorKind::NotFound => {
            info!(path = %path.display(), "Config file missing, writing defaults");
            write_config(path, &T::default())?;
            read_config(path)
        }
        Err(e) => Err(e),
    }
}

/// Reads and parses a config file.
pub fn read_config<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let config = toml::from_str(&content).map_err(|e| ConfigError::Invalid {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;

    debug!(path = %path.display(), "Config loaded");
    Ok(config)
}

/// Serializes a config and writes it to disk.
pub fn write_config<T: Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config).map_err(|e| ConfigError::Serialize(e.to_string()))?;

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        }
    }

    fs::write(path, content).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

/// Creates a folder if missing, failing if the path exists but is not a directory.
pub fn ensure_folder(path: &Path) -> Result<(), ConfigError> {
    if path.is_dir() {
        return Ok(());
    }
    if path.exists() {
        return Err(ConfigError::Folder {
            path: path.to_path_buf(),
            reason: "not a directory".to_string(),
        });
    }
    fs::create_dir_all(path).map_err(|e| ConfigError::Folder {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_writes_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fl0wd.toml");

        let config: RelayConfig = load_or_init(&path).unwrap();
        assert_eq!(config, RelayConfig::default());
        assert!(path.exists());

        // Second load reads the written file
        let again: RelayConfig = load_or_init(&path).unwrap();
        assert_eq!(again, config);
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("controller.toml");
        fs::write(&path, "poll_interval_ms = 50\n").unwrap();

        let config: ControllerConfig = load_or_init(&path).unwrap();
        assert_eq!(config.poll_interval_ms, 50);
        assert_eq!(config.output_unbuffer, "stdbuf");
        assert_eq!(config.server_address, DEFAULT_SERVER_ADDRESS);
    }

    #[test]
    fn test_invalid_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "debug = \"not a bool\"\n").unwrap();

        let result: Result<RelayConfig, _> = load_or_init(&path);
        assert!(matches!(result, Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn test_ensure_folder() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("a").join("b");
        ensure_folder(&nested).unwrap();
        assert!(nested.is_dir());

        let file = dir.path().join("file");
        fs::write(&file, "x").unwrap();
        assert!(matches!(ensure_folder(&file), Err(ConfigError::Folder { .. })));
    }
}

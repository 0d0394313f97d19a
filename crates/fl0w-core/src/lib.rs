//! fl0w Core - Shared types for the relay and its agents
//!
//! This crate provides the domain types shared between the relay (fl0wd),
//! the controller agent and the editor agent.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod error;
pub mod peer;
pub mod sensor;

// Re-exports for convenience
pub use config::{ControllerConfig, EditorConfig, RelayConfig};
pub use error::{ConfigError, DomainError, DomainResult};
pub use peer::{Channel, PeerId, PeerInfo, DEFAULT_PEER_NAME};
pub use sensor::{Port, SensorMode};

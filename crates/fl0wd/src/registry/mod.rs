//! Channel registry and presence broadcaster, as an actor.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────┐  RegistryCommand   ┌─────────────────┐   Envelope   ┌──────────────┐
//! │ ConnectionHandler │───────────────────▶│  RegistryActor  │─────────────▶│ peer outboxes│
//! │  (per peer)       │   (mpsc channel)   │ channels,       │  (try_send)  │ (per peer)   │
//! └───────────────────┘                    │ interests       │              └──────────────┘
//!                                          └─────────────────┘
//! ```
//!
//! Membership changes and disconnects trigger a roster push to every
//! observer with a non-empty Interest Set.

use tokio::sync::mpsc;

mod actor;
mod channels;
mod commands;
mod handle;
mod presence;

pub use actor::{RegistryActor, MAX_PEERS};
pub use channels::ChannelRegistry;
pub use commands::{Outbox, RegistryCommand, RegistryError};
pub use handle::RegistryHandle;
pub use presence::{roster_for, InterestTable};

/// Command channel buffer size
const COMMAND_BUFFER: usize = 100;

/// Spawns the registry actor and returns a handle to it.
///
/// # Example
///
/// ```no_run
/// use fl0wd::registry::spawn_registry;
///
/// #[tokio::main]
/// async fn main() {
///     let handle = spawn_registry();
///     let peers = handle.peer_count().await;
/// }
/// ```
pub fn spawn_registry() -> RegistryHandle {
    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    tokio::spawn(RegistryActor::new(cmd_rx).run());
    RegistryHandle::new(cmd_tx)
}

//! fl0w agents - relay peers for robot controllers and editors
//!
//! # Architecture
//!
//! Both agents plug into the same reconnecting [`RelayClient`]:
//!
//! 1. **Relay Client**: connects with backoff, runs a writer task per
//!    session and hands every inbound envelope to the agent
//! 2. **Controller Agent**: sensor subscriptions and polling, the process
//!    controller, host actions and the sync responder
//! 3. **Editor Agent**: the sync initiator for one local folder
//!
//! Session tasks (sensor poll loop, folder watches, program output) hold a
//! [`RelayLink`] and stop when the session's cancellation token fires.

pub mod client;
pub mod controller;
pub mod editor;
pub mod error;

pub use client::{ClientConfig, Flow, RelayAgent, RelayClient, RelayLink};
pub use controller::ControllerAgent;
pub use editor::EditorAgent;
pub use error::{AgentError, ProcessError, Result};

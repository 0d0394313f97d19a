//! TCP server for the relay.
//!
//! The server:
//! - Listens for peer connections
//! - Assigns each connection a `peer-<n>` id
//! - Spawns a `ConnectionHandler` and an outbox writer per peer
//! - Shuts down on `CancellationToken`
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   RelayServer   │
//! │   TcpListener   │
//! └───────┬─────────┘
//!         │ accept()
//!         ▼
//! ┌─────────────────┐     ┌─────────────────┐
//! │ConnectionHandler│────▶│  RegistryHandle │
//! │   (per peer)    │     │                 │
//! └─────────────────┘     └────────┬────────┘
//!                                  │ try_send
//!                                  ▼
//!                         ┌─────────────────┐
//!                         │  writer task    │
//!                         │  (per peer)     │
//!                         └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Accept errors are logged and the loop keeps accepting.

mod connection;

pub use connection::{run_writer, ConnectionError, ConnectionHandler, ErrorClass, OUTBOX_CAPACITY};

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use fl0w_core::{PeerId, PeerInfo};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::registry::RegistryHandle;

/// Fallback for `whoami` when the account name is unknown.
const UNKNOWN_USER: &str = "unknown";

pub struct RelayServer {
    listener: TcpListener,

    registry: RegistryHandle,

    cancel_token: CancellationToken,

    /// Source of peer ids; never reused within a process
    connection_counter: AtomicU64,

    user: String,
}

impl RelayServer {
    /// Binds the listening socket.
    pub async fn bind(
        address: &str,
        registry: RegistryHandle,
        cancel_token: CancellationToken,
    ) -> Result<Self, ServerError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|e| ServerError::Bind {
                address: address.to_string(),
                error: e.to_string(),
            })?;

        Ok(Self {
            listener,
            registry,
            cancel_token,
            connection_counter: AtomicU64::new(0),
            user: relay_user(),
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        self.listener.local_addr().map_err(|e| ServerError::Bind {
            address: "listener".to_string(),
            error: e.to_string(),
        })
    }

    /// Accepts connections until the cancellation token fires.
    pub async fn run(&self) -> Result<(), ServerError> {
        if let Ok(addr) = self.listener.local_addr() {
            info!(address = %addr, "Relay listening");
        }

        loop {
            tokio::select! {
                _ = self.cancel_token.cancelled() => {
                    info!("Server shutdown requested");
                    break;
                }

                result = self.listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let n = self.connection_counter.fetch_add(1, Ordering::Relaxed);
                            self.handle_connection(stream, addr, n);
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
        }

        info!("Server stopped");
        Ok(())
    }

    fn handle_connection(&self, stream: TcpStream, addr: SocketAddr, connection_number: u64) {
        let peer_id = PeerId::from_connection_number(connection_number);
        let info = PeerInfo::new(peer_id.clone(), addr.ip().to_string(), addr.port());
        debug!(peer_id = %peer_id, address = %addr, "Accepted connection");

        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer_id = %peer_id, error = %e, "Failed to set TCP_NODELAY");
        }

        let (reader, writer) = stream.into_split();
        let (outbox_tx, outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);

        tokio::spawn(run_writer(writer, outbox_rx, peer_id));

        let handler = ConnectionHandler::new(
            reader,
            outbox_tx,
            self.registry.clone(),
            info,
            self.user.clone(),
            self.cancel_token.clone(),
        );
        tokio::spawn(handler.run());
    }
}

/// Largest passwd buffer tried before giving up on the account lookup
const MAX_PASSWD_BUFFER: usize = 1 << 16;

/// Account name the relay runs as.
///
/// Resolved from the real uid; the `USER`/`LOGNAME` environment is only
/// consulted when the uid has no passwd entry.
pub fn relay_user() -> String {
    account_name()
        .or_else(|| {
            ["USER", "LOGNAME"]
                .iter()
                .find_map(|key| std::env::var(key).ok().filter(|v| !v.is_empty()))
        })
        .unwrap_or_else(|| UNKNOWN_USER.to_string())
}

#[cfg(unix)]
fn account_name() -> Option<String> {
    use std::ffi::CStr;

    // SAFETY: getuid(2) has no preconditions and cannot fail.
    let uid = unsafe { libc::getuid() };
    // SAFETY: passwd is a plain C struct; all-zero is a valid value.
    let mut entry: libc::passwd = unsafe { std::mem::zeroed() };
    let mut found: *mut libc::passwd = std::ptr::null_mut();
    let mut buffer: Vec<libc::c_char> = vec![0; 1024];

    loop {
        // SAFETY: every pointer refers to live storage owned by this frame and
        // the length passed matches `buffer`.
        let rc = unsafe {
            libc::getpwuid_r(uid, &mut entry, buffer.as_mut_ptr(), buffer.len(), &mut found)
        };
        if rc == libc::ERANGE && buffer.len() < MAX_PASSWD_BUFFER {
            buffer.resize(buffer.len() * 2, 0);
            continue;
        }
        if rc != 0 || found.is_null() || entry.pw_name.is_null() {
            return None;
        }
        break;
    }

    // SAFETY: on success pw_name points at a NUL-terminated string inside
    // `buffer`, which outlives this borrow.
    let name = unsafe { CStr::from_ptr(entry.pw_name) };
    name.to_str().ok().filter(|n| !n.is_empty()).map(str::to_string)
}

#[cfg(not(unix))]
fn account_name() -> Option<String> {
    None
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind {address}: {error}")]
    Bind { address: String, error: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

//! Relay connection client shared by the controller and editor agents.
//!
//! This module provides the `RelayClient` which handles:
//! - Connection to the relay over TCP
//! - Automatic reconnection with exponential backoff
//! - Dispatching inbound envelopes to a [`RelayAgent`]
//! - A per-session outbound queue drained by a writer task
//!
//! **Panic-Free Policy:** This module follows the project's panic-free guidelines.
//! No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, or `todo!()`.

use std::time::Duration;

use async_trait::async_trait;
use fl0w_core::{Channel, PeerId};
use fl0w_protocol::{Envelope, MAX_MESSAGE_SIZE};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{AgentError, Result};

/// Outbound queue depth per relay session.
pub const LINK_CAPACITY: usize = 256;

// ============================================================================
// Configuration
// ============================================================================

/// Connection behavior for a [`RelayClient`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Relay address, `host:port`.
    pub server_address: String,

    /// Initial delay before first retry after connection failure.
    pub retry_initial_delay: Duration,

    /// Maximum delay between retry attempts.
    pub retry_max_delay: Duration,

    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry).
    pub retry_multiplier: f64,
}

impl ClientConfig {
    pub fn new(server_address: impl Into<String>) -> Self {
        Self {
            server_address: server_address.into(),
            ..Self::default()
        }
    }

    /// Delay to wait after `delay`, capped at `retry_max_delay`.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        let next_ms = (delay.as_millis() as f64 * self.retry_multiplier) as u64;
        Duration::from_millis(next_ms).min(self.retry_max_delay)
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: fl0w_core::config::DEFAULT_SERVER_ADDRESS.to_string(),
            retry_initial_delay: Duration::from_secs(1),
            retry_max_delay: Duration::from_secs(30),
            retry_multiplier: 2.0,
        }
    }
}

// ============================================================================
// Relay Link
// ============================================================================

/// Sending half of one relay session.
///
/// Cloned freely into background tasks; every clone stops working once the
/// session it belongs to ends.
#[derive(Debug, Clone)]
pub struct RelayLink {
    outbox: mpsc::Sender<Envelope>,
}

impl RelayLink {
    pub fn new(outbox: mpsc::Sender<Envelope>) -> Self {
        Self { outbox }
    }

    /// Queues an envelope for the relay.
    pub async fn send(&self, envelope: Envelope) -> Result<()> {
        self.outbox
            .send(envelope)
            .await
            .map_err(|_| AgentError::LinkClosed)
    }

    /// Queues a message for the relay itself.
    pub async fn send_route(&self, route: &str, data: impl Into<Value>) -> Result<()> {
        self.send(Envelope::send(route, data)).await
    }

    /// Queues a message for one peer.
    pub async fn pipe(&self, route: &str, data: impl Into<Value>, to: PeerId) -> Result<()> {
        self.send(Envelope::pipe(route, data, to)).await
    }

    /// Queues a message for every other member of a channel.
    pub async fn broadcast(&self, route: &str, data: impl Into<Value>, channel: Channel) -> Result<()> {
        self.send(Envelope::broadcast(route, data, channel)).await
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

// ============================================================================
// Agent Trait
// ============================================================================

/// What the client does after an agent handled a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Close the session and do not reconnect
    Stop,
}

/// Behavior plugged into a [`RelayClient`].
#[async_trait]
pub trait RelayAgent: Send + Sync {
    /// Called once per established session before any message is read.
    async fn on_connect(&self, link: RelayLink) -> Result<()>;

    /// Called for every decoded inbound envelope.
    async fn on_message(&self, envelope: Envelope, link: &RelayLink) -> Flow;

    /// Called after the session ended, whatever the reason.
    async fn on_disconnect(&self);

    /// Called once the client has closed its last session for good.
    async fn on_stop(&self) {}
}

// ============================================================================
// Relay Client
// ============================================================================

/// Maintains a relay session for one agent, reconnecting until stopped.
///
/// # Connection Lifecycle
///
/// 1. Connects with exponential backoff
/// 2. Starts the writer task and calls [`RelayAgent::on_connect`]
/// 3. Reads envelopes until EOF, an I/O error, [`Flow::Stop`] or cancellation
/// 4. Calls [`RelayAgent::on_disconnect`]
/// 5. Reconnects unless the agent stopped or the token was cancelled, in
///    which case [`RelayAgent::on_stop`] runs last
pub struct RelayClient {
    config: ClientConfig,
    cancel_token: CancellationToken,
}

impl RelayClient {
    #[must_use]
    pub fn new(config: ClientConfig, cancel_token: CancellationToken) -> Self {
        Self {
            config,
            cancel_token,
        }
    }

    /// Runs sessions until the agent stops or the token is cancelled.
    pub async fn run<A: RelayAgent>(&self, agent: &A) -> Result<()> {
        info!(server_address = %self.config.server_address, "Relay client starting");

        loop {
            if self.cancel_token.is_cancelled() {
                info!("Relay client shutting down (cancelled)");
                agent.on_stop().await;
                return Ok(());
            }

            let stream = match self.connect_with_retry().await {
                Ok(stream) => stream,
                Err(AgentError::Cancelled) => {
                    info!("Relay client shutting down (cancelled)");
                    agent.on_stop().await;
                    return Ok(());
                }
                Err(e) => {
                    error!(error = %e, "Failed to connect to relay");
                    continue;
                }
            };

            info!(server_address = %self.config.server_address, "Connected to relay");
            let flow = self.run_session(stream, agent).await;
            agent.on_disconnect().await;

            match flow {
                Ok(Flow::Stop) => {
                    info!("Agent requested disconnect, not reconnecting");
                    agent.on_stop().await;
                    return Ok(());
                }
                Ok(Flow::Continue) => info!("Relay session ended"),
                Err(e) => warn!(error = %e, "Relay session ended with error"),
            }
        }
    }

    /// Attempts to connect with exponential backoff until success or cancellation.
    async fn connect_with_retry(&self) -> Result<TcpStream> {
        let mut delay = self.config.retry_initial_delay;
        let mut attempt = 0u32;

        loop {
            attempt = attempt.saturating_add(1);
            debug!(attempt, server_address = %self.config.server_address, "Connecting to relay");

            match TcpStream::connect(&self.config.server_address).await {
                Ok(stream) => {
                    debug!(attempt, "Connection successful");
                    return Ok(stream);
                }
                Err(e) => {
                    if attempt == 1 {
                        warn!(
                            server_address = %self.config.server_address,
                            error = %e,
                            "Relay unreachable, will retry"
                        );
                    } else {
                        debug!(attempt, error = %e, "Connection attempt failed");
                    }
                }
            }

            tokio::select! {
                _ = sleep(delay) => {
                    delay = self.config.next_delay(delay);
                }
                _ = self.cancel_token.cancelled() => {
                    return Err(AgentError::Cancelled);
                }
            }
        }
    }

    async fn run_session<A: RelayAgent>(&self, stream: TcpStream, agent: &A) -> Result<Flow> {
        if let Err(e) = stream.set_nodelay(true) {
            debug!(error = %e, "Failed to set TCP_NODELAY");
        }
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let session = self.cancel_token.child_token();
        let (outbox_tx, outbox_rx) = mpsc::channel(LINK_CAPACITY);
        let writer_task = tokio::spawn(run_writer(writer, outbox_rx, session.clone()));
        let link = RelayLink::new(outbox_tx);

        let result = async {
            agent.on_connect(link.clone()).await?;
            self.read_loop(&mut reader, &link, agent).await
        }
        .await;

        // Flush what the agent queued before the session ended.
        drop(link);
        session.cancel();
        let _ = writer_task.await;

        result
    }

    async fn read_loop<A: RelayAgent>(
        &self,
        reader: &mut BufReader<tokio::net::tcp::OwnedReadHalf>,
        link: &RelayLink,
        agent: &A,
    ) -> Result<Flow> {
        let mut line = String::new();

        loop {
            line.clear();
            let read = tokio::select! {
                _ = self.cancel_token.cancelled() => return Ok(Flow::Stop),
                read = reader.read_line(&mut line) => read,
            };

            match read {
                Ok(0) => {
                    info!("Relay closed connection");
                    return Ok(Flow::Continue);
                }
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::InvalidData => {
                    warn!(error = %e, "Dropping undecodable line");
                    continue;
                }
                Err(e) => return Err(AgentError::Io(e)),
            }

            if line.len() > MAX_MESSAGE_SIZE {
                warn!(size = line.len(), "Dropping oversized message");
                continue;
            }

            match Envelope::decode(&line) {
                Ok(envelope) => {
                    debug!(route = %envelope.route, from = ?envelope.from, "Received message");
                    if agent.on_message(envelope, link).await == Flow::Stop {
                        return Ok(Flow::Stop);
                    }
                }
                Err(e) => warn!(error = %e, "Ignoring malformed message"),
            }
        }
    }
}

/// Drains the session outbox onto the socket.
///
/// After the session token fires, whatever is already queued is still
/// written before the socket is closed.
async fn run_writer(writer: OwnedWriteHalf, mut outbox: mpsc::Receiver<Envelope>, session: CancellationToken) {
    let mut writer = BufWriter::new(writer);

    loop {
        let envelope = tokio::select! {
            biased;
            envelope = outbox.recv() => match envelope {
                Some(envelope) => envelope,
                None => break,
            },
            _ = session.cancelled() => match outbox.try_recv() {
                Ok(envelope) => envelope,
                Err(_) => break,
            },
        };

        if let Err(e) = write_envelope(&mut writer, &envelope).await {
            debug!(error = %e, "Write failed, closing writer");
            break;
        }
    }

    let _ = writer.shutdown().await;
}

async fn write_envelope(writer: &mut BufWriter<OwnedWriteHalf>, envelope: &Envelope) -> Result<()> {
    let line = envelope.encode()?;
    writer.write_all(line.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

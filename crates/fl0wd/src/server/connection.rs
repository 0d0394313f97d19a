//! Connection handler for one peer.
//!
//! Each accepted socket gets:
//! - a `ConnectionHandler` reading newline-delimited envelopes and
//!   dispatching them by route
//! - a writer task draining the peer's bounded outbox onto the socket
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Errors are classified; protocol errors are logged and the loop continues

use fl0w_core::{PeerId, PeerInfo};
use fl0w_protocol::{
    routes, Envelope, InfoReply, PeersRequest, ProtocolError, SubscribeRequest, WhoAmIReply,
};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::{Outbox, RegistryError, RegistryHandle};

/// Outbound queue depth per peer.
pub const OUTBOX_CAPACITY: usize = 256;

// ============================================================================
// Connection Handler
// ============================================================================

pub struct ConnectionHandler {
    reader: BufReader<OwnedReadHalf>,

    /// Sender half of this peer's own outbox (for direct replies)
    outbox: Outbox,

    registry: RegistryHandle,

    peer: PeerInfo,

    /// Account name reported by `whoami`
    user: String,

    cancel_token: CancellationToken,
}

impl ConnectionHandler {
    pub fn new(
        reader: OwnedReadHalf,
        outbox: Outbox,
        registry: RegistryHandle,
        peer: PeerInfo,
        user: String,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            reader: BufReader::new(reader),
            outbox,
            registry,
            peer,
            user,
            cancel_token,
        }
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.peer.id
    }

    /// Registers the peer, processes messages until it leaves, then tears down.
    pub async fn run(mut self) {
        let peer_id = self.peer.id.clone();

        if let Err(e) = self
            .registry
            .connect(self.peer.clone(), self.outbox.clone())
            .await
        {
            warn!(peer_id = %peer_id, error = %e, "Failed to register peer");
            return;
        }
        info!(
            peer_id = %peer_id,
            address = %self.peer.address,
            port = self.peer.port,
            "Peer connected"
        );

        match self.process_messages().await {
            Ok(()) => debug!(peer_id = %peer_id, "Peer closed connection"),
            Err(e) => debug!(peer_id = %peer_id, error = %e, class = ?e.class(), "Connection ended"),
        }

        if let Err(e) = self.registry.disconnect(peer_id.clone()).await {
            debug!(peer_id = %peer_id, error = %e, "Disconnect cleanup failed");
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        let cancel_token = self.cancel_token.clone();
        loop {
            let envelope = tokio::select! {
                _ = cancel_token.cancelled() => return Ok(()),
                result = self.read_envelope() => result,
            };

            let result = match envelope {
                Ok(envelope) => self.dispatch(envelope).await,
                Err(ConnectionError::Eof) => return Ok(()),
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                match e.class() {
                    ErrorClass::Protocol => {
                        debug!(peer_id = %self.peer.id, error = %e, "Ignoring malformed message");
                    }
                    ErrorClass::Transient | ErrorClass::Fatal => return Err(e),
                }
            }
        }
    }

    /// Routes one envelope: addressed pipes/broadcasts are forwarded, relay
    /// routes handled here, anything else ignored.
    async fn dispatch(&mut self, envelope: Envelope) -> Result<(), ConnectionError> {
        let from = self.peer.id.clone();

        if routes::is_pipe_route(&envelope.route) {
            if let Some(to) = envelope.to.clone() {
                return match self.registry.pipe(from, to, envelope).await {
                    Ok(()) | Err(RegistryError::PeerNotFound(_) | RegistryError::DeliveryFailed(_)) => {
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                };
            }
            if let Some(channel) = envelope.channel {
                self.registry.broadcast(from, channel, envelope).await?;
                return Ok(());
            }
        }

        match envelope.route.as_str() {
            routes::SUBSCRIBE => {
                if let Some(request) = SubscribeRequest::parse(&envelope.data) {
                    self.registry
                        .identify(from, request.channel, request.name)
                        .await?;
                }
            }
            routes::PEERS => {
                self.registry
                    .interest(from, PeersRequest::parse(&envelope.data))
                    .await?;
            }
            routes::INFO => {
                let reply = InfoReply {
                    routes: routes::RELAY_ROUTES
                        .iter()
                        .chain(routes::PIPE_ROUTES.iter())
                        .map(|r| r.to_string())
                        .collect(),
                };
                self.reply(routes::INFO, &reply)?;
            }
            routes::WHOAMI => {
                let reply = WhoAmIReply {
                    id: from,
                    user: self.user.clone(),
                };
                self.reply(routes::WHOAMI, &reply)?;
            }
            other => {
                debug!(peer_id = %self.peer.id, route = %other, "Ignoring unroutable message");
            }
        }

        Ok(())
    }

    fn reply<T: serde::Serialize>(&self, route: &str, payload: &T) -> Result<(), ConnectionError> {
        let data = serde_json::to_value(payload)
            .map_err(|e| ConnectionError::Protocol(ProtocolError::Serialize(e.to_string())))?;
        self.outbox
            .try_send(Envelope::send(route, data))
            .map_err(|_| ConnectionError::Io("outbox closed or full".to_string()))
    }

    async fn read_envelope(&mut self) -> Result<Envelope, ConnectionError> {
        let mut line = String::new();

        let bytes_read = self.reader.read_line(&mut line).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                ConnectionError::Protocol(ProtocolError::Parse(e.to_string()))
            } else {
                ConnectionError::Io(e.to_string())
            }
        })?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        let envelope = Envelope::decode(&line)?;
        debug!(peer_id = %self.peer.id, route = %envelope.route, "Received message");
        Ok(envelope)
    }
}

/// Drains a peer's outbox onto its socket until the queue closes or a write fails.
pub async fn run_writer(writer: OwnedWriteHalf, mut outbox: mpsc::Receiver<Envelope>, peer_id: PeerId) {
    let mut writer = BufWriter::new(writer);

    while let Some(envelope) = outbox.recv().await {
        let line = match envelope.encode() {
            Ok(line) => line,
            Err(e) => {
                warn!(peer_id = %peer_id, error = %e, "Failed to encode outbound message");
                continue;
            }
        };

        let written = async {
            writer.write_all(line.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;

        if let Err(e) = written {
            debug!(peer_id = %peer_id, error = %e, "Write failed, closing writer");
            break;
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// How the read loop reacts to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Socket-level failure: disconnect and clean up
    Transient,
    /// Bad input from the peer: log and keep reading
    Protocol,
    /// Relay internals gone: disconnect and clean up
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),
}

impl ConnectionError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Io(_) | Self::Eof => ErrorClass::Transient,
            Self::Protocol(_) => ErrorClass::Protocol,
            Self::Registry(_) => ErrorClass::Fatal,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert_eq!(ConnectionError::Eof.class(), ErrorClass::Transient);
        assert_eq!(
            ConnectionError::Io("reset".to_string()).class(),
            ErrorClass::Transient
        );
        assert_eq!(
            ConnectionError::from(ProtocolError::Parse("x".to_string())).class(),
            ErrorClass::Protocol
        );
        assert_eq!(
            ConnectionError::from(RegistryError::ChannelClosed).class(),
            ErrorClass::Fatal
        );
    }

    #[test]
    fn test_message_size_error_display() {
        let err = ConnectionError::from(ProtocolError::MessageTooLarge {
            size: 2_000_000,
            max: fl0w_protocol::MAX_MESSAGE_SIZE,
        });
        assert!(err.to_string().contains("2000000"));
    }
}

//! Transport abstraction: how a node accepts and dials connections and where
//! the decoded inbound units end up.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use hkdf::Hkdf;
use sha2::Sha256;
use thiserror::Error;
use tokio::io::AsyncReadExt;

use crate::peer::{Peer, PeerId};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("unknown frame tag {0:#04x}")]
    UnknownTag(u8),
    #[error("control message of {0} bytes exceeds the 4096 byte limit")]
    MessageTooLarge(usize),
    #[error("handshake failed: {0}")]
    Handshake(String),
    #[error("peer rejected: {0}")]
    Rejected(String),
    #[error("stream barrier not released within {0:?}")]
    StreamTimeout(Duration),
    #[error("connection closed")]
    Closed,
    #[error("network error: {0}")]
    Io(#[from] std::io::Error),
}

/// One decoded unit from a connection, handed to the single consumer.
///
/// `payload` is empty for stream units: the raw bytes stay on the connection
/// until the consumer reads them and releases the peer's stream barrier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundUnit {
    pub from: PeerId,
    pub is_stream: bool,
    pub payload: Vec<u8>,
}

/// Runs once per connection before anything else; an error drops the connection.
pub type HandshakeFn =
    Arc<dyn Fn(Arc<Peer>) -> BoxFuture<'static, Result<(), TransportError>> + Send + Sync>;

/// Runs after a successful handshake so the owner can register the peer
/// before any traffic is decoded. An error drops the connection.
pub type OnPeerFn = Arc<dyn Fn(Arc<Peer>) -> Result<(), TransportError> + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Bound address, once listening.
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Bind and start accepting in the background.
    async fn listen_and_accept(&self) -> Result<(), TransportError>;

    /// Open an outbound connection; it is then handled like an accepted one.
    async fn dial(&self, address: &str) -> Result<(), TransportError>;

    /// Next inbound unit from any connection. `None` once the transport is gone.
    async fn consume(&self) -> Option<InboundUnit>;

    /// Stop accepting and release the listener. Live connections keep running.
    async fn close(&self) -> Result<(), TransportError>;

    /// Close, then close every live connection and wait for its task to end.
    async fn shutdown(&self);
}

pub fn nop_handshake() -> HandshakeFn {
    Arc::new(|_peer: Arc<Peer>| -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async { Ok(()) })
    })
}

/// Derive a public fingerprint of an encryption key.
pub fn key_fingerprint(encryption_key: &[u8]) -> [u8; 32] {
    let hkdf = Hkdf::<Sha256>::new(None, encryption_key);
    let mut fingerprint = [0u8; 32];
    hkdf.expand(b"distfs-key-fingerprint", &mut fingerprint)
        .expect("32 bytes is a valid length for HKDF");
    fingerprint
}

/// Both sides send the fingerprint of their encryption key and drop the
/// connection on mismatch, so a node configured with the wrong cluster key
/// never joins. This is a configuration check, not authentication.
pub fn fingerprint_handshake(encryption_key: &[u8]) -> HandshakeFn {
    let fingerprint = key_fingerprint(encryption_key);

    Arc::new(move |peer: Arc<Peer>| -> BoxFuture<'static, Result<(), TransportError>> {
        Box::pin(async move {
            peer.send(&fingerprint).await?;

            let mut remote = [0u8; 32];
            peer.stream_reader().await.read_exact(&mut remote).await?;

            if remote != fingerprint {
                return Err(TransportError::Handshake(format!(
                    "encryption key fingerprint mismatch with {}",
                    peer.id()
                )));
            }
            Ok(())
        })
    })
}

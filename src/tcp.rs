//! TCP implementation of [`Transport`].
//!
//! Every accepted or dialed connection gets its own task which runs the
//! handshake, hands the peer to the owner through `on_peer`, then decodes
//! frames until the connection ends. Decoded units from all connections are
//! funnelled into one bounded queue read through [`Transport::consume`].

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex as SyncMutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::{JoinHandle, JoinSet};

use crate::frame::{self, Frame};
use crate::peer::{Peer, PeerId};
use crate::transport::{nop_handshake, HandshakeFn, InboundUnit, OnPeerFn, Transport, TransportError};
use crate::{INBOUND_CAPACITY, STREAM_TIMEOUT};

pub struct TcpTransportConfig {
    pub listen_addr: String,
    pub handshake: HandshakeFn,
    pub on_peer: Option<OnPeerFn>,
    /// Upper bound on the handshake and on every stream barrier wait.
    pub stream_timeout: Duration,
    pub inbound_capacity: usize,
}

impl TcpTransportConfig {
    pub fn new(listen_addr: impl Into<String>) -> Self {
        TcpTransportConfig {
            listen_addr: listen_addr.into(),
            handshake: nop_handshake(),
            on_peer: None,
            stream_timeout: STREAM_TIMEOUT,
            inbound_capacity: INBOUND_CAPACITY,
        }
    }
}

pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TcpTransportConfig,
    local_addr: SyncMutex<Option<SocketAddr>>,
    // taken on shutdown so the queue closes once every connection task is gone
    inbound_tx: SyncMutex<Option<mpsc::Sender<InboundUnit>>>,
    inbound_rx: Mutex<mpsc::Receiver<InboundUnit>>,
    acceptor: SyncMutex<Option<JoinHandle<()>>>,
    connections: SyncMutex<JoinSet<()>>,
    live: SyncMutex<HashMap<PeerId, Weak<Peer>>>,
}

impl TcpTransport {
    pub fn new(config: TcpTransportConfig) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.inbound_capacity.max(1));
        TcpTransport {
            inner: Arc::new(Inner {
                config,
                local_addr: SyncMutex::new(None),
                inbound_tx: SyncMutex::new(Some(inbound_tx)),
                inbound_rx: Mutex::new(inbound_rx),
                acceptor: SyncMutex::new(None),
                connections: SyncMutex::new(JoinSet::new()),
                live: SyncMutex::new(HashMap::new()),
            }),
        }
    }

    /// Number of connections whose task is still running.
    pub fn connection_count(&self) -> usize {
        self.inner.live.lock().len()
    }
}

impl Inner {
    fn spawn_connection(self: &Arc<Self>, stream: TcpStream, addr: SocketAddr, outbound: bool) {
        let Some(inbound) = self.inbound_tx.lock().clone() else {
            debug!("transport is shut down, dropping connection with {}", addr);
            return;
        };

        let inner = Arc::clone(self);
        let mut connections = self.connections.lock();
        // reap finished tasks so the set only tracks live connections
        while connections.try_join_next().is_some() {}
        connections.spawn(async move {
            inner.handle_connection(stream, addr, outbound, inbound).await;
        });
    }

    async fn handle_connection(
        self: Arc<Self>,
        stream: TcpStream,
        addr: SocketAddr,
        outbound: bool,
        inbound: mpsc::Sender<InboundUnit>,
    ) {
        if let Err(e) = stream.set_nodelay(true) {
            debug!("[{}] could not set TCP_NODELAY: {}", addr, e);
        }
        let (reader, writer) = stream.into_split();
        let peer = Arc::new(Peer::new(addr.to_string(), outbound, reader, writer));
        self.live.lock().insert(peer.id().to_string(), Arc::downgrade(&peer));

        match self.admit(&peer).await {
            Ok(()) => match read_loop(&peer, &inbound, self.config.stream_timeout).await {
                Ok(()) | Err(TransportError::Closed) => debug!("[{}] connection closed", peer.id()),
                Err(e) => warn!("[{}] dropping connection: {}", peer.id(), e),
            },
            Err(e) => warn!("[{}] connection rejected: {}", peer.id(), e),
        }

        if let Err(e) = peer.close().await {
            debug!("[{}] error while closing: {}", peer.id(), e);
        }
        self.live.lock().remove(peer.id());
    }

    async fn admit(&self, peer: &Arc<Peer>) -> Result<(), TransportError> {
        let handshake = (self.config.handshake)(Arc::clone(peer));
        tokio::time::timeout(self.config.stream_timeout, handshake)
            .await
            .map_err(|_| TransportError::Handshake("timed out".to_string()))??;

        if let Some(on_peer) = &self.config.on_peer {
            on_peer(Arc::clone(peer))?;
        }
        Ok(())
    }
}

async fn accept_loop(inner: Arc<Inner>, listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                debug!("accepted connection from {}", addr);
                inner.spawn_connection(stream, addr, false);
            }
            Err(e) => {
                error!("accept error: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Decode units from `peer` until the connection ends.
///
/// A stream tag arms the peer's barrier, publishes a stream unit and parks
/// the loop until the consumer calls [`Peer::release_pending_stream`], so the
/// raw bytes that follow are never read as frames. Returns `Ok(())` on a clean
/// end of input and an error for anything that should drop the connection.
pub async fn read_loop(
    peer: &Peer,
    inbound: &mpsc::Sender<InboundUnit>,
    stream_timeout: Duration,
) -> Result<(), TransportError> {
    loop {
        let frame = {
            let mut reader = peer.stream_reader().await;
            tokio::select! {
                frame = frame::read_frame(&mut *reader) => frame,
                _ = peer.closed() => return Err(TransportError::Closed),
            }
        };

        let frame = match frame {
            Ok(frame) => frame,
            Err(TransportError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        };

        match frame {
            Frame::Message(payload) => {
                let unit = InboundUnit { from: peer.id().to_string(), is_stream: false, payload };
                publish(peer, inbound, unit).await?;
            }
            Frame::Stream => {
                let barrier = peer.begin_stream();
                let unit = InboundUnit { from: peer.id().to_string(), is_stream: true, payload: Vec::new() };
                publish(peer, inbound, unit).await?;

                debug!("[{}] waiting for stream to be consumed", peer.id());
                match tokio::time::timeout(stream_timeout, barrier).await {
                    Ok(Ok(())) => debug!("[{}] stream released, resuming", peer.id()),
                    Ok(Err(_)) => return Err(TransportError::Closed),
                    Err(_) => return Err(TransportError::StreamTimeout(stream_timeout)),
                }
            }
        }
    }
}

async fn publish(
    peer: &Peer,
    inbound: &mpsc::Sender<InboundUnit>,
    unit: InboundUnit,
) -> Result<(), TransportError> {
    tokio::select! {
        sent = inbound.send(unit) => sent.map_err(|_| TransportError::Closed),
        _ = peer.closed() => Err(TransportError::Closed),
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    async fn listen_and_accept(&self) -> Result<(), TransportError> {
        let listener = TcpListener::bind(&self.inner.config.listen_addr).await?;
        let addr = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(addr);
        info!("listening on {}", addr);

        let handle = tokio::spawn(accept_loop(Arc::clone(&self.inner), listener));
        if let Some(previous) = self.inner.acceptor.lock().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn dial(&self, address: &str) -> Result<(), TransportError> {
        let stream = TcpStream::connect(address).await?;
        let addr = stream.peer_addr()?;
        debug!("dialed {}", addr);
        self.inner.spawn_connection(stream, addr, true);
        Ok(())
    }

    async fn consume(&self) -> Option<InboundUnit> {
        self.inner.inbound_rx.lock().await.recv().await
    }

    async fn close(&self) -> Result<(), TransportError> {
        if let Some(acceptor) = self.inner.acceptor.lock().take() {
            acceptor.abort();
            debug!("stopped accepting connections");
        }
        Ok(())
    }

    async fn shutdown(&self) {
        if let Err(e) = self.close().await {
            warn!("error closing listener: {}", e);
        }
        self.inner.inbound_tx.lock().take();

        let peers: Vec<Arc<Peer>> = self.inner.live.lock().values().filter_map(Weak::upgrade).collect();
        for peer in peers {
            if let Err(e) = peer.close().await {
                debug!("[{}] error while closing: {}", peer.id(), e);
            }
        }

        let mut connections = std::mem::take(&mut *self.inner.connections.lock());
        while let Some(joined) = connections.join_next().await {
            if let Err(e) = joined {
                warn!("connection task ended abnormally: {}", e);
            }
        }
        debug!("transport shut down");
    }
}

//! The file server ties a [`Store`], a [`Transport`] and a [`PeerRegistry`]
//! together.
//!
//! One control loop consumes every inbound unit and dispatches it. Anything
//! that moves bulk bytes (sending a file, receiving a replica) runs in its own
//! task so a slow peer never stalls the loop.
//!
//! Transfers follow announce, ack, stream:
//!
//! ```text
//! sender                                receiver
//!   StoreAnnouncement / GetResponse  ->   remember expected stream for peer
//!                                    <-   Ack { accepted }
//!   0x01 [len] ciphertext            ->   decrypt into store, release barrier
//! ```

use std::collections::hash_map::Entry;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rand::RngCore;
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinSet;

use crate::cipher::{self, new_encryption_key, CipherError};
use crate::message::ControlMessage;
use crate::peer::{Peer, PeerId};
use crate::registry::PeerRegistry;
use crate::store::{cas_path_transform, PathTransform, Store, StoreConfig, StoreError};
use crate::tcp::{TcpTransport, TcpTransportConfig};
use crate::transport::{fingerprint_handshake, InboundUnit, Transport, TransportError};
use crate::{ACK_TIMEOUT, DIAL_PACING, GET_TIMEOUT, IV_SIZE, STREAM_TIMEOUT};

#[derive(Error, Debug)]
pub enum ServerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Cipher(#[from] CipherError),
    #[error("codec error: {0}")]
    Codec(#[from] bincode::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("message from unknown peer {0}")]
    UnknownPeer(PeerId),
    #[error("peer {0} did not acknowledge within {1:?}")]
    AckTimeout(PeerId, Duration),
    #[error("peer {0} declined the transfer")]
    Declined(PeerId),
    #[error("stream length mismatch: expected {expected} bytes, got {actual}")]
    LengthMismatch { expected: u64, actual: u64 },
    #[error("key {0:?} not found on this node or any peer")]
    NotFound(String),
    #[error("fetching {key:?} failed: {reason}")]
    FetchFailed { key: String, reason: String },
    #[error(
        "replication failed for {} of {attempted} peers: {}",
        .failed.len(),
        describe_failures(.failed)
    )]
    PartialReplication { attempted: usize, failed: Vec<PeerFailure> },
}

/// One peer that did not receive a replica, and why.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerFailure {
    pub peer: PeerId,
    pub reason: String,
}

fn describe_failures(failed: &[PeerFailure]) -> String {
    failed
        .iter()
        .map(|f| format!("{} ({})", f.peer, f.reason))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Random 32-byte hex id, used as this node's namespace on disk.
pub fn new_node_id() -> String {
    let mut id = [0u8; 32];
    rand::rng().fill_bytes(&mut id);
    hex::encode(id)
}

pub struct FileServerConfig {
    pub node_id: String,
    /// Shared by every node of a cluster; replicas cannot be decrypted otherwise.
    pub encryption_key: Vec<u8>,
    pub storage_root: PathBuf,
    pub path_transform: Option<PathTransform>,
    /// Addresses dialed once at startup.
    pub seeds: Vec<String>,
    pub ack_timeout: Duration,
    pub get_timeout: Duration,
    pub dial_pacing: Duration,
    pub stream_timeout: Duration,
}

impl FileServerConfig {
    pub fn new(storage_root: impl Into<PathBuf>) -> Self {
        FileServerConfig {
            node_id: new_node_id(),
            encryption_key: new_encryption_key().to_vec(),
            storage_root: storage_root.into(),
            path_transform: Some(Arc::new(cas_path_transform)),
            seeds: Vec::new(),
            ack_timeout: ACK_TIMEOUT,
            get_timeout: GET_TIMEOUT,
            dial_pacing: DIAL_PACING,
            stream_timeout: STREAM_TIMEOUT,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StreamKind {
    /// Bare ciphertext following a StoreAnnouncement.
    Replica,
    /// u64 LE length, then ciphertext, following a GetResponse.
    Fetch,
}

#[derive(Debug, Clone)]
struct ExpectedStream {
    transfer: u64,
    namespace: String,
    key: String,
    size: u64,
    kind: StreamKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum FetchOutcome {
    /// A complete copy is now in this node's namespace.
    Fetched,
    /// Every peer answered NotFound, or none answered in time.
    Missing,
    /// A peer accepted but its stream did not arrive intact.
    Failed(String),
}

/// An outstanding Get broadcast for one key.
struct Fetch {
    waiting_on: HashSet<PeerId>,
    accepted_from: Option<PeerId>,
    waiters: Vec<oneshot::Sender<FetchOutcome>>,
}

pub struct FileServer {
    config: FileServerConfig,
    transport: Arc<dyn Transport>,
    registry: PeerRegistry,
    store: Arc<Store>,
    shutdown: watch::Sender<bool>,
    next_transfer: AtomicU64,
    acks: Mutex<HashMap<(PeerId, u64), oneshot::Sender<bool>>>,
    // at most one announced stream per peer, since senders serialise transfers
    expected: Mutex<HashMap<PeerId, ExpectedStream>>,
    fetches: Mutex<HashMap<String, Fetch>>,
    // replies and transfers spawned off the control loop, drained by `run`
    tasks: Mutex<JoinSet<()>>,
}

impl FileServer {
    /// `registry` must be the one the transport's `on_peer` hook feeds.
    pub fn new(
        config: FileServerConfig,
        transport: Arc<dyn Transport>,
        registry: PeerRegistry,
    ) -> Arc<Self> {
        let store = Store::new(StoreConfig {
            root: config.storage_root.clone(),
            path_transform: config.path_transform.clone(),
        });
        let (shutdown, _) = watch::channel(false);

        Arc::new(FileServer {
            config,
            transport,
            registry,
            store: Arc::new(store),
            shutdown,
            next_transfer: AtomicU64::new(1),
            acks: Mutex::new(HashMap::new()),
            expected: Mutex::new(HashMap::new()),
            fetches: Mutex::new(HashMap::new()),
            tasks: Mutex::new(JoinSet::new()),
        })
    }

    /// A server over TCP that checks key fingerprints on every connection
    /// and registers each admitted peer.
    pub fn over_tcp(listen_addr: &str, config: FileServerConfig) -> Arc<Self> {
        let registry = PeerRegistry::new();

        let mut transport_config = TcpTransportConfig::new(listen_addr);
        transport_config.handshake = fingerprint_handshake(&config.encryption_key);
        transport_config.on_peer = Some(registry.on_peer());
        transport_config.stream_timeout = config.stream_timeout;

        let transport: Arc<dyn Transport> = Arc::new(TcpTransport::new(transport_config));
        FileServer::new(config, transport, registry)
    }

    pub fn node_id(&self) -> &str {
        &self.config.node_id
    }

    pub fn storage(&self) -> &Store {
        &self.store
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn listen_addr(&self) -> Option<std::net::SocketAddr> {
        self.transport.local_addr()
    }

    pub fn peer_count(&self) -> usize {
        self.registry.len()
    }

    /// Listen, dial the seeds, then run the control loop until [`stop`].
    ///
    /// Only a failure to listen is returned; unreachable seeds are logged.
    ///
    /// [`stop`]: FileServer::stop
    pub async fn start(self: &Arc<Self>) -> Result<(), ServerError> {
        self.transport.listen_and_accept().await?;
        self.bootstrap().await;
        self.run().await;
        Ok(())
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn bootstrap(&self) {
        let seeds = self.config.seeds.iter().filter(|seed| !seed.is_empty());
        for (i, seed) in seeds.enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.dial_pacing).await;
            }
            debug!("attempting to connect with seed {}", seed);
            if let Err(e) = self.transport.dial(seed).await {
                error!("dial {} failed: {}", seed, e);
            }
        }
    }

    async fn run(self: &Arc<Self>) {
        let mut shutdown = self.shutdown.subscribe();
        info!("file server {} running", self.config.node_id);

        loop {
            if *shutdown.borrow_and_update() {
                break;
            }
            tokio::select! {
                unit = self.transport.consume() => match unit {
                    Some(unit) => {
                        if let Err(e) = self.handle_unit(unit).await {
                            warn!("{}", e);
                        }
                    }
                    None => {
                        debug!("inbound queue closed");
                        break;
                    }
                },
                _ = shutdown.changed() => {}
            }
        }

        info!("file server {} stopping", self.config.node_id);
        self.transport.shutdown().await;

        let mut tasks = std::mem::take(&mut *self.tasks.lock());
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("server task ended abnormally: {}", e);
            }
        }
        self.registry.clear();
    }

    fn spawn_task<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(task);
    }

    async fn handle_unit(self: &Arc<Self>, unit: InboundUnit) -> Result<(), ServerError> {
        let peer = self
            .registry
            .get(&unit.from)
            .ok_or_else(|| ServerError::UnknownPeer(unit.from.clone()))?;

        if unit.is_stream {
            self.accept_stream(peer).await;
            return Ok(());
        }

        let message = match ControlMessage::decode(&unit.payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("ignoring undecodable message from {}: {}", unit.from, e);
                return Ok(());
            }
        };
        debug!("received {} from {}", message.kind(), unit.from);

        match message {
            ControlMessage::StoreAnnouncement { transfer, namespace, key, size } => {
                self.expect_stream(
                    &peer,
                    ExpectedStream { transfer, namespace, key, size, kind: StreamKind::Replica },
                );
                self.reply(peer, ControlMessage::Ack { transfer, accepted: true });
            }
            ControlMessage::GetRequest { key } => self.serve_get(peer, key).await?,
            ControlMessage::GetResponse { transfer, key, size } => {
                let accepted = self.claim_fetch(&key, peer.id());
                if accepted {
                    let namespace = self.config.node_id.clone();
                    self.expect_stream(
                        &peer,
                        ExpectedStream { transfer, namespace, key, size, kind: StreamKind::Fetch },
                    );
                } else {
                    debug!("declining response for {:?} from {}", key, peer.id());
                }
                self.reply(peer, ControlMessage::Ack { transfer, accepted });
            }
            ControlMessage::NotFound { key } => self.fetch_miss(&key, peer.id()),
            ControlMessage::Ack { transfer, accepted } => {
                match self.acks.lock().remove(&(peer.id().to_string(), transfer)) {
                    Some(waiter) => {
                        let _ = waiter.send(accepted);
                    }
                    None => debug!("unexpected ack for transfer {} from {}", transfer, peer.id()),
                }
            }
        }
        Ok(())
    }

    fn expect_stream(&self, peer: &Peer, slot: ExpectedStream) {
        debug!(
            "expecting {} bytes for {:?} from {} (transfer {})",
            slot.size,
            slot.key,
            peer.id(),
            slot.transfer
        );
        if let Some(previous) = self.expected.lock().insert(peer.id().to_string(), slot) {
            warn!(
                "transfer {} from {} was announced but never streamed",
                previous.transfer,
                peer.id()
            );
        }
    }

    /// Send a message without holding up the control loop.
    fn reply(&self, peer: Arc<Peer>, message: ControlMessage) {
        self.spawn_task(async move {
            if let Err(e) = send_to(&peer, &message).await {
                warn!("failed to send {} to {}: {}", message.kind(), peer.id(), e);
            }
        });
    }

    async fn accept_stream(self: &Arc<Self>, peer: Arc<Peer>) {
        let slot = self.expected.lock().remove(peer.id());
        let Some(slot) = slot else {
            warn!("unannounced stream from {}, dropping connection", peer.id());
            if let Err(e) = peer.close().await {
                debug!("[{}] error while closing: {}", peer.id(), e);
            }
            return;
        };

        let server = Arc::clone(self);
        self.spawn_task(async move { server.receive_stream(peer, slot).await });
    }

    async fn receive_stream(self: Arc<Self>, peer: Arc<Peer>, slot: ExpectedStream) {
        let limit = self.config.stream_timeout;
        let result = match tokio::time::timeout(limit, self.read_stream(&peer, &slot)).await {
            Ok(result) => result,
            Err(_) => Err(TransportError::StreamTimeout(limit).into()),
        };
        match &result {
            Ok(written) => {
                info!(
                    "received and written {} bytes for {:?} from {} into {}",
                    written,
                    slot.key,
                    peer.id(),
                    slot.namespace
                );
                peer.release_pending_stream();
            }
            Err(e) => {
                error!("transfer {} from {} failed: {}", slot.transfer, peer.id(), e);
                if let Err(e) = peer.close().await {
                    debug!("[{}] error while closing: {}", peer.id(), e);
                }
            }
        }

        if slot.kind == StreamKind::Fetch {
            let outcome = match result {
                Ok(_) => FetchOutcome::Fetched,
                Err(e) => FetchOutcome::Failed(e.to_string()),
            };
            self.finish_fetch(&slot.key, outcome);
        }
    }

    async fn read_stream(&self, peer: &Peer, slot: &ExpectedStream) -> Result<u64, ServerError> {
        let mut reader = peer.stream_reader().await;

        if slot.kind == StreamKind::Fetch {
            let announced = reader.read_u64_le().await?;
            if announced != slot.size {
                return Err(ServerError::LengthMismatch { expected: slot.size, actual: announced });
            }
        }

        let written = self
            .store
            .write_decrypt_exact(
                &slot.namespace,
                &slot.key,
                &self.config.encryption_key,
                &mut *reader,
                slot.size,
            )
            .await?;
        Ok(written)
    }

    /// The namespace holding `key` on this node: our own first, then any replica.
    async fn find_local(&self, key: &str) -> Result<Option<String>, ServerError> {
        if self.store.present(&self.config.node_id, key).await {
            return Ok(Some(self.config.node_id.clone()));
        }
        Ok(self.store.locate(key).await?)
    }

    async fn serve_get(self: &Arc<Self>, peer: Arc<Peer>, key: String) -> Result<(), ServerError> {
        let Some(namespace) = self.find_local(&key).await? else {
            info!("need to serve {:?} to {} but it is not on disk", key, peer.id());
            self.reply(peer, ControlMessage::NotFound { key });
            return Ok(());
        };

        let server = Arc::clone(self);
        self.spawn_task(async move {
            if let Err(e) = server.send_file(&peer, &namespace, &key).await {
                error!("serving {:?} to {} failed: {}", key, peer.id(), e);
                if let Err(e) = peer.close().await {
                    debug!("[{}] error while closing: {}", peer.id(), e);
                }
            }
        });
        Ok(())
    }

    async fn send_file(&self, peer: &Peer, namespace: &str, key: &str) -> Result<(), ServerError> {
        let _transfer_lock = peer.lock_transfer().await;

        let (size, file) = self.store.read(namespace, key).await?;
        let wire_size = size + IV_SIZE as u64;
        let transfer = self.next_transfer.fetch_add(1, Ordering::Relaxed);

        let response = ControlMessage::GetResponse { transfer, key: key.to_string(), size: wire_size };
        match self.announce(peer, &response, transfer).await {
            Ok(()) => {}
            Err(ServerError::Declined(_)) => {
                debug!("{} no longer needs {:?}", peer.id(), key);
                return Ok(());
            }
            Err(e) => return Err(e),
        }

        let mut writer = peer.open_stream(Some(wire_size)).await?;
        let written = cipher::encrypt(&self.config.encryption_key, file, &mut *writer).await?;
        if written != wire_size {
            return Err(ServerError::LengthMismatch { expected: wire_size, actual: written });
        }

        info!("written {} bytes of {:?} over the network to {}", written, key, peer.id());
        Ok(())
    }

    /// Send a transfer header and wait until the peer accepts it.
    async fn announce(
        &self,
        peer: &Peer,
        header: &ControlMessage,
        transfer: u64,
    ) -> Result<(), ServerError> {
        let slot = (peer.id().to_string(), transfer);
        let (ack_tx, ack_rx) = oneshot::channel();
        self.acks.lock().insert(slot.clone(), ack_tx);

        if let Err(e) = send_to(peer, header).await {
            self.acks.lock().remove(&slot);
            return Err(e);
        }

        let ack = tokio::time::timeout(self.config.ack_timeout, ack_rx).await;
        self.acks.lock().remove(&slot);

        match ack {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ServerError::Declined(peer.id().to_string())),
            Ok(Err(_)) => Err(TransportError::Closed.into()),
            Err(_) => Err(ServerError::AckTimeout(peer.id().to_string(), self.config.ack_timeout)),
        }
    }

    /// Take the first response for an outstanding fetch; later ones are declined.
    fn claim_fetch(&self, key: &str, from: &str) -> bool {
        match self.fetches.lock().get_mut(key) {
            Some(fetch) if fetch.accepted_from.is_none() => {
                fetch.accepted_from = Some(from.to_string());
                true
            }
            _ => false,
        }
    }

    fn fetch_miss(&self, key: &str, from: &str) {
        let mut fetches = self.fetches.lock();
        let Some(fetch) = fetches.get_mut(key) else {
            return;
        };
        fetch.waiting_on.remove(from);
        if fetch.waiting_on.is_empty() && fetch.accepted_from.is_none() {
            if let Some(fetch) = fetches.remove(key) {
                notify_waiters(fetch, FetchOutcome::Missing);
            }
        }
    }

    fn finish_fetch(&self, key: &str, outcome: FetchOutcome) {
        if let Some(fetch) = self.fetches.lock().remove(key) {
            notify_waiters(fetch, outcome);
        }
    }

    /// Persist `data` locally under this node's namespace and replicate it,
    /// encrypted, to every connected peer.
    ///
    /// Returns the plaintext size. The local copy is kept even when some
    /// peers fail; those are listed in [`ServerError::PartialReplication`].
    pub async fn store<R>(&self, key: &str, mut data: R) -> Result<u64, ServerError>
    where
        R: AsyncRead + Unpin,
    {
        let mut buffer = Vec::new();
        data.read_to_end(&mut buffer).await?;
        let size = self.store.write(&self.config.node_id, key, &buffer[..]).await?;

        let peers = self.registry.snapshot();
        if peers.is_empty() {
            debug!("stored {:?} locally, no peers to replicate to", key);
            return Ok(size);
        }

        let mut ciphertext = Vec::with_capacity(buffer.len() + IV_SIZE);
        cipher::encrypt(&self.config.encryption_key, &buffer[..], &mut ciphertext).await?;

        let results = join_all(peers.iter().map(|peer| self.replicate(peer, key, &ciphertext))).await;
        let failed: Vec<PeerFailure> = peers
            .iter()
            .zip(results)
            .filter_map(|(peer, result)| {
                result.err().map(|e| PeerFailure { peer: peer.id().to_string(), reason: e.to_string() })
            })
            .collect();

        if !failed.is_empty() {
            return Err(ServerError::PartialReplication { attempted: peers.len(), failed });
        }
        info!("stored {:?} ({} bytes) and replicated to {} peers", key, size, peers.len());
        Ok(size)
    }

    async fn replicate(&self, peer: &Arc<Peer>, key: &str, ciphertext: &[u8]) -> Result<(), ServerError> {
        let _transfer_lock = peer.lock_transfer().await;
        let transfer = self.next_transfer.fetch_add(1, Ordering::Relaxed);

        let announcement = ControlMessage::StoreAnnouncement {
            transfer,
            namespace: self.config.node_id.clone(),
            key: key.to_string(),
            size: ciphertext.len() as u64,
        };
        self.announce(peer, &announcement, transfer).await?;

        let streamed = tokio::time::timeout(self.config.stream_timeout, async {
            let mut writer = peer.open_stream(None).await?;
            writer.write_all(ciphertext).await?;
            writer.flush().await?;
            Ok::<(), TransportError>(())
        })
        .await
        .unwrap_or(Err(TransportError::StreamTimeout(self.config.stream_timeout)));

        if let Err(e) = streamed {
            // the remote is now mid-stream; the connection cannot be reused
            if let Err(e) = peer.close().await {
                debug!("[{}] error while closing: {}", peer.id(), e);
            }
            return Err(e.into());
        }
        debug!("streamed {} bytes of {:?} to {}", ciphertext.len(), key, peer.id());
        Ok(())
    }

    /// Open `key`, fetching it from peers first if no local copy exists.
    ///
    /// A fetched copy is cached under this node's namespace.
    pub async fn get(&self, key: &str) -> Result<(u64, File), ServerError> {
        if let Some(namespace) = self.find_local(key).await? {
            debug!("serving {:?} from local disk ({})", key, namespace);
            return Ok(self.store.read(&namespace, key).await?);
        }

        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return Err(ServerError::NotFound(key.to_string()));
        }
        info!("don't have {:?} locally, fetching from {} peers", key, peers.len());

        let (reply_tx, reply_rx) = oneshot::channel();
        let joined = match self.fetches.lock().entry(key.to_string()) {
            Entry::Occupied(mut fetch) => {
                fetch.get_mut().waiters.push(reply_tx);
                true
            }
            Entry::Vacant(slot) => {
                slot.insert(Fetch {
                    waiting_on: peers.iter().map(|peer| peer.id().to_string()).collect(),
                    accepted_from: None,
                    waiters: vec![reply_tx],
                });
                false
            }
        };

        if !joined {
            let request = ControlMessage::GetRequest { key: key.to_string() };
            for peer in &peers {
                if let Err(e) = send_to(peer, &request).await {
                    warn!("failed to send get request to {}: {}", peer.id(), e);
                    self.fetch_miss(key, peer.id());
                }
            }
        }

        let outcome = match tokio::time::timeout(self.config.get_timeout, reply_rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => FetchOutcome::Missing,
            Err(_) => {
                warn!("timed out waiting for {:?}", key);
                self.finish_fetch(key, FetchOutcome::Missing);
                FetchOutcome::Missing
            }
        };

        match outcome {
            FetchOutcome::Fetched => {
                debug!("fetched {:?} from the network", key);
                Ok(self.store.read(&self.config.node_id, key).await?)
            }
            FetchOutcome::Missing => Err(ServerError::NotFound(key.to_string())),
            FetchOutcome::Failed(reason) => Err(ServerError::FetchFailed { key: key.to_string(), reason }),
        }
    }

    /// Remove this node's own copy of `key`.
    ///
    /// Coarse: every key sharing the same root path segment goes with it.
    pub async fn delete_local(&self, key: &str) -> Result<(), ServerError> {
        Ok(self.store.delete(&self.config.node_id, key).await?)
    }
}

async fn send_to(peer: &Peer, message: &ControlMessage) -> Result<(), ServerError> {
    peer.send_message(&message.encode()?).await?;
    Ok(())
}

fn notify_waiters(fetch: Fetch, outcome: FetchOutcome) {
    for waiter in fetch.waiters {
        let _ = waiter.send(outcome.clone());
    }
}

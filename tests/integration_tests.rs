// Integration tests for distfs
// Every test runs real nodes over loopback TCP, each with its own temp storage

use distfs::cipher::{encrypt, new_encryption_key};
use distfs::frame::{encode_message, read_frame, Frame, TAG_STREAM};
use distfs::message::ControlMessage;
use distfs::peer::Peer;
use distfs::server::{FileServer, FileServerConfig, ServerError};
use distfs::transport::{key_fingerprint, TransportError};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

struct Node {
    server: Arc<FileServer>,
    handle: JoinHandle<Result<(), ServerError>>,
    _dir: TempDir,
}

impl Node {
    fn addr(&self) -> String {
        self.server.listen_addr().unwrap().to_string()
    }

    /// Contents of `key` in `namespace` on this node's disk, if complete.
    fn on_disk(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        std::fs::read(self.server.storage().full_path(namespace, key)).ok()
    }
}

async fn spawn_node(key: &[u8], seeds: &[&Node]) -> Node {
    let dir = tempfile::tempdir().unwrap();
    let mut config = FileServerConfig::new(dir.path().join("storage"));
    config.encryption_key = key.to_vec();
    config.seeds = seeds.iter().map(|node| node.addr()).collect();
    config.ack_timeout = Duration::from_secs(2);
    config.get_timeout = Duration::from_secs(3);
    config.stream_timeout = Duration::from_secs(5);
    config.dial_pacing = Duration::from_millis(10);

    let server = FileServer::over_tcp("127.0.0.1:0", config);
    let running = server.clone();
    let handle = tokio::spawn(async move { running.start().await });

    eventually("node listening", || server.listen_addr().is_some()).await;
    Node { server, handle, _dir: dir }
}

async fn eventually<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..250 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {}", what);
}

async fn read_all(mut file: tokio::fs::File) -> Vec<u8> {
    let mut contents = Vec::new();
    file.read_to_end(&mut contents).await.unwrap();
    contents
}

/// A connection driven by hand, one frame at a time.
struct RawPeer {
    stream: TcpStream,
}

impl RawPeer {
    async fn connect(node: &Node, key: &[u8]) -> RawPeer {
        let mut stream = TcpStream::connect(node.addr()).await.unwrap();
        let fingerprint = key_fingerprint(key);
        stream.write_all(&fingerprint).await.unwrap();

        let mut remote = [0u8; 32];
        stream.read_exact(&mut remote).await.unwrap();
        assert_eq!(remote, fingerprint);
        RawPeer { stream }
    }

    async fn send(&mut self, message: &ControlMessage) {
        let frame = encode_message(&message.encode().unwrap()).unwrap();
        self.send_raw(&frame).await;
    }

    async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
        self.stream.flush().await.unwrap();
    }

    async fn next_frame(&mut self) -> Result<Frame, TransportError> {
        tokio::time::timeout(Duration::from_secs(3), read_frame(&mut self.stream))
            .await
            .expect("no frame within 3s")
    }

    async fn recv(&mut self) -> ControlMessage {
        match self.next_frame().await {
            Ok(Frame::Message(payload)) => ControlMessage::decode(&payload).unwrap(),
            other => panic!("expected a control message, got {:?}", other),
        }
    }
}

/// The first `len` bytes of an encrypted stream that should have been `full` long.
async fn truncated_ciphertext(key: &[u8], full: usize, len: usize) -> Vec<u8> {
    let mut ciphertext = Vec::new();
    encrypt(key, &vec![b'x'; full - 16][..], &mut ciphertext).await.unwrap();
    assert_eq!(ciphertext.len(), full);
    ciphertext.truncate(len);
    ciphertext
}

// ============================================================================
// Replication
// ============================================================================

#[tokio::test]
async fn test_store_replicates_to_peer() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    let b = spawn_node(&key, &[&a]).await;
    eventually("peers connected", || a.server.peer_count() == 1 && b.server.peer_count() == 1).await;

    let size = a.server.store("k1", &b"hello world"[..]).await.unwrap();
    assert_eq!(size, 11);
    assert_eq!(a.on_disk(a.server.node_id(), "k1").unwrap(), b"hello world");

    // the replica lives under the originating node's namespace
    eventually("replica on b", || {
        b.on_disk(a.server.node_id(), "k1").as_deref() == Some(&b"hello world"[..])
    })
    .await;
    assert!(b.on_disk(b.server.node_id(), "k1").is_none());
}

#[tokio::test]
async fn test_multiple_stores_to_same_peer() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    let b = spawn_node(&key, &[&a]).await;
    eventually("peers connected", || a.server.peer_count() == 1 && b.server.peer_count() == 1).await;

    let large: Vec<u8> = (0..200_000u32).map(|i| (i % 253) as u8).collect();
    for i in 0..5 {
        a.server.store(&format!("file-{}", i), &large[..]).await.unwrap();
    }

    for i in 0..5 {
        let name = format!("file-{}", i);
        eventually("large replica on b", || {
            b.on_disk(a.server.node_id(), &name).as_deref() == Some(&large[..])
        })
        .await;
    }
}

#[tokio::test]
async fn test_partial_failure_names_failing_peer() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    let b = spawn_node(&key, &[&a]).await;
    let c = spawn_node(&key, &[&a]).await;
    eventually("peers connected", || a.server.peer_count() == 2).await;

    // a registered peer whose connection is already gone
    let (ours, theirs) = tokio::io::duplex(64);
    drop(theirs);
    let (reader, writer) = tokio::io::split(ours);
    a.server
        .registry()
        .register(Arc::new(Peer::new("failing-peer", true, reader, writer)));

    let result = a.server.store("k2", &b"partial"[..]).await;
    match result {
        Err(ServerError::PartialReplication { attempted, failed }) => {
            assert_eq!(attempted, 3);
            assert_eq!(failed.len(), 1);
            assert_eq!(failed[0].peer, "failing-peer");
        }
        other => panic!("expected partial replication, got {:?}", other),
    }

    assert_eq!(a.on_disk(a.server.node_id(), "k2").unwrap(), b"partial");
    for node in [&b, &c] {
        eventually("replica on healthy peer", || {
            node.on_disk(a.server.node_id(), "k2").as_deref() == Some(&b"partial"[..])
        })
        .await;
    }
}

// ============================================================================
// Get
// ============================================================================

#[tokio::test]
async fn test_get_fetches_from_peer() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    a.server.store("k1", &b"hello world"[..]).await.unwrap();

    let c = spawn_node(&key, &[&a]).await;
    eventually("peers connected", || a.server.peer_count() == 1 && c.server.peer_count() == 1).await;
    assert!(c.on_disk(c.server.node_id(), "k1").is_none());

    let (size, file) = c.server.get("k1").await.unwrap();
    assert_eq!(size, 11);
    assert_eq!(read_all(file).await, b"hello world");

    // cached under the fetching node's own namespace
    assert_eq!(c.on_disk(c.server.node_id(), "k1").unwrap(), b"hello world");
}

#[tokio::test]
async fn test_get_served_from_replica() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    let b = spawn_node(&key, &[&a]).await;
    eventually("a and b connected", || a.server.peer_count() == 1 && b.server.peer_count() == 1).await;

    a.server.store("shared", &b"replicated bytes"[..]).await.unwrap();
    eventually("replica on b", || b.on_disk(a.server.node_id(), "shared").is_some()).await;

    // d only knows b, which holds a's replica
    let d = spawn_node(&key, &[&b]).await;
    eventually("d connected", || d.server.peer_count() == 1).await;

    let (_, file) = d.server.get("shared").await.unwrap();
    assert_eq!(read_all(file).await, b"replicated bytes");
}

#[tokio::test]
async fn test_get_missing_key() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    let b = spawn_node(&key, &[&a]).await;
    eventually("peers connected", || a.server.peer_count() == 1 && b.server.peer_count() == 1).await;

    // every peer answers, so this resolves well before the get timeout
    let started = tokio::time::Instant::now();
    let result = b.server.get("nobody-has-this").await;
    assert!(matches!(result, Err(ServerError::NotFound(ref k)) if k == "nobody-has-this"));
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
async fn test_get_fails_when_peer_hangs_up_mid_stream() {
    let key = new_encryption_key();
    let node = spawn_node(&key, &[]).await;
    let mut peer = RawPeer::connect(&node, &key).await;
    eventually("raw peer registered", || node.server.peer_count() == 1).await;

    let server = node.server.clone();
    let get = tokio::spawn(async move { server.get("k1").await });

    assert_eq!(peer.recv().await, ControlMessage::GetRequest { key: "k1".to_string() });
    peer.send(&ControlMessage::GetResponse { transfer: 1, key: "k1".to_string(), size: 100 })
        .await;
    assert_eq!(peer.recv().await, ControlMessage::Ack { transfer: 1, accepted: true });

    // announce 100 bytes, deliver 36, hang up
    let mut stream = vec![TAG_STREAM];
    stream.extend_from_slice(&100u64.to_le_bytes());
    stream.extend_from_slice(&truncated_ciphertext(&key, 100, 36).await);
    peer.send_raw(&stream).await;
    drop(peer);

    let result = get.await.unwrap();
    assert!(
        matches!(result, Err(ServerError::FetchFailed { ref key, .. }) if key == "k1"),
        "unexpected result: {:?}",
        result
    );
    assert!(node.on_disk(node.server.node_id(), "k1").is_none());
    assert_eq!(node.server.storage().locate("k1").await.unwrap(), None);
}

#[tokio::test]
async fn test_truncated_replica_is_not_kept() {
    let key = new_encryption_key();
    let node = spawn_node(&key, &[]).await;
    let mut peer = RawPeer::connect(&node, &key).await;
    eventually("raw peer registered", || node.server.peer_count() == 1).await;

    peer.send(&ControlMessage::StoreAnnouncement {
        transfer: 7,
        namespace: "raw-peer".to_string(),
        key: "k2".to_string(),
        size: 100,
    })
    .await;
    assert_eq!(peer.recv().await, ControlMessage::Ack { transfer: 7, accepted: true });

    let mut stream = vec![TAG_STREAM];
    stream.extend_from_slice(&truncated_ciphertext(&key, 100, 36).await);
    peer.send_raw(&stream).await;
    drop(peer);

    eventually("raw peer dropped", || node.server.peer_count() == 0).await;
    assert!(node.on_disk("raw-peer", "k2").is_none());
    assert!(matches!(node.server.get("k2").await, Err(ServerError::NotFound(_))));
}

// ============================================================================
// Lifecycle
// ============================================================================

#[tokio::test]
async fn test_mismatched_key_is_rejected() {
    let a = spawn_node(&new_encryption_key(), &[]).await;
    let e = spawn_node(&new_encryption_key(), &[&a]).await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(a.server.peer_count(), 0);
    assert_eq!(e.server.peer_count(), 0);
}

#[tokio::test]
async fn test_stop_ends_start() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    let b = spawn_node(&key, &[&a]).await;
    eventually("peers connected", || a.server.peer_count() == 1).await;

    a.server.stop();
    let finished = tokio::time::timeout(Duration::from_secs(5), a.handle).await;
    assert!(matches!(finished, Ok(Ok(Ok(())))));
    assert_eq!(a.server.peer_count(), 0);

    // the remote side notices the closed connection
    eventually("b drops a", || b.server.peer_count() == 0).await;
}

#[tokio::test]
async fn test_unreachable_seed_is_not_fatal() {
    let key = new_encryption_key();
    let a = spawn_node(&key, &[]).await;
    let addr = a.addr();
    a.server.stop();
    a.handle.await.unwrap().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let mut config = FileServerConfig::new(dir.path());
    config.encryption_key = key.to_vec();
    config.seeds = vec![addr];
    let server = FileServer::over_tcp("127.0.0.1:0", config);
    let running = server.clone();
    let handle = tokio::spawn(async move { running.start().await });

    eventually("node listening", || server.listen_addr().is_some()).await;
    server.store("still-works", &b"ok"[..]).await.unwrap();

    server.stop();
    handle.await.unwrap().unwrap();
}

// ============================================================================
// Protocol errors
// ============================================================================

#[tokio::test]
async fn test_undecodable_message_is_ignored() {
    let key = new_encryption_key();
    let node = spawn_node(&key, &[]).await;
    let mut peer = RawPeer::connect(&node, &key).await;
    eventually("raw peer registered", || node.server.peer_count() == 1).await;

    peer.send_raw(&encode_message(&[0xff; 9]).unwrap()).await;

    // the same connection still gets answers
    peer.send(&ControlMessage::GetRequest { key: "absent".to_string() }).await;
    assert_eq!(peer.recv().await, ControlMessage::NotFound { key: "absent".to_string() });
    assert_eq!(node.server.peer_count(), 1);
}

#[tokio::test]
async fn test_unannounced_stream_closes_connection() {
    let key = new_encryption_key();
    let node = spawn_node(&key, &[]).await;
    let mut peer = RawPeer::connect(&node, &key).await;
    eventually("raw peer registered", || node.server.peer_count() == 1).await;

    peer.send_raw(&[TAG_STREAM, 1, 2, 3]).await;

    assert!(peer.next_frame().await.is_err());
    eventually("raw peer dropped", || node.server.peer_count() == 0).await;
}

#[tokio::test]
async fn test_declined_get_response_skips_stream() {
    let key = new_encryption_key();
    let node = spawn_node(&key, &[]).await;
    node.server.store("held", &b"hello world"[..]).await.unwrap();
    let mut peer = RawPeer::connect(&node, &key).await;
    eventually("raw peer registered", || node.server.peer_count() == 1).await;

    peer.send(&ControlMessage::GetRequest { key: "held".to_string() }).await;
    let transfer = match peer.recv().await {
        ControlMessage::GetResponse { transfer, key, size } => {
            assert_eq!(key, "held");
            assert_eq!(size, 11 + 16);
            transfer
        }
        other => panic!("expected a get response, got {:?}", other),
    };
    peer.send(&ControlMessage::Ack { transfer, accepted: false }).await;

    // the next frame is the answer to the next request, not a stream
    peer.send(&ControlMessage::GetRequest { key: "absent".to_string() }).await;
    assert_eq!(peer.recv().await, ControlMessage::NotFound { key: "absent".to_string() });
    assert_eq!(node.server.peer_count(), 1);
}

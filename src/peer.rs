//! A remote node on the other end of one live connection.

use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use parking_lot::Mutex as SyncMutex;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, Mutex, MutexGuard, Notify};

use crate::frame::{self, TAG_STREAM};
use crate::transport::TransportError;

/// Remote socket address of a connection, as text.
pub type PeerId = String;

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
/// Buffered read side shared by the decode loop and whoever consumes a stream.
pub type FrameReader = BufReader<BoxedReader>;

pub struct Peer {
    id: PeerId,
    // true when we dialed, false when we accepted
    outbound: bool,
    reader: Mutex<FrameReader>,
    writer: Mutex<BoxedWriter>,
    transfer: Mutex<()>,
    pending_stream: SyncMutex<Option<oneshot::Sender<()>>>,
    closed: AtomicBool,
    close_notify: Notify,
}

impl Peer {
    pub fn new<R, W>(id: impl Into<PeerId>, outbound: bool, reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Peer {
            id: id.into(),
            outbound,
            reader: Mutex::new(BufReader::new(Box::new(reader))),
            writer: Mutex::new(Box::new(writer)),
            transfer: Mutex::new(()),
            pending_stream: SyncMutex::new(None),
            closed: AtomicBool::new(false),
            close_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Write raw bytes to the connection.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(data).await?;
        writer.flush().await?;
        Ok(())
    }

    /// Frame and send one control message.
    pub async fn send_message(&self, payload: &[u8]) -> Result<(), TransportError> {
        self.send(&frame::encode_message(payload)?).await
    }

    /// Write a stream tag (and an optional u64 LE length header) and hand back
    /// the locked writer for the body. Nothing else can be written to this
    /// connection until the returned guard is dropped.
    pub async fn open_stream(
        &self,
        length: Option<u64>,
    ) -> Result<MutexGuard<'_, BoxedWriter>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(&[TAG_STREAM]).await?;
        if let Some(length) = length {
            writer.write_all(&length.to_le_bytes()).await?;
        }
        Ok(writer)
    }

    /// Serialises outbound header-then-stream sequences to this peer, so the
    /// remote side never sees two announced streams interleave.
    pub async fn lock_transfer(&self) -> MutexGuard<'_, ()> {
        self.transfer.lock().await
    }

    /// The buffered read side. Only the decode loop and, while a stream is
    /// pending, its designated consumer may use it.
    pub async fn stream_reader(&self) -> MutexGuard<'_, FrameReader> {
        self.reader.lock().await
    }

    /// Arm the stream barrier. Called by the decode loop after reading a
    /// stream tag; the returned receiver fires on release.
    pub(crate) fn begin_stream(&self) -> oneshot::Receiver<()> {
        let (release, barrier) = oneshot::channel();
        if self.pending_stream.lock().replace(release).is_some() {
            warn!("[{}] stream barrier re-armed before release", self.id);
        }
        barrier
    }

    pub fn has_pending_stream(&self) -> bool {
        self.pending_stream.lock().is_some()
    }

    /// Let the decode loop continue after a stream has been consumed.
    ///
    /// One-shot: returns `false` if no stream was pending.
    pub fn release_pending_stream(&self) -> bool {
        match self.pending_stream.lock().take() {
            Some(release) => release.send(()).is_ok(),
            None => {
                warn!("[{}] no pending stream to release", self.id);
                false
            }
        }
    }

    /// Resolves once [`Peer::close`] has been called.
    pub async fn closed(&self) {
        let notified = self.close_notify.notified();
        if self.is_closed() {
            return;
        }
        notified.await;
    }

    /// Mark the connection closed, wake the decode loop and shut down the
    /// write side. Idempotent.
    pub async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.close_notify.notify_waiters();
        // dropping the sender fails any barrier wait
        self.pending_stream.lock().take();

        if let Ok(mut writer) = self.writer.try_lock() {
            writer.shutdown().await?;
        }
        Ok(())
    }
}

//! Storage collaborator: byte sinks for in-progress uploads.
//!
//! A [`Sink`] accepts whole chunks without blocking the control loop and
//! reports back-pressure once its buffer reaches the high-water mark; the
//! caller then waits on [`Sink::drained`] before asking the peer for more.

use std::future::Future;
use std::io;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use tokio::io::AsyncWriteExt;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::TransferError;
use crate::options::Destinations;

/// A boxed future returned by sink and storage methods.
pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Result of queueing a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteStatus {
    /// Buffer below the high-water mark; more data may follow right away.
    Ready,
    /// Buffer saturated; wait for [`Sink::drained`].
    Saturated,
}

/// Ordered byte sink owned by exactly one session.
pub trait Sink: Send + 'static {
    /// Queues a chunk. The chunk is either accepted whole or rejected.
    fn write(&mut self, chunk: Vec<u8>) -> Result<WriteStatus, TransferError>;

    /// Resolves once every queued byte has been written (or the sink failed).
    fn drained(&self) -> SinkFuture<'static, ()>;

    /// Flushes and releases the underlying handle.
    fn close(self: Box<Self>) -> SinkFuture<'static, Result<(), TransferError>>;
}

/// Opens, probes and deletes stored artifacts.
pub trait Storage: Send + Sync + 'static {
    fn exists<'a>(&'a self, path: &'a Path) -> SinkFuture<'a, bool>;

    fn open<'a>(
        &'a self,
        path: &'a Path,
        high_water_mark: usize,
    ) -> SinkFuture<'a, Result<Box<dyn Sink>, TransferError>>;

    fn remove<'a>(&'a self, path: &'a Path) -> SinkFuture<'a, Result<(), TransferError>>;
}

// ---------------------------------------------------------------------------
// FileStorage
// ---------------------------------------------------------------------------

/// Local-filesystem storage.
#[derive(Debug, Clone, Default)]
pub struct FileStorage;

impl FileStorage {
    pub fn new() -> Self {
        Self
    }

    /// Creates every configured destination directory (recursively).
    ///
    /// Run once at startup; sessions never create directories.
    pub async fn provision(destinations: &Destinations) -> Result<(), TransferError> {
        for dir in destinations.dirs() {
            tokio::fs::create_dir_all(dir).await?;
            debug!(dir = %dir.display(), "destination ready");
        }
        Ok(())
    }
}

impl Storage for FileStorage {
    fn exists<'a>(&'a self, path: &'a Path) -> SinkFuture<'a, bool> {
        Box::pin(async move { tokio::fs::try_exists(path).await.unwrap_or(false) })
    }

    fn open<'a>(
        &'a self,
        path: &'a Path,
        high_water_mark: usize,
    ) -> SinkFuture<'a, Result<Box<dyn Sink>, TransferError>> {
        Box::pin(async move {
            let sink = FileSink::create(path, high_water_mark).await?;
            Ok(Box::new(sink) as Box<dyn Sink>)
        })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> SinkFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            tokio::fs::remove_file(path).await?;
            info!(path = %path.display(), "removed rejected artifact");
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// FileSink
// ---------------------------------------------------------------------------

struct SinkShared {
    /// Bytes queued but not yet written to the file.
    pending: AtomicUsize,
    failed: AtomicBool,
    drained: Notify,
}

/// File sink backed by a dedicated writer task.
///
/// Chunks are queued on an unbounded channel so a write never blocks or
/// drops data; the pending-byte count drives back-pressure instead.
pub struct FileSink {
    tx: mpsc::UnboundedSender<Vec<u8>>,
    shared: Arc<SinkShared>,
    writer: JoinHandle<io::Result<()>>,
    high_water_mark: usize,
}

impl FileSink {
    /// Creates (or truncates) the file at `path` and starts its writer task.
    pub async fn create(path: &Path, high_water_mark: usize) -> Result<Self, TransferError> {
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .await?;

        let shared = Arc::new(SinkShared {
            pending: AtomicUsize::new(0),
            failed: AtomicBool::new(false),
            drained: Notify::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let writer = tokio::spawn(write_loop(file, rx, Arc::clone(&shared)));

        Ok(Self {
            tx,
            shared,
            writer,
            high_water_mark,
        })
    }

    /// Bytes queued but not yet written.
    pub fn pending(&self) -> usize {
        self.shared.pending.load(Ordering::SeqCst)
    }
}

impl Sink for FileSink {
    fn write(&mut self, chunk: Vec<u8>) -> Result<WriteStatus, TransferError> {
        if self.shared.failed.load(Ordering::SeqCst) {
            return Err(io::Error::other("sink writer failed").into());
        }

        let len = chunk.len();
        let pending = self.shared.pending.fetch_add(len, Ordering::SeqCst) + len;
        if self.tx.send(chunk).is_err() {
            self.shared.pending.fetch_sub(len, Ordering::SeqCst);
            return Err(io::Error::other("sink writer stopped").into());
        }

        if pending >= self.high_water_mark {
            Ok(WriteStatus::Saturated)
        } else {
            Ok(WriteStatus::Ready)
        }
    }

    fn drained(&self) -> SinkFuture<'static, ()> {
        let shared = Arc::clone(&self.shared);
        Box::pin(async move {
            loop {
                let notified = shared.drained.notified();
                tokio::pin!(notified);
                // Register before checking so a concurrent notify is not lost.
                notified.as_mut().enable();
                if shared.pending.load(Ordering::SeqCst) == 0
                    || shared.failed.load(Ordering::SeqCst)
                {
                    return;
                }
                notified.await;
            }
        })
    }

    fn close(self: Box<Self>) -> SinkFuture<'static, Result<(), TransferError>> {
        let FileSink { tx, writer, .. } = *self;
        Box::pin(async move {
            drop(tx);
            match writer.await {
                Ok(result) => result.map_err(TransferError::from),
                Err(e) => Err(io::Error::other(e).into()),
            }
        })
    }
}

/// Drains the chunk queue into the file until the sender is dropped.
async fn write_loop(
    mut file: tokio::fs::File,
    mut rx: mpsc::UnboundedReceiver<Vec<u8>>,
    shared: Arc<SinkShared>,
) -> io::Result<()> {
    while let Some(chunk) = rx.recv().await {
        let result = file.write_all(&chunk).await;
        let before = shared.pending.fetch_sub(chunk.len(), Ordering::SeqCst);

        if let Err(e) = result {
            shared.failed.store(true, Ordering::SeqCst);
            shared.drained.notify_waiters();
            return Err(e);
        }
        if before == chunk.len() {
            shared.drained.notify_waiters();
        }
    }

    file.flush().await?;
    Ok(())
}

//! In-memory collaborators and a controller harness for unit tests.

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use sluice_protocol::constants::MessageType;
use sluice_protocol::envelope::Message;
use sluice_protocol::messages::CreateFileRequest;
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::TransferError;
use crate::controller::{Command, Controller, ControllerHandle, UploadContext};
use crate::events::{ChannelObserver, TerminalEvent, UploadEvent};
use crate::mime::MimeResolver;
use crate::options::UploadOptions;
use crate::sink::{Sink, SinkFuture, Storage, WriteStatus};

const WAIT: Duration = Duration::from_secs(2);
const QUIET: Duration = Duration::from_millis(100);

#[derive(Default)]
struct Files {
    data: HashMap<PathBuf, Vec<u8>>,
    opened: Vec<PathBuf>,
    removed: Vec<PathBuf>,
    closed: usize,
}

/// Storage backed by a shared map.
///
/// Sinks can be switched to report saturation (drained only when the test
/// calls [`MemoryStorage::release_drain`]) or to fail every write. Opening
/// can be switched to fail as well.
#[derive(Clone, Default)]
pub(crate) struct MemoryStorage {
    files: Arc<Mutex<Files>>,
    saturate: Arc<AtomicBool>,
    fail_writes: Arc<AtomicBool>,
    fail_opens: Arc<AtomicBool>,
    gate: Arc<Notify>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populates a file, as if left by an earlier upload.
    pub fn insert(&self, path: impl Into<PathBuf>, data: &[u8]) {
        self.files.lock().unwrap().data.insert(path.into(), data.to_vec());
    }

    pub fn contents(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.lock().unwrap().data.get(path).cloned()
    }

    pub fn opened(&self) -> Vec<PathBuf> {
        self.files.lock().unwrap().opened.clone()
    }

    pub fn removed(&self) -> Vec<PathBuf> {
        self.files.lock().unwrap().removed.clone()
    }

    pub fn closed(&self) -> usize {
        self.files.lock().unwrap().closed
    }

    pub fn set_saturated(&self, on: bool) {
        self.saturate.store(on, Ordering::SeqCst);
    }

    pub fn set_failing(&self, on: bool) {
        self.fail_writes.store(on, Ordering::SeqCst);
    }

    pub fn set_open_failing(&self, on: bool) {
        self.fail_opens.store(on, Ordering::SeqCst);
    }

    /// Lets one pending `drained()` resolve.
    pub fn release_drain(&self) {
        self.gate.notify_one();
    }
}

impl Storage for MemoryStorage {
    fn exists<'a>(&'a self, path: &'a Path) -> SinkFuture<'a, bool> {
        Box::pin(async move { self.files.lock().unwrap().data.contains_key(path) })
    }

    fn open<'a>(
        &'a self,
        path: &'a Path,
        _high_water_mark: usize,
    ) -> SinkFuture<'a, Result<Box<dyn Sink>, TransferError>> {
        Box::pin(async move {
            if self.fail_opens.load(Ordering::SeqCst) {
                return Err(io::Error::other("permission denied").into());
            }
            let mut files = self.files.lock().unwrap();
            files.data.insert(path.to_path_buf(), Vec::new());
            files.opened.push(path.to_path_buf());
            drop(files);
            Ok(Box::new(MemorySink {
                path: path.to_path_buf(),
                storage: self.clone(),
            }) as Box<dyn Sink>)
        })
    }

    fn remove<'a>(&'a self, path: &'a Path) -> SinkFuture<'a, Result<(), TransferError>> {
        Box::pin(async move {
            let mut files = self.files.lock().unwrap();
            files.data.remove(path);
            files.removed.push(path.to_path_buf());
            Ok(())
        })
    }
}

struct MemorySink {
    path: PathBuf,
    storage: MemoryStorage,
}

impl Sink for MemorySink {
    fn write(&mut self, chunk: Vec<u8>) -> Result<WriteStatus, TransferError> {
        if self.storage.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::other("disk full").into());
        }
        let mut files = self.storage.files.lock().unwrap();
        files.data.entry(self.path.clone()).or_default().extend(chunk);
        if self.storage.saturate.load(Ordering::SeqCst) {
            Ok(WriteStatus::Saturated)
        } else {
            Ok(WriteStatus::Ready)
        }
    }

    fn drained(&self) -> SinkFuture<'static, ()> {
        let gate = Arc::clone(&self.storage.gate);
        Box::pin(async move { gate.notified().await })
    }

    fn close(self: Box<Self>) -> SinkFuture<'static, Result<(), TransferError>> {
        self.storage.files.lock().unwrap().closed += 1;
        Box::pin(async { Ok(()) })
    }
}

/// Always reports the same type.
pub(crate) struct FixedMime(pub &'static str);

impl MimeResolver for FixedMime {
    fn resolve<'a>(&'a self, _path: &'a Path, _display_name: &'a str) -> SinkFuture<'a, String> {
        let mime = self.0.to_string();
        Box::pin(async move { mime })
    }
}

/// A running controller wired to channel-backed peer and observer.
pub(crate) struct Harness {
    pub handle: ControllerHandle,
    pub peer: mpsc::UnboundedReceiver<Message>,
    pub events: mpsc::UnboundedReceiver<UploadEvent>,
    pub task: JoinHandle<()>,
}

impl Harness {
    pub fn start(
        options: UploadOptions,
        storage: Arc<dyn Storage>,
        mime: Arc<dyn MimeResolver>,
    ) -> Self {
        let (observer, events) = ChannelObserver::new();
        let ctx = UploadContext::new(options, storage, mime, Arc::new(observer));
        let (link, peer) = mpsc::unbounded_channel();
        let (controller, handle) = Controller::new(ctx, link);
        let task = tokio::spawn(controller.run());
        Self {
            handle,
            peer,
            events,
            task,
        }
    }

    pub fn with_memory(options: UploadOptions, storage: &MemoryStorage) -> Self {
        Self::start(
            options,
            Arc::new(storage.clone()),
            Arc::new(FixedMime("text/plain")),
        )
    }

    pub async fn send(&self, cmd: Command) {
        self.handle.send(cmd).await.unwrap();
    }

    pub async fn create(&self, id: &str, name: &str, size: u64, upload_to: Option<&str>) {
        self.send(Command::Create {
            id: id.into(),
            request: CreateFileRequest {
                name: name.into(),
                size,
                upload_to: upload_to.map(String::from),
            },
        })
        .await;
    }

    pub async fn chunk(&self, id: &str, data: &[u8]) {
        self.send(Command::Chunk {
            id: id.into(),
            data: data.to_vec(),
        })
        .await;
    }

    pub async fn done(&self, id: &str) {
        self.send(Command::Done { id: id.into() }).await;
    }

    pub async fn next_message(&mut self) -> Message {
        tokio::time::timeout(WAIT, self.peer.recv())
            .await
            .expect("timed out waiting for a peer message")
            .expect("peer link closed")
    }

    /// Waits for the next message and checks its type and scope.
    pub async fn expect(&mut self, id: &str, msg_type: MessageType) -> Message {
        let msg = self.next_message().await;
        assert_eq!(msg.msg_type, msg_type, "unexpected message {msg:?}");
        assert_eq!(msg.id, id);
        msg
    }

    pub async fn expect_error(&mut self, id: &str, code: i32) -> Message {
        let msg = self.expect(id, MessageType::Error).await;
        assert_eq!(msg.error.as_ref().map(|e| e.code), Some(code), "{msg:?}");
        msg
    }

    /// Asserts that no peer message arrives for a short while.
    pub async fn assert_quiet(&mut self) {
        if let Ok(msg) = tokio::time::timeout(QUIET, self.peer.recv()).await {
            panic!("expected no peer message, got {msg:?}");
        }
    }

    /// Skips ready/start/stream events up to the next terminal event.
    pub async fn next_terminal(&mut self) -> TerminalEvent {
        loop {
            let event = tokio::time::timeout(WAIT, self.events.recv())
                .await
                .expect("timed out waiting for a terminal event")
                .expect("observer channel closed");
            if let UploadEvent::Terminal(t) = event {
                return t;
            }
        }
    }

    /// Every event observed so far, without waiting.
    pub fn drain_events(&mut self) -> Vec<UploadEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

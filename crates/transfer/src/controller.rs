//! Per-connection upload controller.
//!
//! One [`Controller`] owns every session of one peer connection and drives
//! them from a single loop. Commands decoded by the transport arrive on a
//! bounded channel; sink drains, transmission delays and finalization run
//! as spawned tasks that report back through an internal wake channel, so
//! a slow session never stalls dispatch for the others.

use std::path::PathBuf;
use std::sync::Arc;

use sluice_protocol::constants::MessageType;
use sluice_protocol::envelope::Message;
use sluice_protocol::messages::CreateFileRequest;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::TransferError;
use crate::events::{ErrorInfo, TerminalEvent, UploadObserver};
use crate::mime::MimeResolver;
use crate::options::UploadOptions;
use crate::policy::AcceptancePolicy;
use crate::registry::SessionRegistry;
use crate::resolver::{Naming, resolve_destination};
use crate::session::{Credit, Ingest, Session, SessionState};
use crate::sink::{Sink, Storage, WriteStatus};

/// Capacity of the command channel between transport and controller.
pub const COMMAND_BUFFER_SIZE: usize = 256;

/// Delivers messages to the peer of one connection.
pub trait PeerLink: Send + Sync + 'static {
    /// Must not block. Delivery to a closed connection is silently dropped.
    fn deliver(&self, msg: Message);
}

impl PeerLink for mpsc::UnboundedSender<Message> {
    fn deliver(&self, msg: Message) {
        if self.send(msg).is_err() {
            debug!("peer link closed, message dropped");
        }
    }
}

/// Inputs to the controller.
#[derive(Debug)]
pub enum Command {
    ReqSync { request_id: String },
    Create { id: String, request: CreateFileRequest },
    Chunk { id: String, data: Vec<u8> },
    Done { id: String },
    /// Peer abort, or a system abort issued through [`ControllerHandle::abort`].
    Abort { id: String },
}

/// Internal completions reported by spawned tasks.
///
/// The epoch ties a wake to the session that scheduled it; a wake for a
/// session that has since terminated (even if its id was reused) is dropped.
#[derive(Debug)]
enum Wake {
    Drained { id: String, epoch: u64 },
    DelayElapsed { id: String, epoch: u64 },
    Finalized {
        id: String,
        epoch: u64,
        result: Result<String, TransferError>,
    },
}

#[derive(Debug, thiserror::Error)]
#[error("upload controller has stopped")]
pub struct ControllerClosed;

/// Cloneable entry point into a running controller.
#[derive(Debug, Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
}

impl ControllerHandle {
    pub async fn send(&self, cmd: Command) -> Result<(), ControllerClosed> {
        self.commands.send(cmd).await.map_err(|_| ControllerClosed)
    }

    /// Requests an abort of `id` on behalf of the host process.
    pub async fn abort(&self, id: impl Into<String>) -> Result<(), ControllerClosed> {
        self.send(Command::Abort { id: id.into() }).await
    }
}

/// Collaborators shared by every connection of a server.
#[derive(Clone)]
pub struct UploadContext {
    pub options: Arc<UploadOptions>,
    pub storage: Arc<dyn Storage>,
    pub mime: Arc<dyn MimeResolver>,
    pub observer: Arc<dyn UploadObserver>,
}

impl UploadContext {
    pub fn new(
        options: UploadOptions,
        storage: Arc<dyn Storage>,
        mime: Arc<dyn MimeResolver>,
        observer: Arc<dyn UploadObserver>,
    ) -> Self {
        Self {
            options: Arc::new(options),
            storage,
            mime,
            observer,
        }
    }
}

pub struct Controller<L: PeerLink> {
    ctx: UploadContext,
    policy: Arc<AcceptancePolicy>,
    link: L,
    sessions: SessionRegistry<Session>,
    commands: mpsc::Receiver<Command>,
    wake_tx: mpsc::UnboundedSender<Wake>,
    wakes: mpsc::UnboundedReceiver<Wake>,
    next_epoch: u64,
    synced: bool,
}

impl<L: PeerLink> Controller<L> {
    pub fn new(ctx: UploadContext, link: L) -> (Self, ControllerHandle) {
        let (cmd_tx, commands) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (wake_tx, wakes) = mpsc::unbounded_channel();
        let policy = Arc::new(AcceptancePolicy::from_options(&ctx.options));
        let controller = Self {
            ctx,
            policy,
            link,
            sessions: SessionRegistry::new(),
            commands,
            wake_tx,
            wakes,
            next_epoch: 0,
            synced: false,
        };
        (controller, ControllerHandle { commands: cmd_tx })
    }

    /// Runs until every handle is dropped, then winds down the remaining
    /// sessions: streaming ones are aborted, completing ones are allowed to
    /// finish.
    pub async fn run(mut self) {
        loop {
            tokio::select! {
                cmd = self.commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                Some(wake) = self.wakes.recv() => self.handle_wake(wake),
            }
        }
        self.shutdown().await;
    }

    async fn handle_command(&mut self, cmd: Command) {
        match cmd {
            Command::ReqSync { request_id } => self.sync(&request_id),
            Command::Create { id, request } => self.create(id, request).await,
            Command::Chunk { id, data } => self.chunk(&id, data),
            Command::Done { id } => self.done(&id),
            Command::Abort { id } => self.abort(&id),
        }
    }

    fn handle_wake(&mut self, wake: Wake) {
        match wake {
            Wake::Drained { id, epoch } | Wake::DelayElapsed { id, epoch } => {
                self.resume(&id, epoch)
            }
            Wake::Finalized { id, epoch, result } => self.finalized(&id, epoch, result),
        }
    }

    async fn shutdown(&mut self) {
        for id in self.sessions.ids() {
            let completing = self
                .sessions
                .get(&id)
                .is_some_and(|s| s.state == SessionState::Completing);
            if !completing {
                self.abort_session(&id, false);
            }
        }

        while !self.sessions.is_empty() {
            match self.wakes.recv().await {
                Some(wake) => self.handle_wake(wake),
                None => break,
            }
        }
        debug!("upload controller stopped");
    }

    // -----------------------------------------------------------------------
    // Commands
    // -----------------------------------------------------------------------

    fn sync(&mut self, request_id: &str) {
        if self.synced {
            debug!(request_id, "repeated req_sync ignored");
            return;
        }
        let sync = self.ctx.options.sync_response();
        match Message::new(request_id, MessageType::Sync, Some(&sync)) {
            Ok(msg) => {
                self.synced = true;
                self.link.deliver(msg);
                self.ctx.observer.on_ready();
            }
            Err(e) => warn!("failed to encode sync response: {e}"),
        }
    }

    async fn create(&mut self, id: String, request: CreateFileRequest) {
        let options = Arc::clone(&self.ctx.options);
        let naming = Naming::generate(&request.name, &options.rename);
        let destination = match resolve_destination(
            &options.destinations,
            request.upload_to.as_deref(),
            &naming.stored_name,
        ) {
            Ok(path) => path,
            Err(e) => return self.reject(&id, e),
        };

        self.next_epoch += 1;
        let session = Session::new(id.clone(), self.next_epoch, request, naming, destination);
        let start = session.start_event();
        if let Err(e) = self.sessions.create(&id, session) {
            return self.reject(&id, e);
        }
        self.ctx.observer.on_start(&start);
        let destination = start.destination;

        if !options.overwrite && self.ctx.storage.exists(&destination).await {
            debug!(upload_id = %id, path = %destination.display(), "destination exists, transfer skipped");
            if let Some(session) = self.sessions.get_mut(&id) {
                session.state = SessionState::Completing;
            }
            self.spawn_finalize(&id, false);
            return;
        }

        match self
            .ctx
            .storage
            .open(&destination, options.sink_high_water_mark)
            .await
        {
            Ok(sink) => {
                if let Some(session) = self.sessions.get_mut(&id) {
                    session.sink = Some(sink);
                    session.state = SessionState::Streaming(Credit::Outstanding);
                }
                self.request_chunk(&id);
            }
            Err(e) => self.fail(&id, e),
        }
    }

    fn chunk(&mut self, id: &str, data: Vec<u8>) {
        let Some(session) = self.sessions.get_mut(id) else {
            debug!(upload_id = id, "chunk for unknown session ignored");
            return;
        };

        match session.ingest(data, &self.policy) {
            Ingest::Ignore => debug!(upload_id = id, "chunk after done ignored"),
            Ingest::Violation => self.fail(id, TransferError::UnexpectedChunk(id.to_string())),
            Ingest::Abort => self.abort_session(id, true),
            Ingest::Reject(e) => self.fail(id, e),
            Ingest::Written { status, progress } => {
                self.ctx.observer.on_progress(&progress);
                self.after_write(id, status);
            }
        }
    }

    fn done(&mut self, id: &str) {
        let Some(session) = self.sessions.get_mut(id) else {
            debug!(upload_id = id, "done for unknown session ignored");
            return;
        };
        if session.state == SessionState::Completing {
            debug!(upload_id = id, "repeated done ignored");
            return;
        }
        if session.abort_requested {
            // The pending wake delivers the abort.
            return;
        }
        session.state = SessionState::Completing;
        self.spawn_finalize(id, true);
    }

    fn abort(&mut self, id: &str) {
        let Some(session) = self.sessions.get_mut(id) else {
            debug!(upload_id = id, "abort for unknown session ignored");
            return;
        };
        if session.state == SessionState::Completing {
            debug!(upload_id = id, "abort after done ignored");
        } else if session.is_suspended() {
            session.abort_requested = true;
        } else {
            self.abort_session(id, true);
        }
    }

    // -----------------------------------------------------------------------
    // Flow control
    // -----------------------------------------------------------------------

    fn request_chunk(&self, id: &str) {
        self.link.deliver(Message::signal(id, MessageType::Request));
    }

    /// Hands out the next credit, now or once the sink drains or the
    /// transmission delay elapses.
    fn after_write(&mut self, id: &str, status: WriteStatus) {
        let delay = self.ctx.options.transmission_delay;
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let epoch = session.epoch;

        match status {
            WriteStatus::Saturated => {
                let Some(drained) = session.sink.as_ref().map(|sink| sink.drained()) else {
                    return;
                };
                session.state = SessionState::Streaming(Credit::AwaitingDrain);
                let wakes = self.wake_tx.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    drained.await;
                    let _ = wakes.send(Wake::Drained { id, epoch });
                });
            }
            WriteStatus::Ready if !delay.is_zero() => {
                session.state = SessionState::Streaming(Credit::AwaitingDelay);
                let wakes = self.wake_tx.clone();
                let id = id.to_string();
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    let _ = wakes.send(Wake::DelayElapsed { id, epoch });
                });
            }
            WriteStatus::Ready => self.request_chunk(id),
        }
    }

    fn resume(&mut self, id: &str, epoch: u64) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        if session.epoch != epoch || !session.is_suspended() {
            return;
        }
        if session.abort_requested {
            self.abort_session(id, true);
            return;
        }
        session.state = SessionState::Streaming(Credit::Outstanding);
        self.request_chunk(id);
    }

    // -----------------------------------------------------------------------
    // Termination
    // -----------------------------------------------------------------------

    /// Closes the sink, resolves the MIME type and applies the allow-list
    /// off the control loop. `validate` is false when the transfer was
    /// skipped because the destination already existed.
    fn spawn_finalize(&mut self, id: &str, validate: bool) {
        let Some(session) = self.sessions.get_mut(id) else {
            return;
        };
        let job = Finalize {
            sink: session.sink.take(),
            destination: session.destination.clone(),
            display_name: session.display_name.clone(),
            stored_name: session.stored_name.clone(),
            validate,
        };
        let epoch = session.epoch;
        let ctx = self.ctx.clone();
        let policy = Arc::clone(&self.policy);
        let wakes = self.wake_tx.clone();
        let id = id.to_string();

        tokio::spawn(async move {
            let result = job.run(&ctx, &policy).await;
            let _ = wakes.send(Wake::Finalized { id, epoch, result });
        });
    }

    fn finalized(&mut self, id: &str, epoch: u64, result: Result<String, TransferError>) {
        if self.sessions.get(id).is_none_or(|s| s.epoch != epoch) {
            return;
        }
        let Some(session) = self.sessions.remove(id) else {
            return;
        };

        match result {
            Ok(mime) => {
                let info = session.complete_info(mime);
                match Message::new(id, MessageType::Complete, Some(&info.to_wire())) {
                    Ok(msg) => self.link.deliver(msg),
                    Err(e) => warn!(upload_id = id, "failed to encode complete event: {e}"),
                }
                self.ctx.observer.on_terminal(&TerminalEvent::Completed(info));
            }
            Err(e) => self.reject(id, e),
        }
    }

    /// Terminates a session as aborted. The peer is told unless it is
    /// already gone.
    fn abort_session(&mut self, id: &str, notify_peer: bool) {
        let Some(mut session) = self.sessions.remove(id) else {
            return;
        };
        release_sink(id, session.sink.take());
        let info = session.abort_info();
        info!(upload_id = id, wrote = info.wrote, "upload aborted");

        if notify_peer {
            match Message::new(id, MessageType::Abort, Some(&info.to_wire())) {
                Ok(msg) => self.link.deliver(msg),
                Err(e) => warn!(upload_id = id, "failed to encode abort event: {e}"),
            }
        }
        self.ctx.observer.on_terminal(&TerminalEvent::Aborted(info));
    }

    /// Terminates an active session with an error.
    fn fail(&mut self, id: &str, error: TransferError) {
        if let Some(mut session) = self.sessions.remove(id) {
            release_sink(id, session.sink.take());
        }
        self.reject(id, error);
    }

    /// Reports an error scoped to `id` to the peer and the observer.
    fn reject(&self, id: &str, error: TransferError) {
        debug!(upload_id = id, code = error.code(), "upload rejected: {error}");
        self.link
            .deliver(Message::error(id, error.code(), error.to_string()));
        self.ctx.observer.on_terminal(&TerminalEvent::Errored(ErrorInfo {
            id: id.to_string(),
            error: Arc::new(error),
        }));
    }
}

struct Finalize {
    sink: Option<Box<dyn Sink>>,
    destination: PathBuf,
    display_name: String,
    stored_name: String,
    validate: bool,
}

impl Finalize {
    async fn run(
        self,
        ctx: &UploadContext,
        policy: &AcceptancePolicy,
    ) -> Result<String, TransferError> {
        if let Some(sink) = self.sink {
            sink.close().await?;
        }

        let mime = ctx.mime.resolve(&self.destination, &self.display_name).await;
        if !self.validate {
            return Ok(mime);
        }
        if let Err(e) = policy.check_type(&mime, &self.stored_name) {
            if let Err(rm) = ctx.storage.remove(&self.destination).await {
                warn!(path = %self.destination.display(), "failed to remove rejected artifact: {rm}");
            }
            return Err(e);
        }
        Ok(mime)
    }
}

/// Closes a sink in the background; the session is already gone.
fn release_sink(id: &str, sink: Option<Box<dyn Sink>>) {
    let Some(sink) = sink else {
        return;
    };
    let close = sink.close();
    let id = id.to_string();
    tokio::spawn(async move {
        if let Err(e) = close.await {
            warn!(upload_id = %id, "failed to close sink: {e}");
        }
    });
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use sluice_protocol::messages::{AbortEvent, CompleteEvent, SyncResponse};
    use tempfile::TempDir;

    use super::*;
    use crate::events::UploadEvent;
    use crate::mime::SniffingMimeResolver;
    use crate::options::{Destinations, RenamePolicy};
    use crate::sink::FileStorage;
    use crate::testsupport::{Harness, MemoryStorage};

    fn options() -> UploadOptions {
        UploadOptions::new(Destinations::Single("/up".into()))
    }

    fn keyed_options() -> UploadOptions {
        let mut map = BTreeMap::new();
        map.insert("docs".to_string(), PathBuf::from("/docs"));
        map.insert("images".to_string(), PathBuf::from("/images"));
        UploadOptions::new(Destinations::Keyed(map))
    }

    fn fixed_name(mut opts: UploadOptions, name: &str) -> UploadOptions {
        opts.rename = RenamePolicy::Static(name.into());
        opts
    }

    #[tokio::test]
    async fn full_upload_writes_every_byte() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(fixed_name(options(), "f.bin"), &storage);

        h.create("u1", "notes.txt", 11, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"hello").await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b" world").await;
        h.expect("u1", MessageType::Request).await;
        h.done("u1").await;

        let msg = h.expect("u1", MessageType::Complete).await;
        let complete: CompleteEvent = msg.parse_payload().unwrap().unwrap();
        assert_eq!(complete.wrote, 11);
        assert_eq!(complete.size, 11);
        assert_eq!(complete.display_name, "notes.txt");
        assert_eq!(complete.extension, "txt");
        assert_eq!(complete.mime, "text/plain");
        h.assert_quiet().await;

        assert_eq!(
            storage.contents(&PathBuf::from("/up/f.bin")).unwrap(),
            b"hello world"
        );
        assert_eq!(storage.closed(), 1);

        let events = h.drain_events();
        assert!(matches!(events[0], UploadEvent::Start(_)));
        let progress: Vec<u64> = events
            .iter()
            .filter_map(|e| match e {
                UploadEvent::Stream(p) => Some(p.wrote),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![5, 11]);
        let terminals = events
            .iter()
            .filter(|e| matches!(e, UploadEvent::Terminal(_)))
            .count();
        assert_eq!(terminals, 1);
        match events.last() {
            Some(UploadEvent::Terminal(TerminalEvent::Completed(info))) => {
                assert_eq!(info.destination, PathBuf::from("/up/f.bin"));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn sync_is_answered_once() {
        let storage = MemoryStorage::new();
        let mut opts = options();
        opts.max_file_size = Some(1024);
        opts.transmission_delay = Duration::from_millis(20);
        let mut h = Harness::with_memory(opts, &storage);

        h.send(Command::ReqSync {
            request_id: "r1".into(),
        })
        .await;
        let msg = h.expect("r1", MessageType::Sync).await;
        let sync: SyncResponse = msg.parse_payload().unwrap().unwrap();
        assert_eq!(sync.max_file_size, Some(1024));
        assert_eq!(sync.chunk_size, 10240);
        assert_eq!(sync.transmission_delay, 20);

        h.send(Command::ReqSync {
            request_id: "r2".into(),
        })
        .await;
        h.assert_quiet().await;

        let ready = h
            .drain_events()
            .iter()
            .filter(|e| matches!(e, UploadEvent::Ready))
            .count();
        assert_eq!(ready, 1);
    }

    #[tokio::test]
    async fn overflowing_chunk_is_not_written() {
        let storage = MemoryStorage::new();
        let mut opts = fixed_name(options(), "f.bin");
        opts.max_file_size = Some(10);
        let mut h = Harness::with_memory(opts, &storage);

        h.create("u1", "a.bin", 11, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", &[1u8; 6]).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", &[2u8; 5]).await;

        h.expect_error("u1", 413).await;
        match h.next_terminal().await {
            TerminalEvent::Errored(e) => {
                assert!(matches!(*e.error, TransferError::SizeExceeded { limit: 10 }))
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert_eq!(
            storage.contents(&PathBuf::from("/up/f.bin")).unwrap(),
            vec![1u8; 6]
        );

        // The session is gone: later messages for the id are ignored.
        h.chunk("u1", b"x").await;
        h.done("u1").await;
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn rejected_type_removes_artifact() {
        let dir = TempDir::new().unwrap();
        let mut opts = UploadOptions::new(Destinations::Single(dir.path().to_path_buf()));
        opts.accepts = vec!["text/plain".into()];
        opts.rename = RenamePolicy::Static("upload.bin".into());
        let mut h = Harness::start(
            opts,
            Arc::new(FileStorage::new()),
            Arc::new(SniffingMimeResolver::new()),
        );

        h.create("u1", "notes.txt", 16, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR").await;
        h.expect("u1", MessageType::Request).await;
        h.done("u1").await;

        let msg = h.expect_error("u1", 406).await;
        let text = msg.error.unwrap().message;
        assert!(text.contains("image/png of upload.bin"), "{text}");
        assert!(text.contains("text/plain"));
        assert!(!dir.path().join("upload.bin").exists());
    }

    #[tokio::test]
    async fn accepted_type_completes() {
        let dir = TempDir::new().unwrap();
        let mut opts = UploadOptions::new(Destinations::Single(dir.path().to_path_buf()));
        opts.accepts = vec!["text/plain".into()];
        opts.rename = RenamePolicy::Static("upload.bin".into());
        let mut h = Harness::start(
            opts,
            Arc::new(FileStorage::new()),
            Arc::new(SniffingMimeResolver::new()),
        );

        h.create("u1", "notes.txt", 5, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"hello").await;
        h.expect("u1", MessageType::Request).await;
        h.done("u1").await;

        h.expect("u1", MessageType::Complete).await;
        assert_eq!(std::fs::read(dir.path().join("upload.bin")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn existing_destination_completes_without_transfer() {
        let storage = MemoryStorage::new();
        storage.insert("/up/fixed.bin", b"old");
        let mut h = Harness::with_memory(fixed_name(options(), "fixed.bin"), &storage);

        h.create("u1", "fixed.bin", 100, None).await;

        let msg = h.expect("u1", MessageType::Complete).await;
        let complete: CompleteEvent = msg.parse_payload().unwrap().unwrap();
        assert_eq!(complete.wrote, 0);
        assert!(storage.opened().is_empty());
        assert!(storage.removed().is_empty());
        assert_eq!(
            storage.contents(&PathBuf::from("/up/fixed.bin")).unwrap(),
            b"old"
        );
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn overwrite_replaces_existing_destination() {
        let storage = MemoryStorage::new();
        storage.insert("/up/fixed.bin", b"old");
        let mut opts = fixed_name(options(), "fixed.bin");
        opts.overwrite = true;
        let mut h = Harness::with_memory(opts, &storage);

        h.create("u1", "fixed.bin", 3, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"new").await;
        h.expect("u1", MessageType::Request).await;
        h.done("u1").await;

        h.expect("u1", MessageType::Complete).await;
        assert_eq!(
            storage.contents(&PathBuf::from("/up/fixed.bin")).unwrap(),
            b"new"
        );
    }

    #[tokio::test]
    async fn abort_after_done_is_ignored() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 3, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"abc").await;
        h.expect("u1", MessageType::Request).await;
        h.done("u1").await;
        h.handle.abort("u1").await.unwrap();

        h.expect("u1", MessageType::Complete).await;
        h.assert_quiet().await;
        assert!(matches!(h.next_terminal().await, TerminalEvent::Completed(_)));
        assert!(
            !h.drain_events()
                .iter()
                .any(|e| matches!(e, UploadEvent::Terminal(_)))
        );
    }

    #[tokio::test]
    async fn done_after_abort_is_ignored() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 10, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"abcd").await;
        h.expect("u1", MessageType::Request).await;
        h.send(Command::Abort { id: "u1".into() }).await;
        h.done("u1").await;

        let msg = h.expect("u1", MessageType::Abort).await;
        let abort: AbortEvent = msg.parse_payload().unwrap().unwrap();
        assert_eq!(abort.wrote, 4);
        assert_eq!(abort.name, "a.txt");
        h.assert_quiet().await;

        match h.next_terminal().await {
            TerminalEvent::Aborted(info) => assert_eq!(info.wrote, 4),
            other => panic!("expected abort, got {other:?}"),
        }
        assert_eq!(storage.closed(), 1);
    }

    #[tokio::test]
    async fn keyed_destinations_require_a_key() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(keyed_options(), &storage);

        h.create("u1", "a.txt", 3, None).await;
        h.expect_error("u1", 400).await;

        h.create("u2", "a.txt", 3, Some("music")).await;
        h.expect_error("u2", 404).await;

        assert!(storage.opened().is_empty());
    }

    #[tokio::test]
    async fn keyed_destination_is_used() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(fixed_name(keyed_options(), "f.bin"), &storage);

        h.create("u1", "a.txt", 3, Some("images")).await;
        h.expect("u1", MessageType::Request).await;
        assert_eq!(storage.opened(), vec![PathBuf::from("/images/f.bin")]);
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 3, None).await;
        h.expect("u1", MessageType::Request).await;
        h.create("u1", "b.txt", 3, None).await;
        h.expect_error("u1", 409).await;

        // The original session is untouched.
        h.chunk("u1", b"abc").await;
        h.expect("u1", MessageType::Request).await;
        h.done("u1").await;
        let msg = h.expect("u1", MessageType::Complete).await;
        let complete: CompleteEvent = msg.parse_payload().unwrap().unwrap();
        assert_eq!(complete.display_name, "a.txt");
        assert_eq!(storage.opened().len(), 1);
    }

    #[tokio::test]
    async fn saturated_sink_defers_next_request() {
        let storage = MemoryStorage::new();
        storage.set_saturated(true);
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 6, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"abc").await;
        h.assert_quiet().await;

        storage.release_drain();
        h.expect("u1", MessageType::Request).await;
    }

    #[tokio::test]
    async fn chunk_without_credit_fails_session() {
        let storage = MemoryStorage::new();
        storage.set_saturated(true);
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 6, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"abc").await;
        h.chunk("u1", b"def").await;

        h.expect_error("u1", 400).await;
        // A late drain for the failed session requests nothing.
        storage.release_drain();
        h.assert_quiet().await;
    }

    #[tokio::test]
    async fn abort_while_draining_takes_effect_on_drain() {
        let storage = MemoryStorage::new();
        storage.set_saturated(true);
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 6, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"abc").await;
        h.handle.abort("u1").await.unwrap();
        h.done("u1").await;
        h.assert_quiet().await;

        storage.release_drain();
        let msg = h.expect("u1", MessageType::Abort).await;
        let abort: AbortEvent = msg.parse_payload().unwrap().unwrap();
        assert_eq!(abort.wrote, 3);
        h.assert_quiet().await;
    }

    #[tokio::test(start_paused = true)]
    async fn transmission_delay_throttles_requests() {
        let storage = MemoryStorage::new();
        let mut opts = options();
        opts.transmission_delay = Duration::from_millis(500);
        let mut h = Harness::with_memory(opts, &storage);

        h.create("u1", "a.txt", 6, None).await;
        h.expect("u1", MessageType::Request).await;

        let sent = tokio::time::Instant::now();
        h.chunk("u1", b"abc").await;
        h.assert_quiet().await;
        h.expect("u1", MessageType::Request).await;
        assert!(sent.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test]
    async fn messages_for_unknown_ids_are_ignored() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(options(), &storage);

        h.chunk("ghost", b"abc").await;
        h.done("ghost").await;
        h.handle.abort("ghost").await.unwrap();
        h.assert_quiet().await;
        assert!(h.drain_events().is_empty());
    }

    #[tokio::test]
    async fn sink_write_failure_is_fatal() {
        let storage = MemoryStorage::new();
        storage.set_failing(true);
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 3, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"abc").await;

        h.expect_error("u1", 500).await;
        assert!(matches!(h.next_terminal().await, TerminalEvent::Errored(_)));
    }

    #[tokio::test]
    async fn sink_open_failure_is_fatal() {
        let storage = MemoryStorage::new();
        storage.set_open_failing(true);
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 3, None).await;
        h.expect_error("u1", 500).await;
        h.assert_quiet().await;

        let events = h.drain_events();
        assert_eq!(events.len(), 2, "{events:?}");
        assert!(matches!(events[0], UploadEvent::Start(_)));
        match &events[1] {
            UploadEvent::Terminal(TerminalEvent::Errored(e)) => {
                assert!(matches!(*e.error, TransferError::SinkIo(_)))
            }
            other => panic!("expected error, got {other:?}"),
        }
        assert!(storage.opened().is_empty());
    }

    #[tokio::test]
    async fn chunk_after_abort_while_draining_aborts_at_once() {
        let storage = MemoryStorage::new();
        storage.set_saturated(true);
        let mut h = Harness::with_memory(fixed_name(options(), "f.bin"), &storage);

        h.create("u1", "a.txt", 6, None).await;
        h.expect("u1", MessageType::Request).await;
        h.chunk("u1", b"abc").await;
        h.handle.abort("u1").await.unwrap();
        h.chunk("u1", b"def").await;

        let msg = h.expect("u1", MessageType::Abort).await;
        let abort: AbortEvent = msg.parse_payload().unwrap().unwrap();
        assert_eq!(abort.wrote, 3);

        // The drain of the aborted session grants nothing.
        storage.release_drain();
        h.assert_quiet().await;

        let terminals: Vec<_> = h
            .drain_events()
            .into_iter()
            .filter_map(|e| match e {
                UploadEvent::Terminal(t) => Some(t),
                _ => None,
            })
            .collect();
        assert_eq!(terminals.len(), 1);
        assert!(matches!(terminals[0], TerminalEvent::Aborted(_)));
        assert_eq!(
            storage.contents(&PathBuf::from("/up/f.bin")).unwrap(),
            b"abc"
        );
        assert_eq!(storage.closed(), 1);
    }

    #[tokio::test]
    async fn id_is_reusable_after_completion() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(options(), &storage);

        for name in ["first.txt", "second.txt"] {
            h.create("u1", name, 1, None).await;
            h.expect("u1", MessageType::Request).await;
            h.chunk("u1", b"x").await;
            h.expect("u1", MessageType::Request).await;
            h.done("u1").await;
            let msg = h.expect("u1", MessageType::Complete).await;
            let complete: CompleteEvent = msg.parse_payload().unwrap().unwrap();
            assert_eq!(complete.display_name, name);
        }
        assert_eq!(storage.opened().len(), 2);
    }

    #[tokio::test]
    async fn sessions_are_independent() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(options(), &storage);

        h.create("a", "a.txt", 1, None).await;
        h.expect("a", MessageType::Request).await;
        h.create("b", "b.txt", 1, None).await;
        h.expect("b", MessageType::Request).await;

        h.handle.abort("a").await.unwrap();
        h.expect("a", MessageType::Abort).await;

        h.chunk("b", b"x").await;
        h.expect("b", MessageType::Request).await;
        h.done("b").await;
        h.expect("b", MessageType::Complete).await;
    }

    #[tokio::test]
    async fn dropping_the_handle_aborts_streaming_sessions() {
        let storage = MemoryStorage::new();
        let mut h = Harness::with_memory(options(), &storage);

        h.create("u1", "a.txt", 3, None).await;
        h.expect("u1", MessageType::Request).await;

        let Harness {
            handle,
            mut peer,
            mut events,
            task,
        } = h;
        drop(handle);
        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .unwrap()
            .unwrap();

        // No abort message for a peer that is gone.
        assert!(peer.try_recv().is_err());
        let mut aborted = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, UploadEvent::Terminal(TerminalEvent::Aborted(_))) {
                aborted += 1;
            }
        }
        assert_eq!(aborted, 1);
        assert_eq!(storage.closed(), 1);
    }
}

//! Local observer surface.
//!
//! Observers see every event with full server-side detail (destination
//! paths included). What the peer sees is derived with `to_wire`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use sluice_protocol::messages::{AbortEvent, CompleteEvent};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::TransferError;

/// A session was admitted.
#[derive(Debug, Clone, PartialEq)]
pub struct StartEvent {
    pub id: String,
    /// Stored name.
    pub name: String,
    /// Declared size.
    pub size: u64,
    pub destination: PathBuf,
    pub guid: String,
    pub display_name: String,
    pub extension: String,
}

/// A chunk was written.
#[derive(Debug, Clone, PartialEq)]
pub struct ProgressEvent {
    pub id: String,
    /// Display name.
    pub name: String,
    pub size: u64,
    pub wrote: u64,
    pub destination: PathBuf,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompleteInfo {
    pub id: String,
    pub name: String,
    pub size: u64,
    pub wrote: u64,
    pub destination: PathBuf,
    pub mime: String,
    pub elapsed: Duration,
    pub guid: String,
    pub display_name: String,
    pub extension: String,
}

impl CompleteInfo {
    /// Peer-facing payload, without the destination path.
    pub fn to_wire(&self) -> CompleteEvent {
        CompleteEvent {
            name: self.name.clone(),
            size: self.size,
            wrote: self.wrote,
            mime: self.mime.clone(),
            estimated: self.elapsed.as_millis() as u64,
            guid: self.guid.clone(),
            display_name: self.display_name.clone(),
            extension: self.extension.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AbortInfo {
    pub id: String,
    /// Display name.
    pub name: String,
    pub size: u64,
    pub wrote: u64,
    pub destination: PathBuf,
}

impl AbortInfo {
    pub fn to_wire(&self) -> AbortEvent {
        AbortEvent {
            name: self.name.clone(),
            size: self.size,
            wrote: self.wrote,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ErrorInfo {
    pub id: String,
    pub error: Arc<TransferError>,
}

/// The single final outcome of a session (or of a rejected create).
#[derive(Debug, Clone)]
pub enum TerminalEvent {
    Completed(CompleteInfo),
    Aborted(AbortInfo),
    Errored(ErrorInfo),
}

impl TerminalEvent {
    pub fn id(&self) -> &str {
        match self {
            TerminalEvent::Completed(c) => &c.id,
            TerminalEvent::Aborted(a) => &a.id,
            TerminalEvent::Errored(e) => &e.id,
        }
    }
}

/// Receives upload notifications for host-process logic.
///
/// Called from the connection's control loop: implementations must not
/// block. Every method defaults to doing nothing.
pub trait UploadObserver: Send + Sync + 'static {
    /// The peer completed the capability sync.
    fn on_ready(&self) {}

    fn on_start(&self, _event: &StartEvent) {}

    fn on_progress(&self, _event: &ProgressEvent) {}

    /// Exactly once per session.
    fn on_terminal(&self, _event: &TerminalEvent) {}
}

/// Owned form of every observer callback.
#[derive(Debug, Clone)]
pub enum UploadEvent {
    Ready,
    Start(StartEvent),
    Stream(ProgressEvent),
    Terminal(TerminalEvent),
}

/// Forwards events into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<UploadEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<UploadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    fn forward(&self, event: UploadEvent) {
        // A dropped receiver just means nobody is listening any more.
        let _ = self.tx.send(event);
    }
}

impl UploadObserver for ChannelObserver {
    fn on_ready(&self) {
        self.forward(UploadEvent::Ready);
    }

    fn on_start(&self, event: &StartEvent) {
        self.forward(UploadEvent::Start(event.clone()));
    }

    fn on_progress(&self, event: &ProgressEvent) {
        self.forward(UploadEvent::Stream(event.clone()));
    }

    fn on_terminal(&self, event: &TerminalEvent) {
        self.forward(UploadEvent::Terminal(event.clone()));
    }
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Default)]
pub struct TracingObserver;

impl UploadObserver for TracingObserver {
    fn on_ready(&self) {
        info!("peer synced");
    }

    fn on_start(&self, e: &StartEvent) {
        info!(
            upload_id = %e.id,
            display_name = %e.display_name,
            size = e.size,
            destination = %e.destination.display(),
            "upload started"
        );
    }

    fn on_progress(&self, e: &ProgressEvent) {
        tracing::trace!(upload_id = %e.id, wrote = e.wrote, size = e.size, "upload progress");
    }

    fn on_terminal(&self, event: &TerminalEvent) {
        match event {
            TerminalEvent::Completed(c) => info!(
                upload_id = %c.id,
                wrote = c.wrote,
                mime = %c.mime,
                elapsed_ms = c.elapsed.as_millis() as u64,
                destination = %c.destination.display(),
                "upload complete"
            ),
            TerminalEvent::Aborted(a) => {
                info!(upload_id = %a.id, wrote = a.wrote, "upload aborted")
            }
            TerminalEvent::Errored(e) => {
                warn!(upload_id = %e.id, code = e.error.code(), "upload failed: {}", e.error)
            }
        }
    }
}

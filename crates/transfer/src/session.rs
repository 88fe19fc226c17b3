//! Per-file upload state.

use std::io;
use std::path::PathBuf;
use std::time::Instant;

use sluice_protocol::messages::CreateFileRequest;

use crate::TransferError;
use crate::events::{AbortInfo, CompleteInfo, ProgressEvent, StartEvent};
use crate::policy::AcceptancePolicy;
use crate::resolver::Naming;
use crate::sink::{Sink, WriteStatus};

/// Where the single chunk credit of a streaming session currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Credit {
    /// The peer holds a credit and may send one chunk.
    Outstanding,
    /// Waiting for the sink to drain before granting the next credit.
    AwaitingDrain,
    /// Waiting out the configured transmission delay.
    AwaitingDelay,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionState {
    /// Destination resolved; sink not yet opened.
    Admitted,
    Streaming(Credit),
    /// `done` received (or the transfer was skipped); finalization running.
    Completing,
}

/// Outcome of offering a chunk to a session.
pub(crate) enum Ingest {
    /// Late chunk for a completing session.
    Ignore,
    /// Chunk arrived without an outstanding credit.
    Violation,
    /// Abort was requested; the chunk was discarded.
    Abort,
    /// The chunk was refused and the session must fail.
    Reject(TransferError),
    Written {
        status: WriteStatus,
        progress: ProgressEvent,
    },
}

pub(crate) struct Session {
    pub id: String,
    /// Distinguishes this session from earlier ones that used the same id.
    pub epoch: u64,
    pub display_name: String,
    pub stored_name: String,
    pub guid: String,
    pub extension: String,
    pub declared_size: u64,
    pub bytes_written: u64,
    pub destination: PathBuf,
    pub sink: Option<Box<dyn Sink>>,
    pub abort_requested: bool,
    pub started_at: Instant,
    pub state: SessionState,
}

impl Session {
    pub fn new(
        id: String,
        epoch: u64,
        request: CreateFileRequest,
        naming: Naming,
        destination: PathBuf,
    ) -> Self {
        Self {
            id,
            epoch,
            display_name: request.name,
            stored_name: naming.stored_name,
            guid: naming.guid,
            extension: naming.extension,
            declared_size: request.size,
            bytes_written: 0,
            destination,
            sink: None,
            abort_requested: false,
            started_at: Instant::now(),
            state: SessionState::Admitted,
        }
    }

    /// True while the next credit is being held back.
    pub fn is_suspended(&self) -> bool {
        matches!(
            self.state,
            SessionState::Streaming(Credit::AwaitingDrain | Credit::AwaitingDelay)
        )
    }

    /// Applies one chunk.
    ///
    /// The size limit is checked before the write, so an overflowing chunk
    /// is refused whole and `bytes_written` never passes the limit.
    pub fn ingest(&mut self, data: Vec<u8>, policy: &AcceptancePolicy) -> Ingest {
        if self.state == SessionState::Completing {
            return Ingest::Ignore;
        }
        if self.abort_requested {
            return Ingest::Abort;
        }
        if self.state != SessionState::Streaming(Credit::Outstanding) {
            return Ingest::Violation;
        }

        let total = match policy.check_size(self.bytes_written, data.len()) {
            Ok(total) => total,
            Err(e) => return Ingest::Reject(e),
        };
        let Some(sink) = self.sink.as_mut() else {
            return Ingest::Reject(io::Error::other("sink already released").into());
        };

        match sink.write(data) {
            Ok(status) => {
                self.bytes_written = total;
                Ingest::Written {
                    status,
                    progress: self.progress_event(),
                }
            }
            Err(e) => Ingest::Reject(e),
        }
    }

    pub fn start_event(&self) -> StartEvent {
        StartEvent {
            id: self.id.clone(),
            name: self.stored_name.clone(),
            size: self.declared_size,
            destination: self.destination.clone(),
            guid: self.guid.clone(),
            display_name: self.display_name.clone(),
            extension: self.extension.clone(),
        }
    }

    pub fn progress_event(&self) -> ProgressEvent {
        ProgressEvent {
            id: self.id.clone(),
            name: self.display_name.clone(),
            size: self.declared_size,
            wrote: self.bytes_written,
            destination: self.destination.clone(),
        }
    }

    pub fn abort_info(&self) -> AbortInfo {
        AbortInfo {
            id: self.id.clone(),
            name: self.display_name.clone(),
            size: self.declared_size,
            wrote: self.bytes_written,
            destination: self.destination.clone(),
        }
    }

    pub fn complete_info(&self, mime: String) -> CompleteInfo {
        CompleteInfo {
            id: self.id.clone(),
            name: self.stored_name.clone(),
            size: self.declared_size,
            wrote: self.bytes_written,
            destination: self.destination.clone(),
            mime,
            elapsed: self.started_at.elapsed(),
            guid: self.guid.clone(),
            display_name: self.display_name.clone(),
            extension: self.extension.clone(),
        }
    }
}

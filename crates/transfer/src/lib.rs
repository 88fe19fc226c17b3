//! Chunked-upload sessions with admission control, flow control,
//! abortability and post-transfer validation.
//!
//! The crate is transport-agnostic: a [`Controller`] is driven by
//! [`Command`]s decoded from one peer connection and answers through a
//! [`PeerLink`]. Host-process logic observes uploads through an
//! [`UploadObserver`].

mod controller;
mod events;
mod mime;
mod options;
mod policy;
mod registry;
mod resolver;
mod session;
mod sink;
mod validation;

#[cfg(test)]
mod testsupport;

pub use controller::{
    COMMAND_BUFFER_SIZE, Command, Controller, ControllerClosed, ControllerHandle, PeerLink,
    UploadContext,
};
pub use events::{
    AbortInfo, ChannelObserver, CompleteInfo, ErrorInfo, ProgressEvent, StartEvent,
    TerminalEvent, TracingObserver, UploadEvent, UploadObserver,
};
pub use mime::{MimeResolver, SniffingMimeResolver};
pub use options::{DEFAULT_HIGH_WATER_MARK, Destinations, RenamePolicy, UploadOptions};
pub use policy::AcceptancePolicy;
pub use registry::SessionRegistry;
pub use resolver::{Naming, resolve_destination};
pub use sink::{FileSink, FileStorage, Sink, SinkFuture, Storage, WriteStatus};
pub use validation::validate_stored_name;

use sluice_protocol::constants::{
    WS_ERR_CODE_BAD_REQUEST, WS_ERR_CODE_CONFLICT, WS_ERR_CODE_INTERNAL,
    WS_ERR_CODE_NOT_ACCEPTED, WS_ERR_CODE_NOT_FOUND, WS_ERR_CODE_TOO_LARGE,
};

/// Errors produced by the transfer crate.
///
/// Every variant is fatal to the session it concerns.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("destination must be specified when multiple destinations are configured")]
    DestinationNotConfigured,

    #[error("destination {0} does not exist")]
    DestinationUnknown(String),

    #[error("uploading file size exceeded max file size {limit} byte(s)")]
    SizeExceeded { limit: u64 },

    #[error(
        "not acceptable file type {mime} of {name}, type must be one of these: {}",
        .accepts.join(", ")
    )]
    TypeNotAccepted {
        mime: String,
        name: String,
        accepts: Vec<String>,
    },

    #[error("sink I/O error: {0}")]
    SinkIo(#[from] std::io::Error),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("chunk received without an outstanding request: {0}")]
    UnexpectedChunk(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("invalid options: {0}")]
    InvalidOptions(String),
}

impl TransferError {
    /// Wire error code reported to the peer.
    pub fn code(&self) -> i32 {
        match self {
            TransferError::DestinationNotConfigured
            | TransferError::UnexpectedChunk(_)
            | TransferError::InvalidOptions(_) => WS_ERR_CODE_BAD_REQUEST,
            TransferError::DestinationUnknown(_) => WS_ERR_CODE_NOT_FOUND,
            TransferError::SizeExceeded { .. } => WS_ERR_CODE_TOO_LARGE,
            TransferError::TypeNotAccepted { .. } => WS_ERR_CODE_NOT_ACCEPTED,
            TransferError::AlreadyExists(_) => WS_ERR_CODE_CONFLICT,
            TransferError::SinkIo(_) | TransferError::InvalidPath(_) => WS_ERR_CODE_INTERNAL,
        }
    }
}

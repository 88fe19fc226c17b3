//! WebSocket upload server.
//!
//! Accepts any number of peer connections, decodes JSON and binary
//! frames into upload commands and runs one upload controller per
//! connection, with ping/pong keep-alive and graceful shutdown.

mod binary;
mod connection;
mod server;

pub use binary::{ChunkHeader, ParseError, encode_chunk_frame, parse_chunk_frame};
pub use server::{ServerConfig, UploadServer};

/// Send buffer capacity per connection.
///
/// Every chunk is answered with at most one message, so this only fills
/// up when many sessions share a slow connection.
pub const SEND_BUFFER_SIZE: usize = 2048;

/// Errors produced by the upload server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid upload options: {0}")]
    Options(#[from] sluice_transfer::TransferError),
}

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Time to wait for a pong response (or any incoming message).
///
/// Acts as a read deadline: if nothing arrives within this window the
/// connection is considered dead. Kept generous so a peer that is busy
/// reading a large file between chunks is not dropped.
pub const WS_PONG_WAIT: Duration = Duration::from_secs(60);

/// How often the server pings the peer.
pub const WS_PING_PERIOD: Duration = Duration::from_secs(5);

/// Maximum message size in bytes (50 MB).
pub const WS_MAX_MESSAGE_SIZE: usize = 50 * 1024 * 1024;

/// Default advisory chunk size announced to peers (10 KiB).
pub const DEFAULT_CHUNK_SIZE: usize = 10 * 1024;

/// WebSocket message type identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    // Connection setup
    #[serde(rename = "req_sync")]
    ReqSync,
    #[serde(rename = "sync")]
    Sync,

    // Session control from the peer
    #[serde(rename = "create_file")]
    CreateFile,
    #[serde(rename = "stream")]
    Stream,
    #[serde(rename = "done")]
    Done,
    #[serde(rename = "abort")]
    Abort,

    // Session control from the server
    #[serde(rename = "request")]
    Request,
    #[serde(rename = "complete")]
    Complete,
    #[serde(rename = "error")]
    Error,

    /// Forward compatibility: unknown message types deserialize here.
    #[serde(other)]
    Unknown,
}

/// Common WebSocket error codes.
pub const WS_ERR_CODE_BAD_REQUEST: i32 = 400;
pub const WS_ERR_CODE_NOT_FOUND: i32 = 404;
pub const WS_ERR_CODE_NOT_ACCEPTED: i32 = 406;
pub const WS_ERR_CODE_CONFLICT: i32 = 409;
pub const WS_ERR_CODE_TOO_LARGE: i32 = 413;
pub const WS_ERR_CODE_INTERNAL: i32 = 500;
pub const WS_ERR_CODE_NOT_IMPLEMENTED: i32 = 501;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Announces a new upload. The session id travels in the envelope `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateFileRequest {
    /// Display name chosen by the peer. Never used to build a path.
    pub name: String,
    /// Peer-claimed total size in bytes (untrusted).
    #[serde(default)]
    pub size: u64,
    /// Destination key, required when several destinations are configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_to: Option<String>,
}

// ---------------------------------------------------------------------------
// Response / event payloads
// ---------------------------------------------------------------------------

/// Capability announcement sent in reply to `req_sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_file_size: Option<u64>,
    #[serde(default)]
    pub accepts: Vec<String>,
    pub chunk_size: usize,
    /// Milliseconds the server waits before granting the next chunk.
    pub transmission_delay: u64,
}

/// Successful end of an upload, as seen by the peer.
///
/// The server-side destination path is deliberately absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteEvent {
    /// Stored (server-generated) file name.
    pub name: String,
    /// Size the peer declared at creation.
    pub size: u64,
    /// Bytes actually written.
    pub wrote: u64,
    pub mime: String,
    /// Elapsed time between admission and completion, in milliseconds.
    pub estimated: u64,
    pub guid: String,
    pub display_name: String,
    pub extension: String,
}

/// Aborted upload, as seen by the peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbortEvent {
    /// Display name from the create request.
    pub name: String,
    pub size: u64,
    /// Last known number of bytes written before the abort.
    pub wrote: u64,
}

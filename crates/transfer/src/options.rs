use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use sluice_protocol::constants::DEFAULT_CHUNK_SIZE;
use sluice_protocol::messages::SyncResponse;

use crate::TransferError;

/// Buffered bytes at which a sink starts reporting back-pressure (16 KiB).
pub const DEFAULT_HIGH_WATER_MARK: usize = 16 * 1024;

/// How the stored file name is derived from the server-generated name.
#[derive(Clone, Default)]
pub enum RenamePolicy {
    /// Store under the generated name.
    #[default]
    Identity,
    /// Store every upload under the same fixed name.
    Static(String),
    /// `{name}` is replaced by the generated name.
    Template(String),
    /// Arbitrary pure function of the generated name.
    Function(Arc<dyn Fn(&str) -> String + Send + Sync>),
}

impl RenamePolicy {
    /// Applies the policy to a generated name.
    pub fn apply(&self, generated: &str) -> String {
        match self {
            RenamePolicy::Identity => generated.to_string(),
            RenamePolicy::Static(name) => name.clone(),
            RenamePolicy::Template(template) => template.replace("{name}", generated),
            RenamePolicy::Function(f) => f(generated),
        }
    }
}

impl fmt::Debug for RenamePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenamePolicy::Identity => f.write_str("Identity"),
            RenamePolicy::Static(name) => f.debug_tuple("Static").field(name).finish(),
            RenamePolicy::Template(t) => f.debug_tuple("Template").field(t).finish(),
            RenamePolicy::Function(_) => f.write_str("Function(..)"),
        }
    }
}

/// Configured upload destination(s).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destinations {
    /// One directory; create requests need no key.
    Single(PathBuf),
    /// Directories addressed by a logical key; create requests must name one.
    Keyed(BTreeMap<String, PathBuf>),
}

impl Destinations {
    /// All configured directories.
    pub fn dirs(&self) -> Vec<&Path> {
        match self {
            Destinations::Single(dir) => vec![dir.as_path()],
            Destinations::Keyed(map) => map.values().map(PathBuf::as_path).collect(),
        }
    }
}

/// Server-side upload configuration, shared by every connection.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Hard limit on bytes written per session (`None` = unlimited).
    pub max_file_size: Option<u64>,
    /// MIME allow-list; empty accepts everything.
    pub accepts: Vec<String>,
    /// Advisory chunk size announced to peers; peers enforce it.
    pub chunk_size: usize,
    /// Fixed pause before granting the next chunk, to throttle peers.
    pub transmission_delay: Duration,
    /// Replace existing files instead of completing immediately.
    pub overwrite: bool,
    pub rename: RenamePolicy,
    pub destinations: Destinations,
    pub sink_high_water_mark: usize,
}

impl UploadOptions {
    /// Creates options with defaults for everything except the destinations.
    pub fn new(destinations: Destinations) -> Self {
        Self {
            max_file_size: None,
            accepts: Vec::new(),
            chunk_size: DEFAULT_CHUNK_SIZE,
            transmission_delay: Duration::ZERO,
            overwrite: false,
            rename: RenamePolicy::Identity,
            destinations,
            sink_high_water_mark: DEFAULT_HIGH_WATER_MARK,
        }
    }

    /// Rejects configurations no session could work with.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.chunk_size == 0 {
            return Err(TransferError::InvalidOptions(
                "chunk size must be positive".into(),
            ));
        }
        if self.sink_high_water_mark == 0 {
            return Err(TransferError::InvalidOptions(
                "sink high-water mark must be positive".into(),
            ));
        }
        match &self.destinations {
            Destinations::Single(dir) if dir.as_os_str().is_empty() => Err(
                TransferError::InvalidOptions("no upload directory specified".into()),
            ),
            Destinations::Keyed(map) if map.is_empty() => Err(TransferError::InvalidOptions(
                "destination map is empty".into(),
            )),
            Destinations::Keyed(map) => match map.iter().find(|(k, _)| k.is_empty()) {
                Some(_) => Err(TransferError::InvalidOptions(
                    "destination keys must not be empty".into(),
                )),
                None => Ok(()),
            },
            Destinations::Single(_) => Ok(()),
        }
    }

    /// The capability announcement sent in reply to `req_sync`.
    pub fn sync_response(&self) -> SyncResponse {
        SyncResponse {
            max_file_size: self.max_file_size,
            accepts: self.accepts.clone(),
            chunk_size: self.chunk_size,
            transmission_delay: self.transmission_delay.as_millis() as u64,
        }
    }
}

//! Sink binding: from a create request to a concrete destination path.

use std::path::PathBuf;

use crate::options::{Destinations, RenamePolicy};
use crate::{TransferError, validate_stored_name};

/// Server-side naming for one upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    /// Generated unique base name (UUID v4).
    pub guid: String,
    /// Name the artifact is stored under (`rename` applied to `guid`).
    pub stored_name: String,
    /// Text after the last `.` of the display name (the whole name if none).
    pub extension: String,
}

impl Naming {
    /// Generates a fresh unique name for an upload.
    pub fn generate(display_name: &str, rename: &RenamePolicy) -> Self {
        Self::with_guid(uuid::Uuid::new_v4().to_string(), display_name, rename)
    }

    fn with_guid(guid: String, display_name: &str, rename: &RenamePolicy) -> Self {
        let stored_name = rename.apply(&guid);
        let extension = display_name
            .rsplit('.')
            .next()
            .unwrap_or(display_name)
            .to_string();
        Self {
            guid,
            stored_name,
            extension,
        }
    }
}

/// Resolves the destination path for a stored name.
///
/// A key is required (and must be configured) only when destinations are
/// keyed; an empty key counts as no key. Pure: the directory is expected
/// to have been provisioned at startup.
pub fn resolve_destination(
    destinations: &Destinations,
    key: Option<&str>,
    stored_name: &str,
) -> Result<PathBuf, TransferError> {
    validate_stored_name(stored_name)?;

    match destinations {
        Destinations::Single(dir) => Ok(dir.join(stored_name)),
        Destinations::Keyed(map) => {
            let key = key
                .filter(|k| !k.is_empty())
                .ok_or(TransferError::DestinationNotConfigured)?;
            map.get(key)
                .map(|dir| dir.join(stored_name))
                .ok_or_else(|| TransferError::DestinationUnknown(key.to_string()))
        }
    }
}

use std::path::{Component, Path};

use crate::TransferError;

/// Validates that a stored file name is a single plain path component.
///
/// Stored names come from the rename policy and are joined onto a
/// provisioned destination directory, so anything that would leave that
/// directory, or need a subdirectory created per session, is rejected:
/// - Empty names
/// - Absolute paths (Unix `/` or Windows `C:\`)
/// - Parent (`..`) or current (`.`) directory components
/// - More than one component
pub fn validate_stored_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidPath("empty name".into()));
    }

    let path = Path::new(name);

    if path.is_absolute() {
        return Err(TransferError::InvalidPath(format!(
            "absolute path not allowed: {name}"
        )));
    }

    let mut components = path.components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) | (_, Some(Component::ParentDir)) => Err(
            TransferError::InvalidPath(format!("parent directory traversal not allowed: {name}")),
        ),
        (Some(Component::Prefix(_)), _) => Err(TransferError::InvalidPath(format!(
            "path prefix not allowed: {name}"
        ))),
        _ => Err(TransferError::InvalidPath(format!(
            "name must be a single path component: {name}"
        ))),
    }
}

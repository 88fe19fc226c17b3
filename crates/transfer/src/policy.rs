use crate::TransferError;
use crate::options::UploadOptions;

/// Size and MIME acceptance rules.
///
/// The size rule is checked before every write, so an overflowing chunk is
/// rejected whole. The MIME rule runs once, after the artifact is closed.
#[derive(Debug, Clone, Default)]
pub struct AcceptancePolicy {
    max_file_size: Option<u64>,
    accepts: Vec<String>,
}

impl AcceptancePolicy {
    pub fn new(max_file_size: Option<u64>, accepts: Vec<String>) -> Self {
        Self {
            max_file_size,
            accepts,
        }
    }

    pub fn from_options(options: &UploadOptions) -> Self {
        Self::new(options.max_file_size, options.accepts.clone())
    }

    /// Returns the byte count after accepting `incoming` more bytes.
    pub fn check_size(&self, written: u64, incoming: usize) -> Result<u64, TransferError> {
        let total = written.saturating_add(incoming as u64);
        match self.max_file_size {
            Some(limit) if total > limit => Err(TransferError::SizeExceeded { limit }),
            _ => Ok(total),
        }
    }

    /// Checks a resolved MIME type against the allow-list.
    ///
    /// `name` is only used for the error message.
    pub fn check_type(&self, mime: &str, name: &str) -> Result<(), TransferError> {
        if self.accepts.is_empty() || self.accepts.iter().any(|a| a == mime) {
            return Ok(());
        }
        Err(TransferError::TypeNotAccepted {
            mime: mime.to_string(),
            name: name.to_string(),
            accepts: self.accepts.clone(),
        })
    }
}

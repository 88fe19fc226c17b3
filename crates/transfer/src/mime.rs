use std::path::Path;

use tokio::io::AsyncReadExt;

use crate::sink::SinkFuture;

/// Fallback when nothing better is known.
pub const OCTET_STREAM: &str = "application/octet-stream";

/// Bytes read from the head of an artifact for content sniffing.
const SNIFF_LEN: usize = 8192;

/// Resolves the MIME type of a stored artifact.
pub trait MimeResolver: Send + Sync + 'static {
    /// `display_name` is the peer's original file name, used as a hint only.
    fn resolve<'a>(&'a self, path: &'a Path, display_name: &'a str) -> SinkFuture<'a, String>;
}

/// Magic-byte sniffing first, then the display name's extension.
/// The stored name is not consulted.
#[derive(Debug, Clone, Default)]
pub struct SniffingMimeResolver;

impl SniffingMimeResolver {
    pub fn new() -> Self {
        Self
    }

    fn from_display_name(display_name: &str) -> String {
        mime_guess::from_path(display_name)
            .first_raw()
            .unwrap_or(OCTET_STREAM)
            .to_string()
    }
}

impl MimeResolver for SniffingMimeResolver {
    fn resolve<'a>(&'a self, path: &'a Path, display_name: &'a str) -> SinkFuture<'a, String> {
        Box::pin(async move {
            match read_head(path).await {
                Ok(head) => match infer::get(&head) {
                    Some(kind) => kind.mime_type().to_string(),
                    None => Self::from_display_name(display_name),
                },
                Err(e) => {
                    tracing::warn!(path = %path.display(), "cannot read artifact for sniffing: {e}");
                    Self::from_display_name(display_name)
                }
            }
        })
    }
}

async fn read_head(path: &Path) -> std::io::Result<Vec<u8>> {
    let file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SNIFF_LEN);
    file.take(SNIFF_LEN as u64).read_to_end(&mut head).await?;
    Ok(head)
}

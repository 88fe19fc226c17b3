//! Wire protocol types for sluice peer/server communication.

pub mod constants;
pub mod envelope;
pub mod messages;

// Re-export primary types for convenience.
pub use constants::MessageType;
pub use envelope::{Message, WsError};
pub use messages::{AbortEvent, CompleteEvent, CreateFileRequest, SyncResponse};

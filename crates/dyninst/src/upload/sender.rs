#![forbid(unsafe_code)]

use async_trait::async_trait;
use bytes::Bytes;

/// Delivers one batch of opaque, pre-serialized items. Called concurrently
/// for different batches.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn send(&self, items: &[Bytes]) -> Result<(), SendError>;
}

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("batch rejected with status {status}")]
    Rejected { status: u16 },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

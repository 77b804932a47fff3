//! Consumer multiplexer interface.
//!
//! The multiplexer merges every partition the container has subscribed to
//! behind a single `choose` call. The run loop is its only caller.

use async_trait::async_trait;

use crate::envelope::Envelope;

/// Failure surfaced by the multiplexer. Fatal to the run loop.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct MuxError {
    pub message: String,
}

impl MuxError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Shared fetch source across all subscribed partitions.
#[async_trait]
pub trait ConsumerMux: Send + Sync {
    /// Returns the next available envelope, or `None` when nothing is
    /// available. With `block` set, the implementation may wait a bounded
    /// time for a message before giving up. Called only from the run loop
    /// task.
    async fn choose(&self, block: bool) -> Result<Option<Envelope>, MuxError>;
}

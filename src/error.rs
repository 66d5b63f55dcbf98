//! Shared error taxonomy for every component in this crate.

use std::io;

use thiserror::Error;

/// Convenience alias for functions that return [`SinkError`].
pub type SinkResult<T> = Result<T, SinkError>;

/// Errors that may be produced by any component in this crate.
///
/// Every component shares one error type, organized by error category
/// rather than by component, so callers can match on a single enum
/// regardless of which writer they're holding.
#[non_exhaustive]
#[derive(Error, Debug, Clone)]
pub enum SinkError {
    /// A write, flush, or close was attempted after the stream was closed.
    #[error("stream is already closed")]
    AlreadyClosed,

    /// Failed to hand a message to a background worker.
    #[error("failed to send over channel")]
    ChannelSend,

    /// A background worker's channel disconnected while awaiting a reply.
    #[error("failed to receive over channel")]
    ChannelReceive,

    /// A blocked producer was cancelled.
    #[error("operation interrupted while blocked")]
    Interrupted,

    /// The operation is deliberately unsupported by this adapter.
    #[error("operation not supported")]
    Unsupported,

    /// A write whose length is too large for the striped writer's stripe
    /// buffer capacity.
    #[error("write of {0} bytes exceeds stripe buffer capacity")]
    WriteTooLarge(usize),

    /// Compression failed inside a worker thread.
    #[error("compression failed: {0}")]
    CompressionFailed(String),

    /// The downstream sink raised an I/O error.
    #[error("sink I/O error: {0}")]
    Io(String),
}

impl From<io::Error> for SinkError {
    fn from(e: io::Error) -> Self {
        SinkError::Io(e.to_string())
    }
}

impl From<SinkError> for io::Error {
    fn from(e: SinkError) -> Self {
        match e {
            SinkError::Io(msg) => io::Error::other(msg),
            other => io::Error::other(other.to_string()),
        }
    }
}

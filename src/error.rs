//! Error types for modlink.

use thiserror::Error;

/// Main error type for all modlink operations.
#[derive(Debug, Error)]
pub enum ModlinkError {
    /// I/O error on the serial byte stream.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error while loading configuration.
    #[error("config error: {0}")]
    Config(#[from] serde_json::Error),

    /// Frame capacity exceeded; the frame has been cleared.
    #[error("frame capacity of {limit} bytes exceeded")]
    FrameOverflow {
        /// Capacity of the frame that overflowed.
        limit: usize,
    },

    /// A run between zero bytes was too long to COBS-encode.
    #[error("COBS overflow")]
    CobsOverflow,

    /// COBS stream corruption (literal zero byte or counter underflow).
    #[error("COBS corruption: {0}")]
    CobsCorrupt(&'static str),

    /// Transient overload: the claimed resource is exhausted, retry later.
    ///
    /// This is the designed-for backpressure signal, not a fault. Callers
    /// are expected to back off and retry; nothing is queued on their
    /// behalf.
    #[error("backoff: too many concurrent requests in flight")]
    Backoff,

    /// Release of a transfer-ID slot that is not currently claimed.
    #[error("transfer ID slot is not claimed")]
    Unclaimed,

    /// Submission could not be handed to the link within the timeout.
    #[error("submit timeout")]
    SubmitTimeout,

    /// The link channels have shut down.
    #[error("link closed")]
    LinkClosed,

    /// Protocol violation (malformed frame, unsupported command, ...).
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Dictionary codec contract violation (unordered keys, bad command,
    /// unsupported type).
    #[error("dictionary codec error: {0}")]
    Codec(String),
}

/// Result type alias using ModlinkError.
pub type Result<T> = std::result::Result<T, ModlinkError>;

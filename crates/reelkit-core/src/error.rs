// crates/reelkit-core/src/error.rs
//
// The error surface shared by readers, the I/O manager, and the engine.
// Clone is required: errors travel through shared futures, and every
// waiter joined on a coalesced request receives its own copy.

use thiserror::Error;

#[derive(Clone, Debug, Error, PartialEq)]
pub enum IoError {
    /// No plugin accepts the path's extension.
    #[error("no plugin found for \"{path}\"")]
    NotFound { path: String },

    /// The plugin refused to open the source, or the header did not parse.
    #[error("cannot open \"{path}\": {reason}")]
    OpenFailed { path: String, reason: String },

    /// A single frame or block failed to decode; other requests against
    /// the same reader may still succeed.
    #[error("decode failed for \"{path}\": {reason}")]
    DecodeFailed { path: String, reason: String },

    /// The request was dropped by `cancel_requests` or engine shutdown.
    #[error("request cancelled")]
    Cancelled,

    /// Admission or decode exceeded the configured deadline.
    #[error("request timed out")]
    Timeout,

    /// Composition time outside `[global_start, global_start + duration)`.
    #[error("time {value}/{rate} is outside the composition")]
    OutOfRange { value: f64, rate: f64 },

    /// The request arrived after the reader was stopped.
    #[error("reader is stopped")]
    ReaderClosed,
}

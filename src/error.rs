//! Error types used throughout the crate.
//!
//! Mirrors the `Result`/`Error` split the communication layer has always
//! used: callers match on [`Error`] variants instead of downcasting a
//! boxed `dyn std::error::Error`.

use std::time::Duration;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type returned by wire, peer, dispatcher and supervisor
/// operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A frame violated the wire format: oversized length prefix, a short
    /// read that never completed, or a decoder rejecting a known tag.
    #[error("framing error: {0}")]
    Framing(String),

    /// The message tag byte did not match any known chain message.
    #[error("unknown message type tag {0}")]
    UnknownTag(u8),

    /// Underlying socket I/O failed.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// `Dial` could not establish a connection within the configured
    /// timeout.
    #[error("dial to {address} timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    /// A write did not complete atomically (short write, or the
    /// connection was already closed).
    #[error("write error: {0}")]
    Write(String),

    /// `NewClient` was given an invalid configuration.
    #[error("bad configuration: {0}")]
    Config(String),

    /// The peer's read task observed the end of the stream. Treated as an
    /// expected lifecycle event upstream, but still surfaced as an error
    /// so the supervisor can redial.
    #[error("peer connection closed")]
    EndOfStream,

    /// The peer's read task unwound (panicked) before it could report a
    /// normal error.
    #[error("peer read task panicked")]
    TaskPanicked,

    /// The block store rejected or failed to apply a block.
    #[error("block store error: {0}")]
    Store(String),
}

impl Error {
    pub(crate) fn framing<M: Into<String>>(msg: M) -> Self {
        Error::Framing(msg.into())
    }
}

//! Error kinds shared across the coordination core.
//!
//! The set is closed: every fallible operation in this crate maps onto one of
//! these variants. Connection-level failures distinguish `Closed` (the peer
//! or our own shutdown tore the connection down) from `Timeout` (the peer is
//! still there but a reply never arrived), because callers react differently:
//! a closed session is dropped, a timed-out request may be retried on the
//! next sync round.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Error kinds for the coordination core.
#[derive(Debug, Error)]
pub enum Error {
    /// Generic failure with context.
    #[error("{0}")]
    Failed(String),

    /// The connection was closed before or during the operation.
    #[error("connection closed")]
    Closed,

    /// A request/response exchange did not complete in time.
    #[error("request timed out")]
    Timeout,

    /// Handshake version does not match ours.
    #[error("invalid protocol version {got}, expected {expected}")]
    InvalidVersion { got: u32, expected: u32 },

    /// A frame or payload could not be decoded.
    #[error("invalid message: {0}")]
    InvalidMessage(String),

    /// Underlying storage failure. Cursors and state are unchanged.
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn failed(msg: impl Into<String>) -> Self {
        Error::Failed(msg.into())
    }

    pub fn invalid_message(msg: impl Into<String>) -> Self {
        Error::InvalidMessage(msg.into())
    }
}

//! Failures reported back to a single client.
//!
//! None of these stop the server or affect other connections. The `Display`
//! text of each variant is exactly what goes into the `error` field of a
//! `KO` reply.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestError {
    /// `unlock` for a key the connection does not currently hold.
    #[error("no such lock held")]
    NoSuchLock,

    /// `set`/`incr` argument is not a signed 64-bit decimal integer.
    #[error("invalid number")]
    InvalidNumber,

    /// `incr` would push the counter outside the i64 range.
    #[error("integer overflow")]
    Overflow,

    #[error("unknown operation")]
    UnknownOperation,

    /// The inbound record could not be decoded; the connection is closed
    /// right after this reply.
    #[error("malformed request")]
    Malformed,
}

/// The serializer task is gone, so nothing can be enqueued any more.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("lock core has stopped")]
pub struct CoreStopped;

//! Error types for jstream encoding and decoding.

use std::io;

use crate::element::Kind;

/// Alias for `Result<T, jstream::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by jstream readers and writers.
///
/// [`Error::EndOfStream`] and [`Error::Canceled`] are terminal conditions of
/// a single stream, not connection failures: after draining the element that
/// produced them, the parent reader and the connection itself remain usable.
/// A reader that returned [`Error::Io`], [`Error::Json`], or
/// [`Error::MalformedElement`] must be treated as unusable.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// A stream reached its normal end: the `{"streamEnd":true}` tail on a
    /// nested stream, or end-of-data on the outermost connection.
    #[error("end of stream")]
    EndOfStream,

    /// The sender terminated a byte blob or stream early, in-band. Data
    /// delivered before this point is incomplete.
    #[error("canceled by the sender")]
    Canceled,

    /// A kind-specific accessor was called on an element of another kind.
    #[error("expected a {expected} element, found {actual}")]
    WrongKind {
        /// The kind the accessor is valid for.
        expected: Kind,
        /// The kind the element actually has.
        actual: Kind,
    },

    /// `bytes()` or `stream()` was called a second time on the same element.
    #[error("element body already consumed")]
    AlreadyConsumed,

    /// A head record matched none of the recognized element shapes.
    #[error("head record matches no known element kind")]
    MalformedElement,

    /// An error from the underlying byte connection.
    #[error(transparent)]
    Io(#[from] io::Error),

    /// Invalid JSON in a head record or value payload.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Recovers an [`Error`] that was wrapped into an [`io::Error`] by a
    /// [`Read`](io::Read) adapter such as
    /// [`BlobReader`](crate::BlobReader).
    ///
    /// Any other I/O error is returned as [`Error::Io`].
    pub fn from_io(err: io::Error) -> Self {
        match err.downcast::<Self>() {
            Ok(inner) => inner,
            Err(other) => Self::Io(other),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(io) => io,
            other => Self::other(other),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_round_trip_preserves_kind() {
        let io_err: io::Error = Error::Canceled.into();
        assert!(matches!(Error::from_io(io_err), Error::Canceled));
    }

    #[test]
    fn plain_io_error_stays_io() {
        let io_err = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        match Error::from_io(io_err) {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::BrokenPipe),
            other => panic!("expected Io, got {other:?}"),
        }
    }
}

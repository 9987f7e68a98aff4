//! Decoded elements and their body accessors.

use std::fmt;
use std::io::{self, Read};

use serde::de::DeserializeOwned;
use serde_json::value::RawValue;

use crate::error::{Error, Result};
use crate::reader::StreamReader;

/// The kind of a decoded element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    /// A discrete JSON value, carried whole in the head record.
    Value,
    /// A byte blob of unbounded size, streamed after the head.
    Bytes,
    /// A nested stream of further elements.
    Stream,
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Value => "value",
            Self::Bytes => "bytes",
            Self::Stream => "stream",
        })
    }
}

/// What the head record declared, tracked per element.
pub(crate) enum Payload {
    /// Raw JSON payload, captured when the head was decoded.
    Value(Box<RawValue>),
    /// A blob body waiting on the connection.
    Bytes {
        /// Advisory byte-length estimate from the head.
        size_hint: Option<u64>,
        /// Set once the body has been handed out or discarded.
        taken: bool,
    },
    /// A nested stream waiting on the connection.
    Stream {
        /// Advisory element-count estimate from the head.
        size_hint: Option<u64>,
        /// Set once the child reader has been handed out or discarded.
        taken: bool,
    },
}

/// One decoded element, borrowed from its [`StreamReader`].
///
/// The element mutably borrows the reader that produced it, so the next
/// element cannot be requested while this one is alive — the protocol's
/// fully-drain-before-next rule, enforced by the borrow checker. A byte blob
/// or nested stream left partially consumed when the element is dropped is
/// drained off the connection by the reader's next [`next()`] call, keeping
/// the framing intact.
///
/// [`next()`]: StreamReader::next
pub struct Element<'r, R: Read> {
    /// The reader this element was decoded from.
    owner: &'r mut StreamReader<R>,
    /// The declared kind and its pending body, if any.
    payload: Payload,
}

impl<'r, R: Read> Element<'r, R> {
    pub(crate) fn new(owner: &'r mut StreamReader<R>, payload: Payload) -> Self {
        Self { owner, payload }
    }

    /// The element's kind.
    pub fn kind(&self) -> Kind {
        match self.payload {
            Payload::Value(_) => Kind::Value,
            Payload::Bytes { .. } => Kind::Bytes,
            Payload::Stream { .. } => Kind::Stream,
        }
    }

    /// The advisory size hint from the head record, if the sender gave one.
    ///
    /// Estimates the byte length of a blob or the element count of a nested
    /// stream. Never authoritative.
    pub fn size_hint(&self) -> Option<u64> {
        match self.payload {
            Payload::Value(_) => None,
            Payload::Bytes { size_hint, .. } | Payload::Stream { size_hint, .. } => size_hint,
        }
    }

    /// The raw, not-yet-parsed JSON payload of a value element.
    pub fn raw(&self) -> Result<&RawValue> {
        match &self.payload {
            Payload::Value(raw) => Ok(raw),
            _ => Err(Error::WrongKind {
                expected: Kind::Value,
                actual: self.kind(),
            }),
        }
    }

    /// Deserializes the payload of a value element.
    ///
    /// May be called any number of times; the raw payload is retained.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(self.raw()?.get()).map_err(Error::Json)
    }

    /// The body of a bytes element, as a streaming reader.
    ///
    /// Callable at most once. The returned reader yields the decoded blob
    /// bytes; it reports clean end-of-data when the sender finished the blob
    /// and an [`Error::Canceled`]-carrying I/O error when the sender
    /// canceled it, never a silent truncation.
    pub fn bytes(&mut self) -> Result<BlobReader<'_, R>> {
        match &mut self.payload {
            Payload::Bytes { taken, .. } => {
                if *taken {
                    return Err(Error::AlreadyConsumed);
                }
                *taken = true;
                Ok(BlobReader {
                    owner: &mut *self.owner,
                    done: None,
                })
            }
            _ => Err(Error::WrongKind {
                expected: Kind::Bytes,
                actual: self.kind(),
            }),
        }
    }

    /// The body of a stream element, as a nested [`StreamReader`].
    ///
    /// Callable at most once. The child reader produces the nested elements
    /// and then reports [`Error::EndOfStream`] or [`Error::Canceled`];
    /// neither invalidates the parent.
    pub fn stream(&mut self) -> Result<&mut StreamReader<R>> {
        match &mut self.payload {
            Payload::Stream { taken, .. } => {
                if *taken {
                    return Err(Error::AlreadyConsumed);
                }
                *taken = true;
                Ok(self.owner.child_mut())
            }
            _ => Err(Error::WrongKind {
                expected: Kind::Stream,
                actual: self.kind(),
            }),
        }
    }

    /// Consumes and discards whatever remains of the element's body,
    /// returning the owning reader to a ready state.
    ///
    /// For a blob this drains to its terminator, for a nested stream it
    /// recursively discards every remaining sub-element; a sender-side
    /// cancellation encountered along the way counts as success. For a value
    /// element, or an element already fully consumed, this is a no-op.
    /// Idempotent.
    pub fn discard(&mut self) -> Result<()> {
        match &mut self.payload {
            Payload::Value(_) => Ok(()),
            Payload::Bytes { taken, .. } | Payload::Stream { taken, .. } => {
                *taken = true;
                self.owner.finish_body()
            }
        }
    }
}

impl<R: Read> fmt::Debug for Element<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Element")
            .field("kind", &self.kind())
            .field("size_hint", &self.size_hint())
            .finish_non_exhaustive()
    }
}

/// Streaming reader over a blob element's decoded bytes.
///
/// A sender-side cancellation surfaces as an [`io::Error`] wrapping
/// [`Error::Canceled`]; recover it with [`Error::from_io`].
pub struct BlobReader<'a, R: Read> {
    /// The reader whose blob mode this handle drives.
    owner: &'a mut StreamReader<R>,
    /// Terminal condition reached, if any. `true` means canceled.
    done: Option<bool>,
}

impl<R: Read> Read for BlobReader<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        match self.done {
            Some(false) => return Ok(0),
            Some(true) => return Err(Error::Canceled.into()),
            None => {}
        }
        match self.owner.read_blob(buf) {
            Ok(0) => {
                self.done = Some(false);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(Error::Canceled) => {
                self.done = Some(true);
                Err(Error::Canceled.into())
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: Read> fmt::Debug for BlobReader<'_, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}

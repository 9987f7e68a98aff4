//! Channel bridge from a sequential jstream reader to producer/consumer code.
//!
//! A [`StreamReader`] must be driven by one logical sequence of calls, and
//! each element must be drained before the next one is requested. This crate
//! keeps that discipline on a single background thread and exposes the
//! decoded elements through bounded channels instead: [`spawn`] starts the
//! pump and returns the connection's root [`StreamBranch`]; every nested
//! stream arrives as its own child [`StreamBranch`], every blob as a
//! [`BlobBranch`] of byte chunks, and each branch carries a one-slot error
//! channel that delivers the first error observed on that branch.
//!
//! Backpressure comes from the bounded channels: the pump blocks once a
//! branch's buffer is full, so a consumer working down the tree advances the
//! connection at its own pace. Dropping a branch receiver tells the pump to
//! drain the corresponding element off the wire and move on, which keeps the
//! enclosing stream's framing intact.
//!
//! # Example
//!
//! ```
//! use std::io::Cursor;
//! use jstream::{StreamReader, StreamWriter};
//! use jstream_chan::{Item, spawn};
//!
//! # fn main() -> std::io::Result<()> {
//! let mut conn = Vec::new();
//! let mut w = StreamWriter::new(&mut conn);
//! w.encode_value(&"hello").unwrap();
//!
//! let branch = spawn(StreamReader::new(Cursor::new(conn)), 8)?;
//! match branch.recv() {
//!     Some(Item::Value(raw)) => assert_eq!(raw.get(), r#""hello""#),
//!     other => panic!("unexpected item: {other:?}"),
//! }
//! assert!(branch.recv().is_none());
//! branch.finish().unwrap();
//! # Ok(())
//! # }
//! ```

use std::io::{self, Read};
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::thread;

use jstream::{Element, Error, Kind, StreamReader};
use serde_json::value::RawValue;
use tracing::{debug, trace};

/// Chunk size for forwarding blob bytes.
const BLOB_CHUNK: usize = 8 * 1024;

/// One decoded element, delivered over a branch channel.
#[derive(Debug)]
pub enum Item {
    /// A JSON value, still in raw form.
    Value(Box<RawValue>),
    /// A byte blob, delivered incrementally on its own branch.
    Bytes(BlobBranch),
    /// A nested stream, delivered on its own child branch.
    Stream(StreamBranch),
}

/// Consumer side of one stream (the connection's root, or a nested stream).
#[derive(Debug)]
pub struct StreamBranch {
    /// Advisory element-count estimate from the stream's head, if any.
    size_hint: Option<u64>,
    /// Decoded elements, in wire order.
    items: Receiver<Item>,
    /// First error observed on this branch, if any.
    err: Receiver<Error>,
}

impl StreamBranch {
    /// Advisory element-count estimate from the sender, if it gave one.
    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// Blocks for the next element. `None` means the branch is finished —
    /// cleanly, canceled, or failed; [`finish`](Self::finish) tells which.
    pub fn recv(&self) -> Option<Item> {
        self.items.recv().ok()
    }

    /// Consumes the branch and reports how it ended.
    ///
    /// Drops the item channel first, which tells the pump to drain whatever
    /// remains of this stream, then blocks until the branch completes.
    /// `Err(Error::Canceled)` means the sender canceled the stream; other
    /// errors mean the connection failed under it.
    pub fn finish(self) -> Result<(), Error> {
        let Self { items, err, .. } = self;
        drop(items);
        match err.recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }
}

/// Consumer side of one byte blob.
#[derive(Debug)]
pub struct BlobBranch {
    /// Advisory byte-length estimate from the blob's head, if any.
    size_hint: Option<u64>,
    /// Decoded blob bytes, in order.
    chunks: Receiver<Vec<u8>>,
    /// First error observed on this branch, if any.
    err: Receiver<Error>,
}

impl BlobBranch {
    /// Advisory byte-length estimate from the sender, if it gave one.
    pub fn size_hint(&self) -> Option<u64> {
        self.size_hint
    }

    /// Blocks for the next chunk of blob bytes. `None` means the blob is
    /// finished; [`finish`](Self::finish) tells whether it completed or was
    /// canceled.
    pub fn recv(&self) -> Option<Vec<u8>> {
        self.chunks.recv().ok()
    }

    /// Collects the remaining chunks into one buffer, failing if the blob
    /// was canceled or the connection broke under it.
    pub fn collect(self) -> Result<Vec<u8>, Error> {
        let Self { chunks, err, .. } = self;
        let mut out = Vec::new();
        while let Ok(chunk) = chunks.recv() {
            out.extend_from_slice(&chunk);
        }
        drop(chunks);
        match err.recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(out),
        }
    }

    /// Consumes the branch without the remaining bytes and reports how the
    /// blob ended.
    pub fn finish(self) -> Result<(), Error> {
        let Self { chunks, err, .. } = self;
        drop(chunks);
        match err.recv() {
            Ok(e) => Err(e),
            Err(_) => Ok(()),
        }
    }
}

/// Producer side of a stream branch.
struct BranchTx {
    /// Paired with [`StreamBranch::items`].
    items: SyncSender<Item>,
    /// Paired with [`StreamBranch::err`]; capacity 1, first error wins.
    err: SyncSender<Error>,
}

/// Producer side of a blob branch.
struct BlobTx {
    /// Paired with [`BlobBranch::chunks`].
    chunks: SyncSender<Vec<u8>>,
    /// Paired with [`BlobBranch::err`]; capacity 1, first error wins.
    err: SyncSender<Error>,
}

/// Builds a stream branch pair.
fn stream_branch(capacity: usize, size_hint: Option<u64>) -> (StreamBranch, BranchTx) {
    let (items_tx, items_rx) = sync_channel(capacity);
    let (err_tx, err_rx) = sync_channel(1);
    (
        StreamBranch {
            size_hint,
            items: items_rx,
            err: err_rx,
        },
        BranchTx {
            items: items_tx,
            err: err_tx,
        },
    )
}

/// Builds a blob branch pair.
fn blob_branch(capacity: usize, size_hint: Option<u64>) -> (BlobBranch, BlobTx) {
    let (chunks_tx, chunks_rx) = sync_channel(capacity);
    let (err_tx, err_rx) = sync_channel(1);
    (
        BlobBranch {
            size_hint,
            chunks: chunks_rx,
            err: err_rx,
        },
        BlobTx {
            chunks: chunks_tx,
            err: err_tx,
        },
    )
}

/// Starts a background thread that drives `reader` and returns the
/// connection's root branch.
///
/// `capacity` bounds every branch's item/chunk buffer (minimum 1). The
/// thread exits once the connection's outermost stream ends, fails, or every
/// receiver has been dropped; it is detached, so letting the root branch go
/// out of scope is enough to wind everything down.
pub fn spawn<R>(mut reader: StreamReader<R>, capacity: usize) -> io::Result<StreamBranch>
where
    R: Read + Send + 'static,
{
    let capacity = capacity.max(1);
    let (branch, tx) = stream_branch(capacity, None);
    thread::Builder::new()
        .name("jstream-pump".into())
        .spawn(move || {
            trace!("reader pump started");
            let clean = pump(&mut reader, &tx, capacity);
            trace!(clean, "reader pump finished");
        })?;
    Ok(branch)
}

/// Drives one stream to its end, forwarding elements into `tx`.
///
/// Returns `false` when the connection itself failed and nothing further can
/// be decoded; `true` when this stream reached a terminal condition (end or
/// cancel) with the connection still consistent.
fn pump<R: Read>(reader: &mut StreamReader<R>, tx: &BranchTx, capacity: usize) -> bool {
    // Cleared when this branch's consumer hangs up; remaining elements are
    // then decoded and dropped so the enclosing framing stays intact.
    let mut wanted = true;
    loop {
        let mut el = match reader.next() {
            Ok(el) => el,
            Err(Error::EndOfStream) => return true,
            Err(Error::Canceled) => {
                let _ = tx.err.try_send(Error::Canceled);
                return true;
            }
            Err(e) => {
                debug!("stream branch failed: {e}");
                let _ = tx.err.try_send(e);
                return false;
            }
        };
        match el.kind() {
            Kind::Value => {
                if wanted
                    && let Ok(raw) = el.raw()
                    && tx.items.send(Item::Value(raw.to_owned())).is_err()
                {
                    wanted = false;
                }
            }
            Kind::Bytes => {
                let (blob, blob_tx) = blob_branch(capacity, el.size_hint());
                if wanted && tx.items.send(Item::Bytes(blob)).is_err() {
                    wanted = false;
                }
                if !pump_blob(&mut el, &blob_tx) {
                    return false;
                }
            }
            Kind::Stream => {
                let (child, child_tx) = stream_branch(capacity, el.size_hint());
                if wanted && tx.items.send(Item::Stream(child)).is_err() {
                    wanted = false;
                }
                if let Ok(nested) = el.stream()
                    && !pump(nested, &child_tx, capacity)
                {
                    return false;
                }
            }
        }
    }
}

/// Streams one blob's bytes into its branch.
///
/// Same return convention as [`pump`]. A sender-side cancellation is
/// delivered on the branch's error channel and does not stop the pump.
fn pump_blob<R: Read>(el: &mut Element<'_, R>, tx: &BlobTx) -> bool {
    let Ok(mut blob) = el.bytes() else {
        return true;
    };
    let mut buf = vec![0u8; BLOB_CHUNK];
    // Cleared when the chunk consumer hangs up; the rest is drained.
    let mut forwarding = true;
    loop {
        match blob.read(&mut buf) {
            Ok(0) => return true,
            Ok(n) => {
                if forwarding && tx.chunks.send(buf[..n].to_vec()).is_err() {
                    forwarding = false;
                }
            }
            Err(e) => {
                return match Error::from_io(e) {
                    Error::Canceled => {
                        let _ = tx.err.try_send(Error::Canceled);
                        true
                    }
                    fatal => {
                        debug!("blob branch failed: {fatal}");
                        let _ = tx.err.try_send(fatal);
                        false
                    }
                };
            }
        }
    }
}

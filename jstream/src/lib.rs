//! Self-describing streaming protocol over one reliable byte connection.
//!
//! A jstream connection carries three kinds of element, interleaved without
//! any outer framing: discrete JSON values, byte blobs of unbounded size,
//! and nested streams of further elements, recursively. Each element starts
//! with a small JSON head record; blob bodies are streamed as base64 and
//! terminated in-band by a single sentinel byte (`$` normal, `!` canceled),
//! so nothing needs to be length-prefixed or buffered whole. The protocol
//! favors simplicity and composability over raw throughput and suits
//! RPC-style and event-stream use, where round-trip latency dominates.
//!
//! [`StreamWriter`] encodes elements onto any [`Write`](std::io::Write);
//! [`StreamReader`] decodes elements from any [`Read`](std::io::Read). Both
//! are synchronous and drive the connection strictly sequentially; a
//! connection must not be shared across threads without serializing access
//! (the `jstream-chan` crate bridges a reader to channels for that).
//!
//! # Example
//!
//! ```
//! use std::io::{Cursor, Read};
//! use jstream::{StreamReader, StreamWriter};
//!
//! # fn main() -> jstream::Result<()> {
//! let mut conn = Vec::new();
//! let mut w = StreamWriter::new(&mut conn);
//! w.encode_value(&"hello")?;
//! w.encode_bytes(Some(3), &mut &b"abc"[..])?;
//! w.encode_stream(Some(1), |w| w.encode_value(&42))?;
//!
//! let mut r = StreamReader::new(Cursor::new(conn));
//! assert_eq!(r.next()?.decode::<String>()?, "hello");
//!
//! let mut el = r.next()?;
//! let mut blob = Vec::new();
//! el.bytes()?.read_to_end(&mut blob)?;
//! assert_eq!(blob, b"abc");
//!
//! let mut el = r.next()?;
//! let nested = el.stream()?;
//! assert_eq!(nested.next()?.decode::<u32>()?, 42);
//! assert!(nested.next().is_err()); // end of the nested stream
//! # Ok(())
//! # }
//! ```

mod delim;
mod element;
mod error;
mod head;
mod reader;
mod splice;
mod writer;

pub use element::{BlobReader, Element, Kind};
pub use error::{Error, Result};
pub use reader::StreamReader;
pub use writer::StreamWriter;

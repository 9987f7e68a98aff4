//! Pull-based element decoder.

use std::fmt;
use std::io::{self, Read};
use std::mem;

use base64::engine::GeneralPurpose;
use base64::engine::general_purpose::STANDARD;
use base64::read::DecoderReader;
use serde::Deserialize;

use crate::delim::{DelimReader, Sentinel};
use crate::element::{Element, Payload};
use crate::error::{Error, Result};
use crate::head::Head;
use crate::splice::Splice;

/// Scratch size used when draining an abandoned blob body.
const DRAIN_CHUNK: usize = 4096;

/// The streaming base64 decoder stack for a blob body.
type BlobDecoder<R> = DecoderReader<'static, GeneralPurpose, DelimReader<Splice<R>>>;

/// Decode mode, holding the connection handle for whichever sub-decoder is
/// active. Exactly one mode owns the connection at any time; transitions
/// swap the whole variant and splice unconsumed bytes across.
enum State<R: Read> {
    /// Between elements: decoding head records.
    Head(Splice<R>),
    /// Inside a blob body.
    Blob(Box<BlobDecoder<R>>),
    /// Inside a nested stream, delegated to a child reader.
    Stream(Box<StreamReader<R>>),
    /// A tail record was decoded; the reader only repeats its terminal
    /// condition from here on.
    Finished {
        /// The connection handle, held for the parent to reclaim.
        src: Splice<R>,
        /// Whether the tail was a cancellation.
        canceled: bool,
    },
    /// Transient placeholder while a transition is in progress.
    Invalid,
}

/// Decodes a connection into a sequence of [`Element`]s.
///
/// Reads are ordinary blocking reads on the underlying connection; one
/// logical sequence of calls must drive a connection at a time. The reader
/// never closes the connection. Head decoding reads byte-exactly (no
/// over-read past a head record), so wrapping a raw socket in a
/// [`BufReader`](io::BufReader) before constructing the reader is
/// recommended for throughput but never required for correctness.
pub struct StreamReader<R: Read> {
    /// Current decode mode, owning the connection handle.
    state: State<R>,
    /// Whether this reader decodes a nested stream (which must end in a
    /// tail record) rather than the outermost connection (which ends at
    /// end-of-data).
    nested: bool,
}

impl<R: Read> StreamReader<R> {
    /// Wraps a connection in a reader for its outermost, implicit stream.
    pub fn new(conn: R) -> Self {
        Self {
            state: State::Head(Splice::new(conn)),
            nested: false,
        }
    }

    /// A child reader for a nested stream, resuming from `src`.
    fn nested_over(src: Splice<R>) -> Self {
        Self {
            state: State::Head(src),
            nested: true,
        }
    }

    /// Decodes the next element.
    ///
    /// Any body the previous element left unconsumed is drained from the
    /// connection first, so the framing survives an abandoned element.
    /// Returns [`Error::EndOfStream`] at this stream's normal end (its tail
    /// record, or end-of-data on the outermost connection) and
    /// [`Error::Canceled`] if the sender canceled this stream; both repeat
    /// on further calls and leave a parent reader fully usable.
    pub fn next(&mut self) -> Result<Element<'_, R>> {
        self.finish_body()?;
        if let State::Finished { canceled, .. } = &self.state {
            return Err(terminal(*canceled));
        }
        let Some(head) = self.read_head()? else {
            if self.nested {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "connection ended inside a stream, before its tail record",
                )));
            }
            return Err(Error::EndOfStream);
        };

        // Classification by field presence, in fixed priority order; a head
        // carrying several recognized fields resolves to the first match.
        if head.stream_end.is_some() {
            self.finish(false)
        } else if head.stream_cancel.is_some() {
            self.finish(true)
        } else if head.stream_start.is_some() {
            let src = self.take_head_src();
            self.state = State::Stream(Box::new(Self::nested_over(src)));
            Ok(Element::new(
                self,
                Payload::Stream {
                    size_hint: head.size_hint,
                    taken: false,
                },
            ))
        } else if head.bytes_start.is_some() {
            let src = self.take_head_src();
            let dec = DecoderReader::new(DelimReader::new(src), &STANDARD);
            self.state = State::Blob(Box::new(dec));
            Ok(Element::new(
                self,
                Payload::Bytes {
                    size_hint: head.size_hint,
                    taken: false,
                },
            ))
        } else if let Some(raw) = head.val {
            Ok(Element::new(self, Payload::Value(raw)))
        } else {
            Err(Error::MalformedElement)
        }
    }

    /// Consumes the reader, returning any buffered-but-unconsumed bytes and
    /// the underlying connection.
    ///
    /// An unfinished element body is drained first, exactly as
    /// [`next()`](Self::next) would.
    pub fn into_parts(mut self) -> Result<(Vec<u8>, R)> {
        self.finish_body()?;
        match self.state {
            State::Head(src) | State::Finished { src, .. } => Ok(src.into_parts()),
            _ => unreachable!("reader state lost during a transition"),
        }
    }

    /// Records a decoded tail record and reports its terminal condition.
    fn finish<T>(&mut self, canceled: bool) -> Result<T> {
        let src = self.take_head_src();
        self.state = State::Finished { src, canceled };
        Err(terminal(canceled))
    }

    /// Drains whatever body is still active and returns to head mode.
    ///
    /// A cancellation terminal on the drained body counts as success here:
    /// the framing is consistent either way.
    pub(crate) fn finish_body(&mut self) -> Result<()> {
        loop {
            match self.state {
                State::Head(_) | State::Finished { .. } => return Ok(()),
                State::Blob(_) => self.drain_blob()?,
                State::Stream(_) => self.drain_stream()?,
                State::Invalid => unreachable!("reader state lost during a transition"),
            }
        }
    }

    /// Reads decoded blob bytes while in blob mode.
    ///
    /// Returns `Ok(0)` exactly once the blob's normal terminator is reached
    /// (further calls also return `Ok(0)` via the restored head mode), and
    /// [`Error::Canceled`] when the cancel sentinel is reached. Either way
    /// the leftover bytes are spliced back and head mode is restored.
    pub(crate) fn read_blob(&mut self, buf: &mut [u8]) -> Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let n = {
            let State::Blob(dec) = &mut self.state else {
                return Ok(0);
            };
            loop {
                match dec.read(buf) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            }
        };
        if n == 0 { self.finalize_blob() } else { Ok(n) }
    }

    /// Tears down the blob decoder stack after it reported end-of-data,
    /// splicing undecoded bytes back in front of the connection.
    fn finalize_blob(&mut self) -> Result<usize> {
        let State::Blob(dec) = mem::replace(&mut self.state, State::Invalid) else {
            unreachable!("blob finalize outside blob mode")
        };
        let (mut src, sentinel, leftover) = dec.into_inner().into_parts();
        src.unread(&leftover);
        self.state = State::Head(src);
        match sentinel {
            Some(Sentinel::Cancel) => Err(Error::Canceled),
            _ => Ok(0),
        }
    }

    /// Drains an abandoned blob body to its terminator.
    fn drain_blob(&mut self) -> Result<()> {
        let mut scratch = [0u8; DRAIN_CHUNK];
        loop {
            match self.read_blob(&mut scratch) {
                Ok(0) | Err(Error::Canceled) => return Ok(()),
                Ok(_) => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Discards every remaining element of the active nested stream, then
    /// reclaims the connection handle from the child reader.
    fn drain_stream(&mut self) -> Result<()> {
        {
            let State::Stream(child) = &mut self.state else {
                return Ok(());
            };
            loop {
                match child.next() {
                    Ok(mut el) => el.discard()?,
                    Err(Error::EndOfStream | Error::Canceled) => break,
                    Err(e) => return Err(e),
                }
            }
        }
        let State::Stream(child) = mem::replace(&mut self.state, State::Invalid) else {
            unreachable!("stream reclaim outside stream mode")
        };
        self.state = State::Head(child.into_source());
        Ok(())
    }

    /// The child reader of the active nested stream.
    pub(crate) fn child_mut(&mut self) -> &mut Self {
        match &mut self.state {
            State::Stream(child) => child,
            _ => unreachable!("child reader requested outside stream mode"),
        }
    }

    /// Surrenders the connection handle of a reader at a head boundary.
    fn take_head_src(&mut self) -> Splice<R> {
        match mem::replace(&mut self.state, State::Invalid) {
            State::Head(src) => src,
            _ => unreachable!("head source requested outside head mode"),
        }
    }

    /// Surrenders the connection handle of a drained nested reader.
    fn into_source(self) -> Splice<R> {
        match self.state {
            State::Head(src) | State::Finished { src, .. } => src,
            _ => unreachable!("nested reader surrendered before reaching a boundary"),
        }
    }

    /// Skips inter-element whitespace and decodes one head record.
    ///
    /// Returns `Ok(None)` on clean end-of-data at the boundary. The JSON
    /// object is consumed byte-exactly, so whatever follows it (a blob body
    /// in particular) is untouched.
    fn read_head(&mut self) -> Result<Option<Head>> {
        let State::Head(src) = &mut self.state else {
            unreachable!("head decode outside head mode")
        };
        loop {
            let mut byte = [0u8; 1];
            let n = loop {
                match src.read(&mut byte) {
                    Ok(n) => break n,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e.into()),
                }
            };
            if n == 0 {
                return Ok(None);
            }
            match byte[0] {
                b' ' | b'\t' | b'\r' | b'\n' => {}
                b => {
                    src.unread(&[b]);
                    break;
                }
            }
        }
        let mut de = serde_json::Deserializer::from_reader(&mut *src);
        match Head::deserialize(&mut de) {
            Ok(head) => Ok(Some(head)),
            Err(e) if e.is_eof() => Err(Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                e,
            ))),
            Err(e) => Err(Error::Json(e)),
        }
    }
}

impl<R: Read> fmt::Debug for StreamReader<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mode = match self.state {
            State::Head(_) => "head",
            State::Blob(_) => "blob",
            State::Stream(_) => "stream",
            State::Finished { .. } => "finished",
            State::Invalid => "invalid",
        };
        f.debug_struct("StreamReader")
            .field("mode", &mode)
            .field("nested", &self.nested)
            .finish()
    }
}

/// The terminal error for a stream tail.
fn terminal(canceled: bool) -> Error {
    if canceled {
        Error::Canceled
    } else {
        Error::EndOfStream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::Kind;
    use crate::writer::StreamWriter;
    use serde_json::json;
    use std::io::Cursor;

    /// Builds wire bytes with a writer.
    fn wire(build: impl FnOnce(&mut StreamWriter<&mut Vec<u8>>) -> Result<()>) -> Vec<u8> {
        let mut conn = Vec::new();
        build(&mut StreamWriter::new(&mut conn)).unwrap();
        conn
    }

    fn reader(bytes: impl Into<Vec<u8>>) -> StreamReader<Cursor<Vec<u8>>> {
        StreamReader::new(Cursor::new(bytes.into()))
    }

    #[test]
    fn value_blob_stream_scenario() {
        let conn = wire(|w| {
            w.encode_value(&json!({"a": 1}))?;
            w.encode_bytes(None, &mut &[2u8, 3, 4, 5][..])?;
            w.encode_stream(None, |w| w.encode_value(&"x"))
        });
        let mut r = reader(conn);

        let el = r.next().unwrap();
        assert_eq!(el.kind(), Kind::Value);
        assert_eq!(el.decode::<serde_json::Value>().unwrap(), json!({"a": 1}));

        let mut el = r.next().unwrap();
        assert_eq!(el.kind(), Kind::Bytes);
        let mut body = Vec::new();
        el.bytes().unwrap().read_to_end(&mut body).unwrap();
        assert_eq!(body, [2, 3, 4, 5]);

        let mut el = r.next().unwrap();
        assert_eq!(el.kind(), Kind::Stream);
        let child = el.stream().unwrap();
        let inner = child.next().unwrap();
        assert_eq!(inner.decode::<String>().unwrap(), "x");
        assert!(matches!(child.next().unwrap_err(), Error::EndOfStream));

        assert!(matches!(r.next().unwrap_err(), Error::EndOfStream));
    }

    #[test]
    fn empty_blob_round_trips() {
        let conn = wire(|w| w.encode_bytes(Some(0), &mut io::empty()));
        let mut r = reader(conn);

        let mut el = r.next().unwrap();
        assert_eq!(el.size_hint(), Some(0));
        let mut body = Vec::new();
        el.bytes().unwrap().read_to_end(&mut body).unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn blob_round_trips_through_tiny_read_buffers() {
        let data: Vec<u8> = (0u8..=250).collect();
        let conn = wire(|w| w.encode_bytes(None, &mut &data[..]));
        let mut r = reader(conn);

        let mut el = r.next().unwrap();
        let mut blob = el.bytes().unwrap();
        let mut body = Vec::new();
        let mut one = [0u8; 1];
        loop {
            match blob.read(&mut one).unwrap() {
                0 => break,
                n => body.extend_from_slice(&one[..n]),
            }
        }
        assert_eq!(body, data);
        // Terminal condition repeats.
        assert_eq!(blob.read(&mut one).unwrap(), 0);
    }

    #[test]
    fn trailing_bytes_after_trailer_are_left_on_the_connection() {
        let mut conn = wire(|w| w.encode_bytes(None, &mut &b"hello"[..]));
        conn.extend_from_slice(b" \t\n");
        let mut r = reader(conn);

        let mut el = r.next().unwrap();
        el.discard().unwrap();
        drop(el);

        let (buffered, inner) = r.into_parts().unwrap();
        assert_eq!(buffered, b" \t\n");
        assert_eq!(inner.position() as usize, inner.get_ref().len());
    }

    #[test]
    fn canceled_blob_delivers_partial_bytes_then_canceled() {
        /// Yields some bytes, then fails.
        struct Failing {
            data: &'static [u8],
            sent: bool,
        }
        impl Read for Failing {
            fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
                if self.sent {
                    return Err(io::Error::other("source gave out"));
                }
                self.sent = true;
                buf[..self.data.len()].copy_from_slice(self.data);
                Ok(self.data.len())
            }
        }

        let mut conn = Vec::new();
        let err = StreamWriter::new(&mut conn)
            .encode_bytes(
                None,
                &mut Failing {
                    data: &[1, 2],
                    sent: false,
                },
            )
            .unwrap_err();
        assert!(matches!(err, Error::Io(_)));
        assert_eq!(conn.last(), Some(&b'!'));

        let mut r = reader(conn);
        let mut el = r.next().unwrap();
        let mut blob = el.bytes().unwrap();
        let mut body = Vec::new();
        let io_err = loop {
            let mut chunk = [0u8; 16];
            match blob.read(&mut chunk) {
                Ok(0) => panic!("cancellation must not look like clean completion"),
                Ok(n) => body.extend_from_slice(&chunk[..n]),
                Err(e) => break e,
            }
        };
        assert_eq!(body, [1, 2]);
        assert!(matches!(Error::from_io(io_err), Error::Canceled));
    }

    #[test]
    fn discard_is_idempotent() {
        let conn = wire(|w| {
            w.encode_bytes(None, &mut &b"abc"[..])?;
            w.encode_value(&7)
        });
        let mut r = reader(conn);

        let mut el = r.next().unwrap();
        el.discard().unwrap();
        el.discard().unwrap();
        drop(el);

        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 7);
    }

    #[test]
    fn abandoned_bodies_do_not_shift_framing() {
        let conn = wire(|w| {
            w.encode_value(&1)?;
            w.encode_bytes(None, &mut &b"discard me"[..])?;
            w.encode_value(&2)?;
            w.encode_stream(Some(2), |w| {
                w.encode_value(&"a")?;
                w.encode_bytes(None, &mut &b"nested blob"[..])
            })?;
            w.encode_value(&3)
        });
        let mut r = reader(conn);

        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 1);
        // Dropped without discard and without reading a single byte.
        drop(r.next().unwrap());
        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 2);
        drop(r.next().unwrap());
        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 3);
        assert!(matches!(r.next().unwrap_err(), Error::EndOfStream));
    }

    #[test]
    fn canceling_a_nested_stream_spares_the_parent() {
        let conn = wire(|w| {
            w.encode_stream(None, |w| {
                w.encode_value(&1)?;
                let _ = w.encode_stream(None, |w| {
                    w.encode_value(&"partial")?;
                    Err(Error::Io(io::Error::other("producer failed")))
                });
                w.encode_value(&2)
            })
        });
        let mut r = reader(conn);

        let mut el = r.next().unwrap();
        let parent = el.stream().unwrap();
        assert_eq!(parent.next().unwrap().decode::<u32>().unwrap(), 1);

        let mut child_el = parent.next().unwrap();
        let child = child_el.stream().unwrap();
        assert_eq!(child.next().unwrap().decode::<String>().unwrap(), "partial");
        assert!(matches!(child.next().unwrap_err(), Error::Canceled));
        // The cancellation repeats and stays contained.
        assert!(matches!(child.next().unwrap_err(), Error::Canceled));
        drop(child_el);

        assert_eq!(parent.next().unwrap().decode::<u32>().unwrap(), 2);
        assert!(matches!(parent.next().unwrap_err(), Error::EndOfStream));
        drop(el);
        assert!(matches!(r.next().unwrap_err(), Error::EndOfStream));
    }

    #[test]
    fn classification_priority_is_fixed() {
        // The wire format does not forbid a head matching several shapes;
        // resolution order is streamEnd, streamCancel, streamStart,
        // bytesStart, val.
        let mut r = reader(&br#"{"val":1,"streamEnd":true}"#[..]);
        assert!(matches!(r.next().unwrap_err(), Error::EndOfStream));
        assert!(matches!(r.next().unwrap_err(), Error::EndOfStream));

        let mut r = reader(&br#"{"streamCancel":true,"streamEnd":true}"#[..]);
        assert!(matches!(r.next().unwrap_err(), Error::EndOfStream));

        let wire = br#"{"streamStart":true,"bytesStart":true}{"streamEnd":true}{"val":5}"#;
        let mut r = reader(&wire[..]);
        let mut el = r.next().unwrap();
        assert_eq!(el.kind(), Kind::Stream);
        el.discard().unwrap();
        drop(el);
        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 5);
    }

    #[test]
    fn null_value_is_a_value_element() {
        let mut r = reader(&br#"{"val":null}"#[..]);
        let el = r.next().unwrap();
        assert_eq!(el.kind(), Kind::Value);
        assert_eq!(el.decode::<serde_json::Value>().unwrap(), json!(null));
    }

    #[test]
    fn unrecognized_head_fields_are_ignored() {
        let mut r = reader(&br#"{"futureFlag":true,"val":9,"meta":{"x":[]}}"#[..]);
        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 9);
    }

    #[test]
    fn empty_head_is_malformed() {
        let mut r = reader(&br#"{"sizeHint":3}"#[..]);
        assert!(matches!(r.next().unwrap_err(), Error::MalformedElement));
    }

    #[test]
    fn whitespace_between_heads_is_skipped() {
        let mut r = reader(&b"  {\"val\":1} \r\n\t {\"val\":2}\n"[..]);
        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 1);
        assert_eq!(r.next().unwrap().decode::<u32>().unwrap(), 2);
        assert!(matches!(r.next().unwrap_err(), Error::EndOfStream));
    }

    #[test]
    fn kind_mismatch_is_reported() {
        let conn = wire(|w| w.encode_value(&1));
        let mut r = reader(conn);

        let mut el = r.next().unwrap();
        match el.bytes().unwrap_err() {
            Error::WrongKind { expected, actual } => {
                assert_eq!(expected, Kind::Bytes);
                assert_eq!(actual, Kind::Value);
            }
            other => panic!("expected WrongKind, got {other:?}"),
        }
        assert!(matches!(el.stream().unwrap_err(), Error::WrongKind { .. }));
    }

    #[test]
    fn blob_body_is_single_use() {
        let conn = wire(|w| w.encode_bytes(None, &mut &b"x"[..]));
        let mut r = reader(conn);

        let mut el = r.next().unwrap();
        let mut body = Vec::new();
        el.bytes().unwrap().read_to_end(&mut body).unwrap();
        assert!(matches!(el.bytes().unwrap_err(), Error::AlreadyConsumed));
    }

    #[test]
    fn eof_inside_a_nested_stream_is_an_error() {
        let mut r = reader(&br#"{"streamStart":true}{"val":1}"#[..]);
        let mut el = r.next().unwrap();
        let child = el.stream().unwrap();
        assert_eq!(child.next().unwrap().decode::<u32>().unwrap(), 1);
        match child.next().unwrap_err() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io(UnexpectedEof), got {other:?}"),
        }
    }

    #[test]
    fn truncated_head_is_an_error() {
        let mut r = reader(&br#"{"val": "#[..]);
        match r.next().unwrap_err() {
            Error::Io(e) => assert_eq!(e.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("expected Io(UnexpectedEof), got {other:?}"),
        }
    }

    #[test]
    fn invalid_json_head_is_an_error() {
        let mut r = reader(&b"not json"[..]);
        assert!(matches!(r.next().unwrap_err(), Error::Json(_)));
    }

    #[test]
    fn size_hints_are_surfaced() {
        let conn = wire(|w| {
            w.encode_bytes(Some(4), &mut &[0u8; 4][..])?;
            w.encode_stream(Some(2), |w| {
                w.encode_value(&1)?;
                w.encode_value(&2)
            })
        });
        let mut r = reader(conn);

        let el = r.next().unwrap();
        assert_eq!(el.size_hint(), Some(4));
        drop(el);

        let el = r.next().unwrap();
        assert_eq!(el.size_hint(), Some(2));
    }

    #[test]
    fn missing_blob_terminator_is_an_error() {
        // Head plus body, but the connection dies before any sentinel.
        let mut r = reader(&br#"{"bytesStart":true}aGVsbG8="#[..]);
        let mut el = r.next().unwrap();
        let mut blob = el.bytes().unwrap();
        let mut body = Vec::new();
        let err = blob.read_to_end(&mut body).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}

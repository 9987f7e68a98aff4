//! Push-based element encoder.

use std::io::{self, Read, Write};

use base64::engine::general_purpose::STANDARD;
use base64::write::EncoderWriter;
use serde::Serialize;

use crate::delim::{BLOB_CANCEL, BLOB_END};
use crate::error::{Error, Result};
use crate::head::{BytesHead, StreamCancelTail, StreamEndTail, StreamHead, ValueHead};

/// Chunk size for streaming a blob source onto the connection.
const COPY_CHUNK: usize = 8 * 1024;

/// Encodes elements onto a connection.
///
/// Stateless besides the destination: every encode call writes a complete
/// element (head, body, terminator) and flushes, so elements from separate
/// calls are independent on the wire. Writes block until the connection
/// accepts the bytes. The writer never closes the connection.
#[derive(Debug)]
pub struct StreamWriter<W: Write> {
    /// The destination connection.
    dst: W,
}

impl<W: Write> StreamWriter<W> {
    /// Wraps a connection in a writer.
    pub fn new(dst: W) -> Self {
        Self { dst }
    }

    /// Consumes the writer, returning the underlying connection.
    pub fn into_inner(self) -> W {
        self.dst
    }

    /// Encodes one JSON value element.
    pub fn encode_value<T: Serialize>(&mut self, value: &T) -> Result<()> {
        self.head(&ValueHead { val: value })?;
        self.dst.flush()?;
        Ok(())
    }

    /// Encodes one byte blob element, streaming `src` until it is exhausted.
    ///
    /// `size_hint` is an advisory estimate of the blob's byte length; it is
    /// written to the head record but never enforced. If `src` fails
    /// mid-transfer the blob is terminated with the cancel sentinel
    /// (best-effort) and the source's error is returned; the connection
    /// remains consistently framed for the peer either way.
    pub fn encode_bytes<S>(&mut self, size_hint: Option<u64>, src: &mut S) -> Result<()>
    where
        S: Read + ?Sized,
    {
        self.head(&BytesHead {
            bytes_start: true,
            size_hint,
        })?;

        let mut enc = EncoderWriter::new(&mut self.dst, &STANDARD);
        let mut buf = [0u8; COPY_CHUNK];
        let src_err = loop {
            let n = match src.read(&mut buf) {
                Ok(0) => break None,
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Some(e),
            };
            enc.write_all(&buf[..n])?;
        };
        match src_err {
            None => {
                let dst = enc.finish()?;
                dst.write_all(&[BLOB_END])?;
                dst.flush()?;
                Ok(())
            }
            Some(e) => {
                // Close out the base64 body so the peer's decoder reaches
                // the sentinel cleanly, then mark the blob canceled. The
                // connection being broken at this point is not worth
                // reporting over the source's own error.
                if let Ok(dst) = enc.finish() {
                    let _ = dst.write_all(&[BLOB_CANCEL]);
                    let _ = dst.flush();
                }
                Err(Error::Io(e))
            }
        }
    }

    /// Encodes one nested stream element.
    ///
    /// `body` receives a writer over the same connection and emits the
    /// nested elements; nesting deeper is just calling this method again on
    /// that writer. `size_hint` is an advisory estimate of the nested
    /// element count. If `body` returns an error the stream is terminated
    /// with a cancel tail (best-effort) and the error is propagated.
    pub fn encode_stream<F>(&mut self, size_hint: Option<u64>, body: F) -> Result<()>
    where
        F: FnOnce(&mut Self) -> Result<()>,
    {
        self.head(&StreamHead {
            stream_start: true,
            size_hint,
        })?;
        match body(self) {
            Ok(()) => {
                self.head(&StreamEndTail { stream_end: true })?;
                self.dst.flush()?;
                Ok(())
            }
            Err(e) => {
                if self.head(&StreamCancelTail {
                    stream_cancel: true,
                })
                .is_ok()
                {
                    let _ = self.dst.flush();
                }
                Err(e)
            }
        }
    }

    /// Writes one head record, with no separator.
    fn head<T: Serialize>(&mut self, head: &T) -> Result<()> {
        serde_json::to_writer(&mut self.dst, head)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_wire_bytes() {
        let mut conn = Vec::new();
        StreamWriter::new(&mut conn).encode_value(&1).unwrap();
        assert_eq!(conn, br#"{"val":1}"#);
    }

    #[test]
    fn blob_wire_bytes() {
        let mut conn = Vec::new();
        StreamWriter::new(&mut conn)
            .encode_bytes(Some(4), &mut &[2u8, 3, 4, 5][..])
            .unwrap();
        let mut expected = br#"{"bytesStart":true,"sizeHint":4}"#.to_vec();
        expected.extend_from_slice(b"AgMEBQ==$");
        assert_eq!(conn, expected);
    }

    #[test]
    fn empty_blob_wire_bytes() {
        let mut conn = Vec::new();
        StreamWriter::new(&mut conn)
            .encode_bytes(None, &mut io::empty())
            .unwrap();
        assert_eq!(conn, br#"{"bytesStart":true}$"#);
    }

    #[test]
    fn stream_wire_bytes() {
        let mut conn = Vec::new();
        StreamWriter::new(&mut conn)
            .encode_stream(Some(1), |w| w.encode_value(&"x"))
            .unwrap();
        assert_eq!(
            conn,
            br#"{"streamStart":true,"sizeHint":1}{"val":"x"}{"streamEnd":true}"#
        );
    }

    #[test]
    fn failed_stream_body_writes_cancel_tail() {
        let mut conn = Vec::new();
        let err = StreamWriter::new(&mut conn)
            .encode_stream(None, |w| {
                w.encode_value(&1)?;
                Err(Error::MalformedElement)
            })
            .unwrap_err();
        assert!(matches!(err, Error::MalformedElement));
        assert_eq!(
            conn,
            br#"{"streamStart":true}{"val":1}{"streamCancel":true}"#
        );
    }

    #[test]
    fn nested_streams_share_the_connection() {
        let mut conn = Vec::new();
        StreamWriter::new(&mut conn)
            .encode_stream(None, |w| {
                w.encode_value(&1)?;
                w.encode_stream(None, |w| w.encode_value(&2))
            })
            .unwrap();
        assert_eq!(
            conn,
            concat!(
                r#"{"streamStart":true}{"val":1}"#,
                r#"{"streamStart":true}{"val":2}{"streamEnd":true}"#,
                r#"{"streamEnd":true}"#
            )
            .as_bytes()
        );
    }
}

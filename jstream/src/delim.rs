//! Sentinel-delimited sub-reader for byte blob bodies.

use std::io::{self, Read};

/// Terminates a blob body normally.
pub(crate) const BLOB_END: u8 = b'$';

/// Terminates a blob body early, signaling sender-side cancellation.
pub(crate) const BLOB_CANCEL: u8 = b'!';

/// Which sentinel byte ended the delimited region.
///
/// Both bytes sit outside the standard base64 alphabet (including the `=`
/// pad), so they can never occur inside a legitimate blob body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Sentinel {
    /// `$` — the sender finished the blob normally.
    End,
    /// `!` — the sender canceled the blob mid-transfer.
    Cancel,
}

/// A reader that truncates at the first sentinel byte.
///
/// Each chunk read from the source is scanned left to right for `$` or `!`.
/// On a match the bytes before it are returned as a successful read, the
/// bytes after it are stashed as leftover for the next decode mode, and
/// every subsequent read reports end-of-data without touching the source
/// again. The source reaching end-of-data before any sentinel is a protocol
/// error: the peer never sent a terminator.
#[derive(Debug)]
pub(crate) struct DelimReader<R> {
    /// The source, normally buffered bytes spliced ahead of the connection.
    inner: R,
    /// The sentinel found, if any. Set at most once.
    hit: Option<Sentinel>,
    /// Bytes read past the sentinel, owed to the next decode mode.
    leftover: Vec<u8>,
}

impl<R> DelimReader<R> {
    /// Wraps a source reader.
    pub(crate) fn new(inner: R) -> Self {
        Self {
            inner,
            hit: None,
            leftover: Vec::new(),
        }
    }

    /// Consumes the reader, returning the source, the sentinel seen (if
    /// any), and the bytes read past it.
    pub(crate) fn into_parts(self) -> (R, Option<Sentinel>, Vec<u8>) {
        (self.inner, self.hit, self.leftover)
    }
}

impl<R: Read> Read for DelimReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.hit.is_some() || buf.is_empty() {
            return Ok(0);
        }
        let n = self.inner.read(buf)?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection ended before the blob terminator",
            ));
        }
        match buf[..n]
            .iter()
            .position(|&b| b == BLOB_END || b == BLOB_CANCEL)
        {
            Some(i) => {
                self.hit = Some(if buf[i] == BLOB_END {
                    Sentinel::End
                } else {
                    Sentinel::Cancel
                });
                self.leftover.extend_from_slice(&buf[i + 1..n]);
                Ok(i)
            }
            None => Ok(n),
        }
    }
}

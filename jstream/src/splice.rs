//! Pushback reader used to hand unconsumed bytes between decode modes.

use std::io::{self, Read};

/// A reader with a front-spliced pushback buffer.
///
/// Sub-decoders (the base64 blob codec, the sentinel scanner) routinely read
/// a few bytes past the data they own. Those bytes are pushed back here via
/// [`Splice::unread`] and are served before anything further is read from
/// the underlying connection, so the next decode mode resumes byte-exactly.
#[derive(Debug)]
pub(crate) struct Splice<R> {
    /// Pushed-back bytes, consumed from `pos` onward before `inner`.
    buf: Vec<u8>,
    /// Read position inside `buf`.
    pos: usize,
    /// The underlying connection reader.
    inner: R,
}

impl<R> Splice<R> {
    /// Wraps a reader with an empty pushback buffer.
    pub(crate) fn new(inner: R) -> Self {
        Self {
            buf: Vec::new(),
            pos: 0,
            inner,
        }
    }

    /// Splices `bytes` in front of everything not yet consumed.
    pub(crate) fn unread(&mut self, bytes: &[u8]) {
        if bytes.is_empty() {
            return;
        }
        let mut merged = Vec::with_capacity(bytes.len() + self.buf.len() - self.pos);
        merged.extend_from_slice(bytes);
        merged.extend_from_slice(&self.buf[self.pos..]);
        self.buf = merged;
        self.pos = 0;
    }

    /// The pushed-back bytes that have not been consumed yet.
    pub(crate) fn buffered(&self) -> &[u8] {
        &self.buf[self.pos..]
    }

    /// Consumes the splice, returning the remaining buffered bytes and the
    /// underlying reader.
    pub(crate) fn into_parts(self) -> (Vec<u8>, R) {
        let Self { buf, pos, inner } = self;
        (buf[pos..].to_vec(), inner)
    }
}

impl<R: Read> Read for Splice<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if self.pos < self.buf.len() {
            let n = (self.buf.len() - self.pos).min(out.len());
            out[..n].copy_from_slice(&self.buf[self.pos..self.pos + n]);
            self.pos += n;
            if self.pos == self.buf.len() {
                self.buf.clear();
                self.pos = 0;
            }
            return Ok(n);
        }
        self.inner.read(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn serves_pushback_before_inner() {
        let mut s = Splice::new(Cursor::new(b"world".to_vec()));
        s.unread(b"hello ");

        let mut out = String::new();
        s.read_to_string(&mut out).unwrap();
        assert_eq!(out, "hello world");
    }

    #[test]
    fn unread_prepends_to_existing_pushback() {
        let mut s = Splice::new(Cursor::new(Vec::new()));
        s.unread(b"cd");
        s.unread(b"ab");
        assert_eq!(s.buffered(), b"abcd");

        let mut one = [0u8; 1];
        s.read_exact(&mut one).unwrap();
        assert_eq!(&one, b"a");
        assert_eq!(s.buffered(), b"bcd");
    }

    #[test]
    fn partial_reads_track_position() {
        let mut s = Splice::new(Cursor::new(b"xy".to_vec()));
        s.unread(b"abc");

        let mut two = [0u8; 2];
        s.read_exact(&mut two).unwrap();
        assert_eq!(&two, b"ab");

        let (rest, inner) = s.into_parts();
        assert_eq!(rest, b"c");
        assert_eq!(inner.into_inner(), b"xy");
    }

    #[test]
    fn empty_unread_is_noop() {
        let mut s = Splice::new(Cursor::new(b"z".to_vec()));
        s.unread(b"");
        assert!(s.buffered().is_empty());
    }
}

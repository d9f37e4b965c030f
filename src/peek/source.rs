//! Connection sources for peeking
//!
//! The matcher reads through any `std::io::Read`. Peek semantics (bytes stay
//! visible to whoever consumes the connection next) are provided here by
//! `Recorder`, and `Snapshot` covers hosts that hand over bytes as they
//! arrive instead of blocking.

use std::io::{self, Cursor, ErrorKind, Read};

/// Result of an exact-count read
#[derive(Debug)]
pub enum Fill {
    /// The whole buffer was filled
    Complete,
    /// The stream ended after this many bytes
    Short(usize),
    /// Transport failure after this many bytes
    Failed { read: usize, error: io::Error },
}

/// Read until `buf` is full, the stream ends, or the reader fails.
///
/// `Interrupted` is retried. `Ok(0)` and `UnexpectedEof` both count as the
/// end of the stream.
pub fn read_full<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Fill {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Fill::Short(filled),
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == ErrorKind::UnexpectedEof => return Fill::Short(filled),
            Err(error) => {
                return Fill::Failed {
                    read: filled,
                    error,
                }
            }
        }
    }
    Fill::Complete
}

/// Keeps every byte read through it so the stream can be replayed from the
/// start once sniffing is done.
pub struct Recorder<R> {
    inner: R,
    recorded: Vec<u8>,
}

impl<R: Read> Recorder<R> {
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            recorded: Vec::new(),
        }
    }

    /// Bytes peeked so far
    pub fn recorded(&self) -> &[u8] {
        &self.recorded
    }

    /// Reader yielding the peeked bytes followed by the unread remainder
    pub fn rewind(self) -> io::Chain<Cursor<Vec<u8>>, R> {
        Cursor::new(self.recorded).chain(self.inner)
    }
}

impl<R: Read> Read for Recorder<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.recorded.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

/// Reader over the bytes a host has buffered so far for one connection.
///
/// Past the buffered bytes it reports EOF if the stream has ended and
/// `WouldBlock` otherwise.
pub struct Snapshot<'a> {
    data: &'a [u8],
    pos: usize,
    end_of_stream: bool,
}

impl<'a> Snapshot<'a> {
    pub fn new(data: &'a [u8], end_of_stream: bool) -> Self {
        Self {
            data,
            pos: 0,
            end_of_stream,
        }
    }
}

impl Read for Snapshot<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let remaining = &self.data[self.pos..];
        if remaining.is_empty() && !buf.is_empty() {
            if self.end_of_stream {
                return Ok(0);
            }
            return Err(ErrorKind::WouldBlock.into());
        }
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

//! Newline framing for the chat wire format.
//!
//! [`LineFramer`] is the push-style API: feed it whatever chunk the socket
//! produced and iterate the complete lines it yields. [`LineCodec`] runs the
//! same splitting logic as a `tokio_util` codec so a socket can be wrapped in
//! `Framed`.

use std::{cmp, fmt, io};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// One newline-stripped segment of the stream.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Line(Bytes);

impl Line {
    /// Wraps `bytes` as a line. Fails if they contain the `\n` delimiter.
    pub fn new(bytes: impl Into<Bytes>) -> Result<Self, InvalidLine> {
        let bytes = bytes.into();
        match bytes.iter().position(|b| *b == b'\n') {
            Some(offset) => Err(InvalidLine { offset }),
            None => Ok(Line(bytes)),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Lossy UTF-8 view; invalid sequences become U+FFFD.
    pub fn to_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.0)
    }
}

impl fmt::Debug for Line {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Line({:?})", self.to_text())
    }
}

impl TryFrom<&str> for Line {
    type Error = InvalidLine;

    fn try_from(text: &str) -> Result<Self, InvalidLine> {
        Line::new(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl TryFrom<String> for Line {
    type Error = InvalidLine;

    fn try_from(text: String) -> Result<Self, InvalidLine> {
        Line::new(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("line contains a newline at byte {offset}")]
pub struct InvalidLine {
    pub offset: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("line exceeds maximum length of {limit} bytes")]
    LineTooLong { limit: usize },
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        match err {
            FrameError::Io(err) => err,
            other => io::Error::new(io::ErrorKind::InvalidData, other),
        }
    }
}

/// Scan state shared by the framer and the codec.
#[derive(Debug, Clone, Default)]
struct Splitter {
    max_length: Option<usize>,
    // Bytes before this offset are known not to contain '\n'.
    next_index: usize,
    discarding: bool,
}

impl Splitter {
    fn new(max_length: Option<usize>) -> Self {
        Self {
            max_length,
            ..Self::default()
        }
    }

    fn next_line(&mut self, buf: &mut BytesMut) -> Option<Result<Line, FrameError>> {
        loop {
            let read_to = match self.max_length {
                Some(max) => cmp::min(max.saturating_add(1), buf.len()),
                None => buf.len(),
            };
            let newline = buf[self.next_index..read_to]
                .iter()
                .position(|b| *b == b'\n')
                .map(|offset| offset + self.next_index);

            match (self.discarding, newline) {
                (true, Some(index)) => {
                    buf.advance(index + 1);
                    self.discarding = false;
                    self.next_index = 0;
                }
                (true, None) => {
                    buf.advance(read_to);
                    self.next_index = 0;
                    if buf.is_empty() {
                        return None;
                    }
                }
                (false, Some(index)) => {
                    self.next_index = 0;
                    let mut line = buf.split_to(index + 1);
                    line.truncate(index);
                    return Some(Ok(Line(line.freeze())));
                }
                (false, None) => match self.max_length {
                    Some(limit) if buf.len() > limit => {
                        self.discarding = true;
                        return Some(Err(FrameError::LineTooLong { limit }));
                    }
                    _ => {
                        self.next_index = read_to;
                        return None;
                    }
                },
            }
        }
    }
}

/// Accumulates raw bytes and hands back complete lines.
#[derive(Debug, Default)]
pub struct LineFramer {
    buf: BytesMut,
    splitter: Splitter,
}

impl LineFramer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Framer that reports [`FrameError::LineTooLong`] once a line grows past
    /// `max_length` bytes, then skips to the next newline.
    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            buf: BytesMut::new(),
            splitter: Splitter::new(Some(max_length)),
        }
    }

    /// Bytes held back waiting for a newline.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Appends `chunk` and returns an iterator over the lines now complete.
    ///
    /// The iterator is lazy: lines it does not get to stay buffered and are
    /// returned by the next call.
    pub fn feed(&mut self, chunk: &[u8]) -> Lines<'_> {
        self.buf.extend_from_slice(chunk);
        Lines { framer: self }
    }
}

pub struct Lines<'a> {
    framer: &'a mut LineFramer,
}

impl Iterator for Lines<'_> {
    type Item = Result<Line, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        let LineFramer { buf, splitter } = &mut *self.framer;
        splitter.next_line(buf)
    }
}

/// `Framed` codec for newline-delimited lines.
#[derive(Debug, Clone, Default)]
pub struct LineCodec {
    splitter: Splitter,
}

impl LineCodec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_length(max_length: usize) -> Self {
        Self {
            splitter: Splitter::new(Some(max_length)),
        }
    }
}

impl Decoder for LineCodec {
    type Item = Line;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Line>, FrameError> {
        self.splitter.next_line(src).transpose()
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Line>, FrameError> {
        let line = self.decode(src)?;
        if line.is_none() && !src.is_empty() {
            debug!(bytes = src.len(), "discarding unterminated bytes at end of stream");
            src.clear();
            self.splitter.next_index = 0;
        }
        Ok(line)
    }
}

impl Encoder<Line> for LineCodec {
    type Error = FrameError;

    fn encode(&mut self, line: Line, dst: &mut BytesMut) -> Result<(), FrameError> {
        dst.reserve(line.len() + 1);
        dst.put_slice(line.as_bytes());
        dst.put_u8(b'\n');
        Ok(())
    }
}

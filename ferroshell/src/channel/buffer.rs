//! Output buffers for one channel stream.
//!
//! Every stream keeps three views of the bytes the reader delivers:
//! - the raw bytes of the current command (reset per `sendline`)
//! - the raw session transcript
//! - a [`PatternBuffer`] holding control-sequence-free text that expect and
//!   prompt matching search with absolute, never-reset offsets
//!
//! Complete lines are split out incrementally by [`LineSplitter`] so they
//! can be forwarded to listeners and the verbose echo.

use std::fmt;

use bytes::{Bytes, BytesMut};
use regex::bytes::Regex;

/// Searchable text with terminal control sequences stripped.
///
/// Offsets handed out by the search methods are absolute: they index the
/// whole text seen since the channel opened, so a cursor stays valid
/// across command boundaries. Once the text outgrows `max_len` the oldest
/// half is dropped; offsets keep counting from the original start.
pub struct PatternBuffer {
    /// Cleaned text still held in memory.
    buffer: Vec<u8>,

    /// Absolute offset of `buffer[0]`.
    base: usize,

    /// Compaction threshold.
    max_len: usize,

    /// Parser state carried between chunks so split escape sequences are
    /// still recognised.
    parser: vte::Parser,
}

impl PatternBuffer {
    /// Default compaction threshold (8 MiB of cleaned text).
    pub const DEFAULT_MAX_LEN: usize = 8 * 1024 * 1024;

    /// Create an empty pattern buffer.
    pub fn new() -> Self {
        Self::with_max_len(Self::DEFAULT_MAX_LEN)
    }

    /// Create a pattern buffer with an explicit compaction threshold.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
            base: 0,
            max_len: max_len.max(2),
            parser: vte::Parser::new(),
        }
    }

    /// Extend the buffer with new data, stripping ANSI escape codes.
    pub fn extend(&mut self, data: &[u8]) {
        let mut sink = PlainText {
            out: &mut self.buffer,
        };
        self.parser.advance(&mut sink, data);

        if self.buffer.len() > self.max_len {
            let drop = self.buffer.len() - self.max_len / 2;
            self.buffer.drain(..drop);
            self.base += drop;
        }
    }

    /// Held text from absolute offset `from`, with the effective absolute
    /// start (offsets before the held window are clamped to it).
    pub fn slice_from(&self, from: usize) -> (usize, &[u8]) {
        let local = from.saturating_sub(self.base).min(self.buffer.len());
        (self.base + local, &self.buffer[local..])
    }

    /// Find the first match of `pattern` starting at absolute offset `from`.
    ///
    /// Returns absolute `(start, end)` offsets.
    pub fn search_from(&self, pattern: &Regex, from: usize) -> Option<(usize, usize)> {
        let (start, haystack) = self.slice_from(from);
        pattern
            .find(haystack)
            .map(|m| (start + m.start(), start + m.end()))
    }

    /// Text from absolute offset `from` to the end (lossy UTF-8).
    pub fn text_from(&self, from: usize) -> String {
        String::from_utf8_lossy(self.slice_from(from).1).into_owned()
    }

    /// The text still held in memory.
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer
    }

    /// Absolute end offset (total cleaned bytes seen).
    pub fn len(&self) -> usize {
        self.base + self.buffer.len()
    }

    /// Check if nothing has been seen yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for PatternBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for PatternBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatternBuffer")
            .field("base", &self.base)
            .field("len", &self.buffer.len())
            .finish()
    }
}

/// vte performer that keeps printable text, newlines and tabs.
struct PlainText<'a> {
    out: &'a mut Vec<u8>,
}

impl vte::Perform for PlainText<'_> {
    fn print(&mut self, c: char) {
        let mut utf8 = [0u8; 4];
        self.out
            .extend_from_slice(c.encode_utf8(&mut utf8).as_bytes());
    }

    fn execute(&mut self, byte: u8) {
        if byte == b'\n' || byte == b'\t' {
            self.out.push(byte);
        }
    }
}

/// Incremental line splitter: accumulate until newline, emit completed
/// lines, retain the remainder.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: BytesMut,
}

impl LineSplitter {
    /// Create an empty splitter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and collect every line it completes.
    ///
    /// Lines are returned without their terminator (`\n` or `\r\n`).
    pub fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        let mut scan_from = self.pending.len();
        self.pending.extend_from_slice(data);

        let mut lines = Vec::new();
        while let Some(offset) = memchr::memchr(b'\n', &self.pending[scan_from..]) {
            let newline = scan_from + offset;
            let mut line = self.pending.split_to(newline + 1);
            line.truncate(newline);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            lines.push(line.freeze());
            scan_from = 0;
        }
        lines
    }

    /// Take the undelimited remainder, if any.
    pub fn take_remainder(&mut self) -> Option<Bytes> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.pending.split().freeze())
        }
    }

    /// Bytes waiting for a newline.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Buffers for one output stream of a channel.
#[derive(Debug, Default)]
pub(crate) struct StreamBuffer {
    /// Raw bytes of the current command.
    command: Vec<u8>,

    /// Raw bytes of the whole session.
    all: Vec<u8>,

    /// Searchable text of the whole session.
    search: PatternBuffer,

    /// Offset in `search` where the current command began.
    command_start: usize,

    /// Line assembly for listeners and echo.
    lines: LineSplitter,
}

impl StreamBuffer {
    /// Append a chunk. The search view always sees it; the command and
    /// transcript views only when `retain` is set.
    pub fn push(&mut self, data: &[u8], retain: bool) {
        if retain {
            self.command.extend_from_slice(data);
            self.all.extend_from_slice(data);
        }
        self.search.extend(data);
    }

    /// Start a new command: clear the command bytes and move the search
    /// start to the current end.
    pub fn reset_command(&mut self) {
        self.command.clear();
        self.command_start = self.search.len();
    }

    /// Drop command and transcript bytes past the given lengths.
    pub fn truncate(&mut self, command_len: usize, all_len: usize) {
        self.command.truncate(command_len);
        self.all.truncate(all_len);
    }

    pub fn command(&self) -> &[u8] {
        &self.command
    }

    pub fn all(&self) -> &[u8] {
        &self.all
    }

    pub fn search(&self) -> &PatternBuffer {
        &self.search
    }

    pub fn command_start(&self) -> usize {
        self.command_start
    }

    pub fn lines_mut(&mut self) -> &mut LineSplitter {
        &mut self.lines
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_extend() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"Hello, world!");
        assert_eq!(buffer.as_slice(), b"Hello, world!");
    }

    #[test]
    fn test_ansi_stripping() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"\x1b[32mGreen text\x1b[0m\r\n");
        assert_eq!(buffer.as_slice(), b"Green text\n");
    }

    #[test]
    fn test_escape_split_across_chunks() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"one\x1b[3");
        buffer.extend(b"1mtwo");
        assert_eq!(buffer.as_slice(), b"onetwo");
    }

    #[test]
    fn test_search_from_is_absolute() {
        let mut buffer = PatternBuffer::new();
        buffer.extend(b"prompt$ ls\nprompt$ ");
        let pattern = Regex::new(r"prompt\$").unwrap();

        let (start, end) = buffer.search_from(&pattern, 0).unwrap();
        assert_eq!((start, end), (0, 7));

        let (start, _) = buffer.search_from(&pattern, end).unwrap();
        assert_eq!(start, 11);

        assert!(buffer.search_from(&pattern, 18).is_none());
        // Past-the-end cursors are clamped, not panics
        assert!(buffer.search_from(&pattern, 1000).is_none());
    }

    #[test]
    fn test_compaction_keeps_absolute_offsets() {
        let mut buffer = PatternBuffer::with_max_len(16);
        buffer.extend(b"0123456789");
        buffer.extend(b"abcdefghij");

        assert_eq!(buffer.len(), 20);
        assert!(buffer.as_slice().len() <= 16);

        let pattern = Regex::new("hij").unwrap();
        assert_eq!(buffer.search_from(&pattern, 0), Some((17, 20)));

        // Offsets before the held window clamp to its start
        let (start, _) = buffer.slice_from(0);
        assert_eq!(start, 20 - buffer.as_slice().len());
    }

    #[test]
    fn test_line_splitter() {
        let mut splitter = LineSplitter::new();
        assert!(splitter.push(b"par").is_empty());

        let lines = splitter.push(b"tial\r\nsecond\nthi");
        assert_eq!(lines, vec![Bytes::from("partial"), Bytes::from("second")]);
        assert_eq!(splitter.pending_len(), 3);

        assert_eq!(splitter.take_remainder(), Some(Bytes::from("thi")));
        assert_eq!(splitter.take_remainder(), None);
    }

    #[test]
    fn test_stream_buffer_reset_keeps_transcript() {
        let mut stream = StreamBuffer::default();
        stream.push(b"first\n", true);
        stream.reset_command();
        stream.push(b"second\n", true);
        stream.push(b"noise\n", false);

        assert_eq!(stream.command(), b"second\n");
        assert_eq!(stream.all(), b"first\nsecond\n");
        assert_eq!(stream.command_start(), 6);
        assert_eq!(
            stream.search().text_from(stream.command_start()),
            "second\nnoise\n"
        );
    }
}

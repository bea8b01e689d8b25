// src/buffer.rs
//! Fixed-capacity byte regions with bounds-checked cursors.
//!
//! The read side keeps three cursors over its bytes:
//!
//! ```text
//! 0 ≤ start_line ≤ checked_idx ≤ read_idx ≤ capacity
//! ```
//!
//! Every mutation goes through a method that asserts this ordering, so a
//! broken invariant panics at the faulty call instead of reading past the
//! filled region.

use std::fmt;

pub const READ_BUFFER_SIZE: usize = 2048;
pub const WRITE_BUFFER_SIZE: usize = 1024;

/// A parsed field: an offset and length into a [`ReadBuffer`], valid only
/// for the buffer generation it was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    start: usize,
    len: usize,
    generation: u32,
}

impl Span {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The part of this span covering `[from, to)` relative to its start.
    pub fn sub(&self, from: usize, to: usize) -> Span {
        assert!(from <= to && to <= self.len, "sub-span out of bounds");
        Span {
            start: self.start + from,
            len: to - from,
            generation: self.generation,
        }
    }
}

pub struct ReadBuffer {
    buf: Box<[u8]>,
    read_idx: usize,
    checked_idx: usize,
    start_line: usize,
    generation: u32,
}

impl ReadBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            read_idx: 0,
            checked_idx: 0,
            start_line: 0,
            generation: 0,
        }
    }

    #[inline]
    pub fn read_idx(&self) -> usize {
        self.read_idx
    }

    #[inline]
    pub fn checked_idx(&self) -> usize {
        self.checked_idx
    }

    #[inline]
    pub fn start_line(&self) -> usize {
        self.start_line
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.read_idx >= self.buf.len()
    }

    /// Unfilled tail of the buffer, to receive from the socket.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_idx..]
    }

    /// Mark `n` more bytes of the spare region as filled.
    pub fn commit(&mut self, n: usize) {
        assert!(n <= self.buf.len() - self.read_idx, "commit past capacity");
        self.read_idx += n;
    }

    /// Bytes received but not yet scanned.
    pub fn unchecked(&self) -> &[u8] {
        &self.buf[self.checked_idx..self.read_idx]
    }

    /// Filled byte at `idx`, if any.
    pub fn byte_at(&self, idx: usize) -> Option<u8> {
        (idx < self.read_idx).then(|| self.buf[idx])
    }

    /// Overwrite a filled byte with NUL.
    pub fn terminate(&mut self, idx: usize) {
        assert!(idx < self.read_idx, "terminate outside filled region");
        self.buf[idx] = 0;
    }

    pub fn set_checked(&mut self, idx: usize) {
        assert!(
            self.start_line <= idx && idx <= self.read_idx,
            "checked_idx out of order"
        );
        self.checked_idx = idx;
    }

    /// Close the current logical line at `end` (exclusive) and start the next
    /// one at `checked_idx`.
    pub fn take_line(&mut self, end: usize) -> Span {
        assert!(
            self.start_line <= end && end <= self.checked_idx,
            "line end out of order"
        );
        let span = self.span(self.start_line, end);
        self.start_line = self.checked_idx;
        span
    }

    /// Span over `[start, end)` of the filled region in the current generation.
    pub fn span(&self, start: usize, end: usize) -> Span {
        assert!(start <= end && end <= self.read_idx, "span out of bounds");
        Span {
            start,
            len: end - start,
            generation: self.generation,
        }
    }

    /// Bytes of a span, or `None` if the buffer has been reset since it was taken.
    pub fn resolve(&self, span: Span) -> Option<&[u8]> {
        if span.generation != self.generation {
            return None;
        }
        self.buf.get(span.start..span.start + span.len)
    }

    /// Start a new request. Bytes in `[consumed, read_idx)` belong to a
    /// pipelined request and move to the front; everything else is
    /// discarded and all spans taken so far go stale.
    pub fn recycle(&mut self, consumed: usize) {
        let consumed = consumed.min(self.read_idx);
        self.buf.copy_within(consumed..self.read_idx, 0);
        let tail = self.read_idx - consumed;
        self.buf[tail..].fill(0);
        self.read_idx = tail;
        self.checked_idx = 0;
        self.start_line = 0;
        self.generation = self.generation.wrapping_add(1);
    }

    /// Drop everything, pipelined bytes included.
    pub fn clear(&mut self) {
        self.recycle(self.read_idx);
    }
}

impl fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("capacity", &self.buf.len())
            .field("read_idx", &self.read_idx)
            .field("checked_idx", &self.checked_idx)
            .field("start_line", &self.start_line)
            .field("generation", &self.generation)
            .finish()
    }
}

/// Outgoing bytes. Appends either fit entirely or leave the buffer untouched.
pub struct WriteBuffer {
    buf: Box<[u8]>,
    write_idx: usize,
}

/// Returned when an append does not fit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow;

impl WriteBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity].into_boxed_slice(),
            write_idx: 0,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.write_idx
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.write_idx == 0
    }

    /// Queued bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.write_idx]
    }

    pub fn append(&mut self, bytes: &[u8]) -> Result<(), Overflow> {
        let end = self.write_idx.checked_add(bytes.len()).ok_or(Overflow)?;
        if end > self.buf.len() {
            return Err(Overflow);
        }
        self.buf[self.write_idx..end].copy_from_slice(bytes);
        self.write_idx = end;
        Ok(())
    }

    /// Append formatted text, rolling back anything partially written.
    pub fn append_fmt(&mut self, args: fmt::Arguments<'_>) -> Result<(), Overflow> {
        let mark = self.write_idx;
        if fmt::Write::write_fmt(self, args).is_err() {
            self.write_idx = mark;
            return Err(Overflow);
        }
        Ok(())
    }

    pub fn clear(&mut self) {
        self.write_idx = 0;
    }
}

impl fmt::Write for WriteBuffer {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.append(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

impl fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("capacity", &self.buf.len())
            .field("write_idx", &self.write_idx)
            .finish()
    }
}

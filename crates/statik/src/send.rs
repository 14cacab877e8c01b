// src/send.rs
use std::io;
use std::ops::Range;
use std::os::fd::RawFd;

use crate::error::Result;
use crate::resolver::MappedFile;
use crate::syscalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flush {
    /// Every byte of the response reached the socket.
    Done,
    /// The socket buffer filled up; call again on the next write readiness.
    WouldBlock,
}

/// Progress of one response across non-blocking vectored writes.
///
/// Output is at most two segments: the unsent tail of the write buffer,
/// then the unsent tail of the mapped file. File bytes are handed to the
/// kernel straight from the mapping.
#[derive(Debug, Default)]
pub struct SendState {
    header: Range<usize>,
    header_total: usize,
    file: Option<MappedFile>,
    body_offset: usize,
    bytes_sent: usize,
    total: usize,
}

impl SendState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Arm for a response whose first `header_len` bytes sit in the write
    /// buffer, optionally followed by `file`.
    pub fn start(&mut self, header_len: usize, file: Option<MappedFile>) {
        debug_assert!(self.file.is_none(), "previous mapping not released");
        let body_len = file.as_ref().map_or(0, MappedFile::len);
        *self = Self {
            header: 0..header_len,
            header_total: header_len,
            file,
            body_offset: 0,
            bytes_sent: 0,
            total: header_len + body_len,
        };
    }

    pub fn bytes_sent(&self) -> usize {
        self.bytes_sent
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn bytes_remaining(&self) -> usize {
        self.total - self.bytes_sent
    }

    pub fn has_mapping(&self) -> bool {
        self.file.is_some()
    }

    pub fn segment_count(&self) -> usize {
        1 + usize::from(self.file.is_some())
    }

    /// Remaining bytes of each segment, in send order. Only the first
    /// `segment_count()` entries are meaningful.
    pub fn segments<'a>(&'a self, write_buf: &'a [u8]) -> [&'a [u8]; 2] {
        let body = self
            .file
            .as_ref()
            .map_or(&[][..], |f| &f.as_bytes()[self.body_offset..]);
        [&write_buf[self.header.clone()], body]
    }

    /// Account for `n` more bytes accepted by the kernel.
    pub fn advance(&mut self, n: usize) {
        self.bytes_sent = (self.bytes_sent + n).min(self.total);
        if self.bytes_sent >= self.header_total {
            self.header = self.header_total..self.header_total;
            self.body_offset = self.bytes_sent - self.header_total;
        } else {
            self.header.start = self.bytes_sent;
        }
    }

    /// Write until done or would-block. State is left exactly where the
    /// kernel stopped accepting bytes.
    pub fn flush(&mut self, fd: RawFd, write_buf: &[u8]) -> Result<Flush> {
        while self.bytes_remaining() > 0 {
            let segments = self.segments(write_buf);
            match syscalls::writev_nonblocking(fd, &segments[..self.segment_count()])? {
                None => return Ok(Flush::WouldBlock),
                Some(0) => return Err(io::Error::from(io::ErrorKind::WriteZero).into()),
                Some(n) => self.advance(n),
            }
        }
        Ok(Flush::Done)
    }

    /// Give up the mapping, if any. Dropping the returned value unmaps it.
    pub fn release(&mut self) -> Option<MappedFile> {
        self.file.take()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

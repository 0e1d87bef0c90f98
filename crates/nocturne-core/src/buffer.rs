// src/buffer.rs
//! Growable byte buffer with independent read and write cursors.
//!
//! ```text
//! +-------------+------------------+------------------+
//! | prependable |     readable     |     writable     |
//! +-------------+------------------+------------------+
//! 0        read_pos          write_pos            len()
//! ```
//!
//! The first [`CHEAP_PREPEND`] bytes are reserved. Space freed by reads is
//! reclaimed by compaction before the storage is ever reallocated.

use libc::{c_int, c_void};
use std::io;

pub const CHEAP_PREPEND: usize = 8;
pub const INITIAL_SIZE: usize = 1024;

/// Overflow region used by [`ByteBuffer::read_fd`] for bytes that do not fit
/// the current writable tail.
const STACK_READ_SIZE: usize = 65535;

#[derive(Debug, Clone)]
pub struct ByteBuffer {
    storage: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl ByteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SIZE)
    }

    pub fn with_capacity(initial: usize) -> Self {
        Self {
            storage: vec![0; CHEAP_PREPEND + initial],
            read_pos: CHEAP_PREPEND,
            write_pos: CHEAP_PREPEND,
        }
    }

    #[inline]
    pub fn readable_bytes(&self) -> usize {
        self.write_pos - self.read_pos
    }

    #[inline]
    pub fn writable_bytes(&self) -> usize {
        self.storage.len() - self.write_pos
    }

    #[inline]
    pub fn prependable_bytes(&self) -> usize {
        self.read_pos
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Total size of the backing storage.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage.len()
    }

    /// The unread region, starting at the next byte to read.
    #[inline]
    pub fn peek(&self) -> &[u8] {
        &self.storage[self.read_pos..self.write_pos]
    }

    /// The writable tail. Call [`has_written`](Self::has_written) after filling it.
    #[inline]
    pub fn begin_write(&mut self) -> &mut [u8] {
        &mut self.storage[self.write_pos..]
    }

    pub fn has_written(&mut self, len: usize) {
        debug_assert!(len <= self.writable_bytes());
        self.write_pos = (self.write_pos + len).min(self.storage.len());
    }

    /// Advance the read cursor by `len` bytes.
    pub fn retrieve(&mut self, len: usize) {
        debug_assert!(len <= self.readable_bytes());
        if len >= self.readable_bytes() {
            self.retrieve_all();
        } else {
            self.read_pos += len;
        }
    }

    /// Advance the read cursor up to `end`, an offset into [`peek`](Self::peek).
    pub fn retrieve_until(&mut self, end: usize) {
        debug_assert!(end <= self.readable_bytes(), "retrieve_until past write cursor");
        self.retrieve(end);
    }

    pub fn retrieve_all(&mut self) {
        self.read_pos = CHEAP_PREPEND;
        self.write_pos = CHEAP_PREPEND;
    }

    pub fn retrieve_all_to_string(&mut self) -> String {
        let s = String::from_utf8_lossy(self.peek()).into_owned();
        self.retrieve_all();
        s
    }

    pub fn append(&mut self, data: &[u8]) {
        self.ensure_writable(data.len());
        self.storage[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    pub fn append_str(&mut self, s: &str) {
        self.append(s.as_bytes());
    }

    pub fn ensure_writable(&mut self, len: usize) {
        if self.writable_bytes() < len {
            self.make_space(len);
        }
        debug_assert!(self.writable_bytes() >= len);
    }

    fn make_space(&mut self, len: usize) {
        let reclaimable = self.read_pos - CHEAP_PREPEND;
        if reclaimable + self.writable_bytes() < len {
            self.storage.resize(self.write_pos + len + 1, 0);
        } else {
            let readable = self.readable_bytes();
            self.storage
                .copy_within(self.read_pos..self.write_pos, CHEAP_PREPEND);
            self.read_pos = CHEAP_PREPEND;
            self.write_pos = CHEAP_PREPEND + readable;
        }
    }

    /// Scatter-read from `fd` into the writable tail plus a stack overflow
    /// region, in a single `readv`. Returns the number of bytes read; `Ok(0)`
    /// means end of stream.
    pub fn read_fd(&mut self, fd: c_int) -> io::Result<usize> {
        let mut extra = [0u8; STACK_READ_SIZE];
        let writable = self.writable_bytes();
        let iov = [
            libc::iovec {
                iov_base: self.begin_write().as_mut_ptr() as *mut c_void,
                iov_len: writable,
            },
            libc::iovec {
                iov_base: extra.as_mut_ptr() as *mut c_void,
                iov_len: extra.len(),
            },
        ];

        // SAFETY: both iovecs point to live, exclusively borrowed memory of the stated length.
        let res = unsafe { libc::readv(fd, iov.as_ptr(), iov.len() as c_int) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }

        let n = res as usize;
        if n <= writable {
            self.write_pos += n;
        } else {
            self.write_pos = self.storage.len();
            self.append(&extra[..n - writable]);
        }
        Ok(n)
    }

    /// Write the readable region to `fd` once, advancing the read cursor by
    /// however many bytes the kernel accepted.
    pub fn write_fd(&mut self, fd: c_int) -> io::Result<usize> {
        let readable = self.peek();
        // SAFETY: the slice is valid for `readable.len()` bytes.
        let res = unsafe { libc::write(fd, readable.as_ptr() as *const c_void, readable.len()) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        self.retrieve(res as usize);
        Ok(res as usize)
    }
}

impl Default for ByteBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl io::Write for ByteBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;

    fn check_invariants(buf: &ByteBuffer) {
        assert!(buf.read_pos <= buf.write_pos);
        assert!(buf.write_pos <= buf.storage.len());
        assert!(buf.read_pos >= CHEAP_PREPEND);
        assert_eq!(buf.readable_bytes(), buf.write_pos - buf.read_pos);
    }

    #[test]
    fn test_append_and_retrieve() {
        let mut buf = ByteBuffer::new();
        assert_eq!(buf.readable_bytes(), 0);
        assert_eq!(buf.writable_bytes(), INITIAL_SIZE);
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);

        buf.append(b"hello world");
        assert_eq!(buf.peek(), b"hello world");

        buf.retrieve(6);
        assert_eq!(buf.peek(), b"world");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND + 6);

        assert_eq!(buf.retrieve_all_to_string(), "world");
        assert!(buf.is_empty());
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_invariants(&buf);
    }

    #[test]
    fn test_compaction_preferred_over_growth() {
        let mut buf = ByteBuffer::with_capacity(16);
        buf.append(b"0123456789abcdef");
        buf.retrieve(10);
        let before = buf.capacity();

        // 10 reclaimable bytes cover an 8 byte append.
        buf.append(b"ABCDEFGH");
        assert_eq!(buf.capacity(), before);
        assert_eq!(buf.peek(), b"abcdefABCDEFGH");
        assert_eq!(buf.prependable_bytes(), CHEAP_PREPEND);
        check_invariants(&buf);
    }

    #[test]
    fn test_growth_when_slack_insufficient() {
        let mut buf = ByteBuffer::with_capacity(4);
        buf.append(b"abcd");
        buf.append(b"efghijkl");
        assert_eq!(buf.peek(), b"abcdefghijkl");
        assert!(buf.capacity() >= CHEAP_PREPEND + 12);
        check_invariants(&buf);
    }

    #[test]
    fn test_retrieve_until() {
        let mut buf = ByteBuffer::new();
        buf.append(b"line one\r\nline two");
        let end = buf.peek().windows(2).position(|w| w == b"\r\n").unwrap();
        buf.retrieve_until(end + 2);
        assert_eq!(buf.peek(), b"line two");
    }

    #[test]
    fn test_interleaved_round_trip() {
        // xorshift keeps the sequence reproducible.
        let mut state = 0x9E37_79B9_7F4A_7C15u64;
        let mut next = move || {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            state
        };

        let mut buf = ByteBuffer::with_capacity(32);
        let mut expected = Vec::new();
        let mut produced = Vec::new();
        let mut counter = 0u8;

        for _ in 0..2_000 {
            if next() % 3 == 0 && !buf.is_empty() {
                let n = (next() as usize) % (buf.readable_bytes() + 1);
                produced.extend_from_slice(&buf.peek()[..n]);
                buf.retrieve(n);
            } else {
                let len = (next() as usize) % 97;
                let chunk: Vec<u8> = (0..len)
                    .map(|_| {
                        counter = counter.wrapping_add(1);
                        counter
                    })
                    .collect();
                expected.extend_from_slice(&chunk);
                buf.append(&chunk);
            }
            check_invariants(&buf);
        }
        produced.extend_from_slice(buf.peek());
        assert_eq!(produced, expected);
    }

    #[test]
    fn test_read_fd_overflows_into_stack_region() {
        let (mut tx, rx) = UnixStream::pair().unwrap();
        let payload: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
        tx.write_all(&payload).unwrap();

        let mut buf = ByteBuffer::with_capacity(64);
        let n = buf.read_fd(rx.as_raw_fd()).unwrap();
        assert_eq!(n, payload.len());
        assert_eq!(buf.peek(), &payload[..]);
        check_invariants(&buf);
    }

    #[test]
    fn test_read_fd_end_of_stream() {
        let (tx, rx) = UnixStream::pair().unwrap();
        drop(tx);
        let mut buf = ByteBuffer::new();
        assert_eq!(buf.read_fd(rx.as_raw_fd()).unwrap(), 0);
    }

    #[test]
    fn test_write_fd_advances_by_accepted_bytes() {
        let (tx, mut rx) = UnixStream::pair().unwrap();
        let mut buf = ByteBuffer::new();
        buf.append(b"GET / HTTP/1.1\r\n\r\n");

        let n = buf.write_fd(tx.as_raw_fd()).unwrap();
        assert_eq!(n, 18);
        assert!(buf.is_empty());

        let mut out = [0u8; 18];
        rx.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"GET / HTTP/1.1\r\n\r\n");
    }

    #[test]
    fn test_io_write_impl() {
        let mut buf = ByteBuffer::new();
        write!(buf, "HTTP/1.1 {} {}\r\n", 200, "OK").unwrap();
        assert_eq!(buf.peek(), b"HTTP/1.1 200 OK\r\n");
    }
}

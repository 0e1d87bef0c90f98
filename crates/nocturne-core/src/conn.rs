// src/conn.rs
use crate::auth::Authenticator;
use crate::buffer::ByteBuffer;
use crate::parser::{HttpRequest, ParseError};
use crate::response::HttpResponse;
use crate::syscalls;
use libc::c_int;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Level-triggered writes keep going while more than this much is pending.
const WRITE_CONTINUE_THRESHOLD: usize = 10 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnState {
    #[default]
    Reading = 0,
    Writing = 1,
    Closed = 2,
}

/// One accepted socket with its buffers, parser and staged response.
///
/// The response is written as two regions: the header block in `write_buf`
/// and the mapped file, of which `file_offset` bytes have already been sent.
pub struct Connection {
    fd: c_int,
    peer: SocketAddr,
    state: ConnState,
    read_buf: ByteBuffer,
    write_buf: ByteBuffer,
    request: HttpRequest,
    response: HttpResponse,
    file_offset: usize,
    keep_alive: bool,
}

impl Connection {
    pub fn new(
        fd: c_int,
        peer: SocketAddr,
        doc_root: Arc<Path>,
        idle_timeout: Option<Duration>,
        max_request_bytes: usize,
    ) -> Self {
        Self {
            fd,
            peer,
            state: ConnState::Reading,
            read_buf: ByteBuffer::new(),
            write_buf: ByteBuffer::new(),
            request: HttpRequest::with_limit(max_request_bytes),
            response: HttpResponse::new(doc_root, idle_timeout),
            file_offset: 0,
            keep_alive: false,
        }
    }

    pub fn fd(&self) -> c_int {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnState::Closed
    }

    pub fn is_keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Bytes still buffered from the peer and not yet parsed.
    pub fn pending_input(&self) -> usize {
        self.read_buf.readable_bytes()
    }

    /// Read what the socket has. Edge-triggered mode drains it until it
    /// would block; otherwise a single read is made.
    ///
    /// End of stream is reported as [`io::ErrorKind::UnexpectedEof`].
    pub fn read(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0;
        loop {
            match self.read_buf.read_fd(self.fd) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => total += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            }
            if !edge_triggered {
                break;
            }
        }
        Ok(total)
    }

    /// Parse buffered input and stage a response. Returns `false` when no
    /// complete request is available yet.
    pub fn process(&mut self, auth: &dyn Authenticator) -> bool {
        if self.read_buf.is_empty() {
            return false;
        }

        let code = match self.request.parse(&mut self.read_buf, auth) {
            Ok(()) => {
                self.keep_alive = self.request.is_keep_alive();
                self.response
                    .init(self.request.path(), self.keep_alive, 200);
                200
            }
            Err(ParseError::Incomplete) => return false,
            Err(e) => {
                tracing::warn!(fd = self.fd, peer = %self.peer, error = %e, "bad request");
                // The rest of the input cannot be framed once parsing failed.
                self.read_buf.retrieve_all();
                self.keep_alive = false;
                self.response.init("", false, 400);
                400
            }
        };

        self.response.make_response(&mut self.write_buf);
        self.file_offset = 0;
        self.state = ConnState::Writing;
        tracing::debug!(
            fd = self.fd,
            code,
            status = self.response.code(),
            file_len = self.response.file_len(),
            "response ready"
        );
        true
    }

    /// Bytes of the staged response not yet accepted by the kernel.
    pub fn to_write_bytes(&self) -> usize {
        self.write_buf.readable_bytes() + self.response.file_len() - self.file_offset
    }

    /// Gather-write the header block and the rest of the file.
    ///
    /// Stops when everything is sent, when the socket would block, or (when
    /// level-triggered) once the remainder is small. Returns the bytes sent by
    /// this call.
    pub fn write(&mut self, edge_triggered: bool) -> io::Result<usize> {
        let mut total = 0;
        loop {
            let head = self.write_buf.readable_bytes();
            let res = {
                let file = &self.response.file()[self.file_offset..];
                syscalls::writev(self.fd, &[self.write_buf.peek(), file])
            };
            let n = match res {
                Ok(0) if self.to_write_bytes() > 0 => {
                    return Err(io::ErrorKind::WriteZero.into());
                }
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(e),
            };

            if n >= head {
                self.write_buf.retrieve_all();
                self.file_offset += n - head;
            } else {
                self.write_buf.retrieve(n);
            }
            total += n;

            let remaining = self.to_write_bytes();
            if remaining == 0 {
                self.response.unmap();
                self.file_offset = 0;
                self.state = ConnState::Reading;
                break;
            }
            if !edge_triggered && remaining <= WRITE_CONTINUE_THRESHOLD {
                break;
            }
        }
        Ok(total)
    }

    /// Release the socket and any mapping. Returns `true` only for the call
    /// that actually closed it.
    pub fn close(&mut self) -> bool {
        if self.state == ConnState::Closed {
            return false;
        }
        self.state = ConnState::Closed;
        self.response.unmap();
        self.read_buf.retrieve_all();
        self.write_buf.retrieve_all();
        syscalls::close_fd(self.fd);
        true
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::RejectAll;
    use std::fs;
    use std::io::{Read, Write};
    use std::os::unix::fs::PermissionsExt;
    use std::os::unix::io::IntoRawFd;
    use std::os::unix::net::UnixStream;

    fn setup(files: &[(&str, &[u8])]) -> (tempfile::TempDir, Connection, UnixStream) {
        let dir = tempfile::tempdir().unwrap();
        for (name, body) in files {
            let path = dir.path().join(name);
            fs::write(&path, body).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();
        }
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        let conn = Connection::new(
            ours.into_raw_fd(),
            "127.0.0.1:9".parse().unwrap(),
            Arc::from(dir.path()),
            Some(Duration::from_secs(60)),
            4096,
        );
        (dir, conn, theirs)
    }

    fn read_response(peer: &mut UnixStream, len: usize) -> Vec<u8> {
        let mut out = vec![0u8; len];
        peer.read_exact(&mut out).unwrap();
        out
    }

    #[test]
    fn test_request_response_cycle() {
        let (_dir, mut conn, mut peer) = setup(&[("index.html", &b"hello"[..])]);
        peer.write_all(b"GET / HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();

        assert_eq!(conn.read(true).unwrap(), 42);
        assert!(conn.process(&RejectAll));
        assert!(conn.is_keep_alive());
        assert_eq!(conn.state(), ConnState::Writing);

        let pending = conn.to_write_bytes();
        assert_eq!(conn.write(true).unwrap(), pending);
        assert_eq!(conn.to_write_bytes(), 0);
        assert_eq!(conn.state(), ConnState::Reading);

        let text = String::from_utf8(read_response(&mut peer, pending)).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));
    }

    #[test]
    fn test_incomplete_request_waits() {
        let (_dir, mut conn, mut peer) = setup(&[("index.html", &b"x"[..])]);
        peer.write_all(b"GET / HTTP/1.1\r\nHost:").unwrap();
        conn.read(false).unwrap();
        assert!(!conn.process(&RejectAll));
        assert_eq!(conn.state(), ConnState::Reading);

        peer.write_all(b" a\r\n\r\n").unwrap();
        conn.read(false).unwrap();
        assert!(conn.process(&RejectAll));
    }

    #[test]
    fn test_bad_request_closes_after_response() {
        let (_dir, mut conn, mut peer) = setup(&[]);
        peer.write_all(b"BADLINE\r\n\r\n").unwrap();
        conn.read(true).unwrap();
        assert!(conn.process(&RejectAll));
        assert!(!conn.is_keep_alive());
        assert_eq!(conn.pending_input(), 0);

        let pending = conn.to_write_bytes();
        conn.write(true).unwrap();
        let text = String::from_utf8(read_response(&mut peer, pending)).unwrap();
        assert!(text.starts_with("HTTP/1.1 400 Bad Request\r\n"));
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn test_partial_writes_resume() {
        let big: Vec<u8> = (0..2 * 1024 * 1024u32).map(|i| (i % 253) as u8).collect();
        let (_dir, mut conn, mut peer) = setup(&[("big.gz", &big[..])]);
        peer.write_all(b"GET /big.gz HTTP/1.1\r\n\r\n").unwrap();
        conn.read(true).unwrap();
        assert!(conn.process(&RejectAll));

        let total = conn.to_write_bytes();
        let reader = std::thread::spawn(move || read_response(&mut peer, total));

        let mut sent = 0;
        while conn.to_write_bytes() > 0 {
            sent += conn.write(true).unwrap();
            std::thread::yield_now();
        }
        assert_eq!(sent, total);

        let received = reader.join().unwrap();
        let body_at = received.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        assert_eq!(&received[body_at..], &big[..]);
    }

    #[test]
    fn test_peer_close_is_eof() {
        let (_dir, mut conn, peer) = setup(&[]);
        drop(peer);
        let err = conn.read(true).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (_dir, mut conn, _peer) = setup(&[]);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
    }
}

// src/syscalls.rs
use crate::error::NocturneResult;
use libc::{c_int, c_void, socklen_t};
use std::fs::File;
use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr;
use std::time::Duration;

// ---- Socket Operations ----

/// Create a non-blocking TCP listener bound to `host:port`.
///
/// With `linger` set, closing an accepted socket waits up to one second for
/// unsent data instead of discarding it.
pub fn create_listen_socket(host: &str, port: u16, linger: bool) -> NocturneResult<c_int> {
    let addr_str = format!("{}:{}", host, port);
    let addr: SocketAddr = addr_str
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let domain = if addr.is_ipv6() {
        libc::AF_INET6
    } else {
        libc::AF_INET
    };

    let fd = unsafe {
        // 1. Atomic non-blocking, close-on-exec socket
        let fd = libc::socket(
            domain,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }

        // 2. SO_LINGER, inherited by accepted sockets
        let opt_linger = libc::linger {
            l_onoff: linger as c_int,
            l_linger: linger as c_int,
        };
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &opt_linger as *const _ as *const c_void,
            mem::size_of_val(&opt_linger) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 3. SO_REUSEADDR so a restart can bind over TIME_WAIT sockets
        let one: c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }

        // 4. TCP_NODELAY on listener, inherited by accepted sockets.
        // Best-effort: without it responses are only delayed, not wrong.
        if libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            tracing::debug!(error = %io::Error::last_os_error(), "TCP_NODELAY not set");
        }

        fd
    };

    // 5. Bind
    bind_addr(fd, &addr)?;

    // 6. Listen
    unsafe {
        if libc::listen(fd, libc::SOMAXCONN) < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
    }

    Ok(fd)
}

/// Bind a socket to an address, closing it on failure.
fn bind_addr(fd: c_int, addr: &SocketAddr) -> NocturneResult<()> {
    unsafe {
        let res = match addr {
            SocketAddr::V4(a) => {
                let sin = libc::sockaddr_in {
                    sin_family: libc::AF_INET as libc::sa_family_t,
                    sin_port: a.port().to_be(),
                    sin_addr: libc::in_addr {
                        s_addr: u32::from_ne_bytes(a.ip().octets()),
                    },
                    sin_zero: [0; 8],
                };
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin) as socklen_t,
                )
            }
            SocketAddr::V6(a) => {
                let sin6 = libc::sockaddr_in6 {
                    sin6_family: libc::AF_INET6 as libc::sa_family_t,
                    sin6_port: a.port().to_be(),
                    sin6_flowinfo: a.flowinfo(),
                    sin6_addr: libc::in6_addr {
                        s6_addr: a.ip().octets(),
                    },
                    sin6_scope_id: a.scope_id(),
                };
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    mem::size_of_val(&sin6) as socklen_t,
                )
            }
        };
        if res < 0 {
            let err = io::Error::last_os_error();
            libc::close(fd);
            return Err(err.into());
        }
    }
    Ok(())
}

/// Result of one `accept4` attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Accepted {
    Conn(c_int, SocketAddr),
    /// Nothing was accepted but the backlog may still hold connections, e.g.
    /// the peer reset before we got to it or the call was interrupted.
    Retry,
    /// The backlog is empty.
    Drained,
}

/// Accept a pending connection as a non-blocking socket.
pub fn accept_connection(listen_fd: c_int) -> NocturneResult<Accepted> {
    unsafe {
        let mut storage: libc::sockaddr_storage = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
        let fd = libc::accept4(
            listen_fd,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );

        if fd < 0 {
            let err = io::Error::last_os_error();
            return match err.kind() {
                io::ErrorKind::WouldBlock => Ok(Accepted::Drained),
                io::ErrorKind::ConnectionAborted | io::ErrorKind::Interrupted => Ok(Accepted::Retry),
                _ => Err(err.into()),
            };
        }

        Ok(Accepted::Conn(fd, sockaddr_to_std(&storage)))
    }
}

fn sockaddr_to_std(storage: &libc::sockaddr_storage) -> SocketAddr {
    match storage.ss_family as c_int {
        libc::AF_INET6 => {
            // SAFETY: ss_family says the storage holds a sockaddr_in6.
            let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            SocketAddr::V6(SocketAddrV6::new(
                Ipv6Addr::from(sin6.sin6_addr.s6_addr),
                u16::from_be(sin6.sin6_port),
                sin6.sin6_flowinfo,
                sin6.sin6_scope_id,
            ))
        }
        _ => {
            // SAFETY: listeners are AF_INET or AF_INET6 only.
            let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr)),
                u16::from_be(sin.sin_port),
            ))
        }
    }
}

/// Best-effort send on a socket that is about to be dropped.
pub fn send_and_close(fd: c_int, msg: &[u8]) {
    unsafe {
        libc::send(fd, msg.as_ptr() as *const c_void, msg.len(), libc::MSG_NOSIGNAL);
        libc::close(fd);
    }
}

pub fn close_fd(fd: c_int) {
    unsafe {
        libc::close(fd);
    }
}

/// Ignore SIGPIPE process-wide so writes to a reset peer return EPIPE.
pub fn ignore_sigpipe() {
    unsafe {
        libc::signal(libc::SIGPIPE, libc::SIG_IGN);
    }
}

/// Vectored write: gather several buffers into a single syscall.
/// Empty slices are skipped. Errors (including `WouldBlock`) are returned as is.
pub fn writev(fd: c_int, bufs: &[&[u8]]) -> io::Result<usize> {
    let mut iovecs: [libc::iovec; 4] = unsafe { mem::zeroed() };
    let mut count = 0;
    for buf in bufs.iter().filter(|b| !b.is_empty()).take(iovecs.len()) {
        iovecs[count] = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
        count += 1;
    }
    if count == 0 {
        return Ok(0);
    }

    let res = unsafe { libc::writev(fd, iovecs.as_ptr(), count as c_int) };
    if res < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res as usize)
    }
}

// ---- Self-pipe Wakeup ----

/// Non-blocking pipe used to interrupt a blocked [`Multiplexer::wait`].
pub struct Waker {
    read_fd: c_int,
    write_fd: c_int,
}

impl Waker {
    pub fn new() -> NocturneResult<Self> {
        let mut fds = [0 as c_int; 2];
        unsafe {
            if libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(Self {
            read_fd: fds[0],
            write_fd: fds[1],
        })
    }

    pub fn read_fd(&self) -> c_int {
        self.read_fd
    }

    pub fn wake(&self) {
        let byte = 1u8;
        unsafe {
            libc::write(self.write_fd, &byte as *const u8 as *const c_void, 1);
        }
    }

    /// Consume pending wakeups.
    pub fn drain(&self) {
        let mut buf = [0u8; 64];
        loop {
            let n = unsafe { libc::read(self.read_fd, buf.as_mut_ptr() as *mut c_void, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for Waker {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read_fd);
            libc::close(self.write_fd);
        }
    }
}

// ---- Epoll Operations ----

/// Readiness interest / event mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u32);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(libc::EPOLLIN as u32);
    pub const WRITABLE: Interest = Interest(libc::EPOLLOUT as u32);
    pub const PEER_CLOSED: Interest = Interest(libc::EPOLLRDHUP as u32);
    pub const HANG_UP: Interest = Interest(libc::EPOLLHUP as u32);
    pub const ERROR: Interest = Interest(libc::EPOLLERR as u32);
    pub const EDGE: Interest = Interest(libc::EPOLLET as u32);
    pub const ONESHOT: Interest = Interest(libc::EPOLLONESHOT as u32);

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn from_bits(bits: u32) -> Self {
        Interest(bits)
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub fn is_readable(self) -> bool {
        self.intersects(Self::READABLE)
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Self::WRITABLE)
    }

    /// Peer half-close, hang-up or socket error.
    pub fn is_closed(self) -> bool {
        self.intersects(Self::PEER_CLOSED | Self::HANG_UP | Self::ERROR)
    }

    pub fn is_edge_triggered(self) -> bool {
        self.intersects(Self::EDGE)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Event {
    pub token: u64,
    pub readiness: Interest,
}

/// Reusable buffer for [`Multiplexer::wait`] results.
pub struct Events {
    raw: Vec<libc::epoll_event>,
    len: usize,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            raw: vec![libc::epoll_event { events: 0, u64: 0 }; capacity.max(1)],
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn get(&self, i: usize) -> Option<Event> {
        if i >= self.len {
            return None;
        }
        let raw = self.raw[i];
        Some(Event {
            token: raw.u64,
            readiness: Interest(raw.events),
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = Event> + '_ {
        (0..self.len).filter_map(move |i| self.get(i))
    }
}

/// Thin wrapper over an epoll instance. All methods take `&self`; the
/// underlying `epoll_ctl` calls are safe to issue from any thread.
pub struct Multiplexer {
    fd: c_int,
}

impl Multiplexer {
    pub fn new() -> NocturneResult<Self> {
        let fd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(Self { fd })
    }

    pub fn add(&self, fd: c_int, token: u64, interest: Interest) -> NocturneResult<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interest)
    }

    /// Replace the interest set of `fd`; this is also how a one-shot
    /// registration is re-armed.
    pub fn modify(&self, fd: c_int, token: u64, interest: Interest) -> NocturneResult<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interest)
    }

    pub fn delete(&self, fd: c_int) -> NocturneResult<()> {
        unsafe {
            if libc::epoll_ctl(self.fd, libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    fn ctl(&self, op: c_int, fd: c_int, token: u64, interest: Interest) -> NocturneResult<()> {
        let mut event = libc::epoll_event {
            events: interest.bits(),
            u64: token,
        };
        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }

    /// Block until at least one registered descriptor is ready or `timeout`
    /// elapses (`None` waits indefinitely). Sub-millisecond timeouts round up
    /// so an almost-due deadline does not spin.
    pub fn wait(&self, events: &mut Events, timeout: Option<Duration>) -> NocturneResult<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => {
                let ms = d.as_millis() + u128::from(d.subsec_nanos() % 1_000_000 != 0);
                ms.min(c_int::MAX as u128) as c_int
            }
        };

        let res = unsafe {
            libc::epoll_wait(
                self.fd,
                events.raw.as_mut_ptr(),
                events.raw.len() as c_int,
                timeout_ms,
            )
        };

        if res < 0 {
            let err = io::Error::last_os_error();
            events.len = 0;
            if err.raw_os_error() == Some(libc::EINTR) {
                return Ok(0);
            }
            return Err(err.into());
        }

        events.len = res as usize;
        Ok(events.len)
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

// ---- Memory-mapped Files ----

/// Read-only private mapping of a whole file. The mapping is released when
/// the value is dropped.
pub struct MappedFile {
    ptr: *mut c_void,
    len: usize,
}

// SAFETY: the mapping is read-only and owned exclusively by this value.
unsafe impl Send for MappedFile {}
unsafe impl Sync for MappedFile {}

impl MappedFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len() as usize;
        if len == 0 {
            return Ok(Self {
                ptr: ptr::null_mut(),
                len: 0,
            });
        }

        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_PRIVATE,
                file.as_raw_fd(),
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        // The mapping stays valid after the descriptor closes with `file`.
        Ok(Self { ptr, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.ptr.is_null() {
            return &[];
        }
        // SAFETY: ptr..ptr+len is a live PROT_READ mapping until drop.
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for MappedFile {
    fn drop(&mut self) {
        if !self.ptr.is_null() {
            unsafe {
                libc::munmap(self.ptr, self.len);
            }
        }
    }
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile").field("len", &self.len).finish()
    }
}

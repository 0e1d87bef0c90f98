// src/server.rs
use crate::auth::Authenticator;
use crate::config::{ServerConfig, TriggerMode};
use crate::conn::Connection;
use crate::error::{NocturneError, NocturneResult};
use crate::metrics::ServerMetrics;
use crate::pool::WorkerPool;
use crate::slab::{ConnId, ConnectionSlab};
use crate::syscalls::{self, Accepted, Events, Interest, Multiplexer, Waker};
use crate::timer::TimerHeap;
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, TryLockError};
use std::time::Duration;

const LISTEN_TOKEN: u64 = u64::MAX;
const WAKER_TOKEN: u64 = u64::MAX - 1;

const BUSY_MESSAGE: &[u8] = b"Server busy!";

/// Registry entry. `busy` is set while a worker task owns the connection's
/// turn; finding it already set means two tasks overlapped.
struct ConnCell {
    busy: AtomicBool,
    conn: Mutex<Connection>,
}

impl ConnCell {
    fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// State reachable from worker tasks and timer callbacks.
struct Shared {
    poller: Multiplexer,
    registry: RwLock<ConnectionSlab<Arc<ConnCell>>>,
    metrics: Arc<ServerMetrics>,
    auth: Arc<dyn Authenticator>,
    closed_tx: Sender<ConnId>,
    waker: Arc<Waker>,
    conn_interest: Interest,
    conn_edge: bool,
}

impl Shared {
    fn lookup(&self, id: ConnId) -> Option<Arc<ConnCell>> {
        let registry = self.registry.read().unwrap_or_else(|e| e.into_inner());
        registry.get(id).cloned()
    }

    /// Close `id` if it is still live. Stale handles are ignored.
    fn close(&self, id: ConnId) {
        if let Some(cell) = self.lookup(id) {
            let mut conn = cell.lock();
            self.close_locked(id, &mut conn);
        }
    }

    fn close_locked(&self, id: ConnId, conn: &mut Connection) {
        if conn.is_closed() {
            return;
        }
        if let Err(e) = self.poller.delete(conn.fd()) {
            tracing::debug!(conn = %id, error = %e, "deregister failed");
        }
        let fd = conn.fd();
        if conn.close() {
            self.metrics.dec_conn();
            tracing::info!(conn = %id, fd, live = self.metrics.live(), "client quit");
            // The reactor frees the slot and timer on its next cycle.
            let _ = self.closed_tx.send(id);
            self.waker.wake();
        }
    }

    /// Close an idle connection from the reactor without ever waiting on it.
    /// Returns `false` when a task currently owns the connection; the caller
    /// keeps it alive for another timeout period.
    fn try_expire(&self, id: ConnId) -> bool {
        let Some(cell) = self.lookup(id) else {
            return true;
        };
        if cell.busy.load(Ordering::Acquire) {
            return false;
        }
        let mut conn = match cell.conn.try_lock() {
            Ok(conn) => conn,
            Err(TryLockError::Poisoned(e)) => e.into_inner(),
            Err(TryLockError::WouldBlock) => return false,
        };
        if cell.busy.load(Ordering::Acquire) {
            return false;
        }
        tracing::debug!(conn = %id, "idle timeout");
        self.close_locked(id, &mut conn);
        true
    }

    fn claim(&self, id: ConnId, cell: &ConnCell) -> bool {
        if cell.busy.swap(true, Ordering::AcqRel) {
            self.metrics.inc_overlap();
            tracing::error!(conn = %id, "connection already owned by another task");
            return false;
        }
        true
    }

    fn on_read(&self, id: ConnId) {
        let Some(cell) = self.lookup(id) else {
            return;
        };
        if !self.claim(id, &cell) {
            return;
        }
        let mut conn = cell.lock();
        if conn.is_closed() {
            cell.busy.store(false, Ordering::Release);
            return;
        }

        if let Err(e) = conn.read(self.conn_edge) {
            tracing::debug!(conn = %id, error = %e, "read ended");
            self.close_locked(id, &mut conn);
            cell.busy.store(false, Ordering::Release);
            return;
        }
        self.on_process(id, &cell, conn);
    }

    /// Stage a response if a full request is buffered, then hand the turn
    /// back by re-arming for writing or for more input.
    fn on_process(&self, id: ConnId, cell: &ConnCell, mut conn: MutexGuard<'_, Connection>) {
        let interest = if conn.process(self.auth.as_ref()) {
            self.metrics.inc_req();
            Interest::WRITABLE
        } else {
            Interest::READABLE
        };
        cell.busy.store(false, Ordering::Release);
        self.rearm(id, &mut conn, interest);
    }

    fn on_write(&self, id: ConnId) {
        let Some(cell) = self.lookup(id) else {
            return;
        };
        if !self.claim(id, &cell) {
            return;
        }
        let mut conn = cell.lock();
        if conn.is_closed() {
            cell.busy.store(false, Ordering::Release);
            return;
        }

        match conn.write(self.conn_edge) {
            Ok(n) => self.metrics.add_bytes(n),
            Err(e) => {
                tracing::debug!(conn = %id, error = %e, "write failed");
                self.close_locked(id, &mut conn);
                cell.busy.store(false, Ordering::Release);
                return;
            }
        }

        if conn.to_write_bytes() > 0 {
            cell.busy.store(false, Ordering::Release);
            self.rearm(id, &mut conn, Interest::WRITABLE);
        } else if conn.is_keep_alive() {
            // Input that arrived with the last request is handled right away.
            self.on_process(id, &cell, conn);
        } else {
            self.close_locked(id, &mut conn);
            cell.busy.store(false, Ordering::Release);
        }
    }

    /// Re-arm the one-shot registration. Runs with the connection locked so a
    /// concurrent close cannot recycle the descriptor underneath it.
    fn rearm(&self, id: ConnId, conn: &mut Connection, interest: Interest) {
        if let Err(e) = self
            .poller
            .modify(conn.fd(), id.token(), self.conn_interest | interest)
        {
            tracing::warn!(conn = %id, error = %e, "re-arm failed");
            self.close_locked(id, conn);
        }
    }
}

/// Cloneable handle that stops a running [`Server`].
#[derive(Clone)]
pub struct ShutdownHandle {
    flag: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        self.flag.store(true, Ordering::Release);
        self.waker.wake();
    }

    pub fn is_shutdown(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }
}

/// Single reactor thread plus a worker pool serving static files over HTTP/1.1.
pub struct Server {
    config: ServerConfig,
    trigger: TriggerMode,
    listener: OwnedFd,
    doc_root: Arc<Path>,
    idle_timeout: Option<Duration>,
    shared: Arc<Shared>,
    timers: TimerHeap<ConnId>,
    expired_tx: Sender<ConnId>,
    expired_rx: Receiver<ConnId>,
    closed_rx: Receiver<ConnId>,
    pool: WorkerPool,
    shutdown: ShutdownHandle,
}

impl Server {
    pub fn new(config: ServerConfig, auth: Arc<dyn Authenticator>) -> NocturneResult<Self> {
        config.validate()?;
        syscalls::ignore_sigpipe();

        let trigger = config.trigger();
        let fd = syscalls::create_listen_socket(&config.host, config.port, config.linger)?;
        // SAFETY: `fd` was just created and is owned by nobody else.
        let listener = unsafe { OwnedFd::from_raw_fd(fd) };

        let mut listen_interest = Interest::READABLE;
        let mut conn_interest = Interest::ONESHOT | Interest::PEER_CLOSED;
        if trigger.listener_edge {
            listen_interest |= Interest::EDGE;
        }
        if trigger.conn_edge {
            conn_interest |= Interest::EDGE;
        }

        let poller = Multiplexer::new()?;
        poller.add(listener.as_raw_fd(), LISTEN_TOKEN, listen_interest)?;
        let waker = Arc::new(Waker::new()?);
        poller.add(waker.read_fd(), WAKER_TOKEN, Interest::READABLE)?;

        if !config.document_root.is_dir() {
            tracing::warn!(
                root = %config.document_root.display(),
                "document root is not a directory"
            );
        }

        let pool = WorkerPool::new(config.worker_threads)?;
        let (closed_tx, closed_rx) = mpsc::channel();
        let (expired_tx, expired_rx) = mpsc::channel();
        let shared = Arc::new(Shared {
            poller,
            registry: RwLock::new(ConnectionSlab::new(config.max_connections)),
            metrics: Arc::new(ServerMetrics::new()),
            auth,
            closed_tx,
            waker: waker.clone(),
            conn_interest,
            conn_edge: trigger.conn_edge,
        });

        Ok(Self {
            trigger,
            listener,
            doc_root: Arc::from(config.document_root.as_path()),
            idle_timeout: config.idle_timeout(),
            shared,
            timers: TimerHeap::new(),
            expired_tx,
            expired_rx,
            closed_rx,
            pool,
            shutdown: ShutdownHandle {
                flag: Arc::new(AtomicBool::new(false)),
                waker,
            },
            config,
        })
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    pub fn metrics(&self) -> Arc<ServerMetrics> {
        self.shared.metrics.clone()
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run the reactor until the shutdown handle fires. Every live connection
    /// is closed and the worker pool drained before returning.
    pub fn run(&mut self) -> NocturneResult<()> {
        tracing::info!(
            host = %self.config.host,
            port = self.config.port,
            listen_et = self.trigger.listener_edge,
            conn_et = self.trigger.conn_edge,
            timeout_ms = self.config.timeout_ms,
            workers = self.pool.threads(),
            root = %self.doc_root.display(),
            "server started"
        );

        let mut events = Events::with_capacity(self.config.max_events);
        while !self.shutdown.is_shutdown() {
            self.reap_closed();
            let timeout = if self.idle_timeout.is_some() {
                let mut timeout = self.timers.next_tick();
                if self.expire_idle() > 0 {
                    timeout = self.timers.next_tick();
                }
                timeout
            } else {
                None
            };
            self.reap_closed();

            self.shared.poller.wait(&mut events, timeout)?;
            for event in events.iter() {
                match event.token {
                    LISTEN_TOKEN => self.deal_listen(),
                    WAKER_TOKEN => self.shutdown.waker.drain(),
                    token => self.dispatch(ConnId::from_token(token), event.readiness),
                }
            }
        }

        self.stop();
        Ok(())
    }

    fn dispatch(&mut self, id: ConnId, readiness: Interest) {
        if readiness.is_closed() {
            let shared = self.shared.clone();
            self.submit(move || shared.close(id));
        } else if readiness.is_readable() {
            self.extend_time(id);
            let shared = self.shared.clone();
            self.submit(move || shared.on_read(id));
        } else if readiness.is_writable() {
            self.extend_time(id);
            let shared = self.shared.clone();
            self.submit(move || shared.on_write(id));
        } else {
            tracing::error!(conn = %id, bits = readiness.bits(), "unexpected event");
        }
    }

    fn submit<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if let Err(e) = self.pool.submit(task) {
            tracing::error!(error = %e, "task dropped");
        }
    }

    fn deal_listen(&mut self) {
        let listen_fd = self.listener.as_raw_fd();
        let mut accepted = Vec::new();
        drain_accepts(
            self.trigger.listener_edge,
            || syscalls::accept_connection(listen_fd),
            |fd, peer| accepted.push((fd, peer)),
        );
        for (fd, peer) in accepted {
            self.add_client(fd, peer);
        }
    }

    fn add_client(&mut self, fd: libc::c_int, peer: SocketAddr) {
        let shared = Arc::clone(&self.shared);
        let metrics = &shared.metrics;
        let full = {
            let registry = self.shared.registry.read().unwrap_or_else(|e| e.into_inner());
            registry.len() >= registry.capacity()
        };
        if full || metrics.live() >= self.config.max_connections {
            syscalls::send_and_close(fd, BUSY_MESSAGE);
            metrics.inc_busy();
            tracing::warn!(peer = %peer, live = metrics.live(), "clients are full");
            return;
        }

        let conn = Connection::new(
            fd,
            peer,
            self.doc_root.clone(),
            self.idle_timeout,
            self.config.max_request_bytes,
        );
        let cell = Arc::new(ConnCell {
            busy: AtomicBool::new(false),
            conn: Mutex::new(conn),
        });
        let id = {
            let mut registry = self.shared.registry.write().unwrap_or_else(|e| e.into_inner());
            registry.allocate(cell)
        };
        // Capacity was checked above and only this thread allocates.
        let Some(id) = id else {
            return;
        };
        metrics.inc_conn();

        if let Some(timeout) = self.idle_timeout {
            self.arm_idle_timer(id, timeout);
        }

        let interest = self.shared.conn_interest | Interest::READABLE;
        if let Err(e) = self.shared.poller.add(fd, id.token(), interest) {
            tracing::error!(conn = %id, error = %e, "register failed");
            self.shared.close(id);
            return;
        }
        tracing::info!(conn = %id, peer = %peer, fd, live = metrics.live(), "client in");
    }

    /// Expiry only reports the id; [`Server::expire_idle`] decides whether the
    /// connection can be closed right now.
    fn arm_idle_timer(&mut self, id: ConnId, timeout: Duration) {
        let expired_tx = self.expired_tx.clone();
        self.timers.add(
            id,
            timeout,
            Box::new(move || {
                let _ = expired_tx.send(id);
            }),
        );
    }

    /// Close connections whose idle timer fired. One that a worker is still
    /// serving gets a fresh deadline instead. Returns how many were deferred.
    fn expire_idle(&mut self) -> usize {
        let Some(timeout) = self.idle_timeout else {
            return 0;
        };
        let ids: Vec<ConnId> = self.expired_rx.try_iter().collect();
        let mut deferred = 0;
        for id in ids {
            if !self.shared.try_expire(id) {
                self.arm_idle_timer(id, timeout);
                deferred += 1;
            }
        }
        deferred
    }

    /// Slide the idle deadline of `id` forward.
    fn extend_time(&mut self, id: ConnId) {
        if let Some(timeout) = self.idle_timeout {
            self.timers.adjust(id, timeout);
        }
    }

    fn reap_closed(&mut self) {
        let ids: Vec<ConnId> = self.closed_rx.try_iter().collect();
        if ids.is_empty() {
            return;
        }
        let mut registry = self.shared.registry.write().unwrap_or_else(|e| e.into_inner());
        for id in ids {
            registry.free(id);
            self.timers.remove(id);
        }
    }

    fn stop(&mut self) {
        tracing::info!("shutting down");
        self.pool.shutdown();

        let ids: Vec<ConnId> = {
            let registry = self.shared.registry.read().unwrap_or_else(|e| e.into_inner());
            registry.iter().map(|(id, _)| id).collect()
        };
        for id in ids {
            self.shared.close(id);
        }
        self.reap_closed();
        self.timers.clear();

        if let Err(e) = self.shared.poller.delete(self.listener.as_raw_fd()) {
            tracing::debug!(error = %e, "listener deregister failed");
        }
        tracing::info!("server stopped");
    }
}

/// Run `accept` until the backlog is drained (edge-triggered) or once
/// (level-triggered). A retryable failure never ends an edge-triggered drain,
/// since no new edge arrives for connections still queued behind it.
fn drain_accepts(
    edge_triggered: bool,
    mut accept: impl FnMut() -> Result<Accepted, NocturneError>,
    mut on_conn: impl FnMut(libc::c_int, SocketAddr),
) -> usize {
    let mut count = 0;
    loop {
        match accept() {
            Ok(Accepted::Conn(fd, peer)) => {
                on_conn(fd, peer);
                count += 1;
            }
            Ok(Accepted::Retry) => {
                tracing::debug!("accept interrupted, retrying");
                continue;
            }
            Ok(Accepted::Drained) => break,
            Err(e) => {
                tracing::warn!(error = %e, "accept failed");
                break;
            }
        }
        if !edge_triggered {
            break;
        }
    }
    count
}

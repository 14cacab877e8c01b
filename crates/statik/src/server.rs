// src/server.rs
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver};

use socket2::{Domain, Protocol, Socket, Type};
use tracing::{debug, error, info, trace, warn};

use crate::config::Config;
use crate::conn::{ConnState, Connection, Next};
use crate::error::Result;
use crate::pool::WorkerPool;
use crate::slab::ConnectionSlab;
use crate::syscalls::{
    self, CONN_FLAGS, EPOLLERR, EPOLLHUP, EPOLLIN, EPOLLOUT, EPOLLRDHUP, Epoll, epoll_event,
};

const LISTENER_TOKEN: u64 = u64::MAX - 1;
const WAKE_TOKEN: u64 = u64::MAX;

/// Upper bound on one `epoll_wait`, so the shutdown flag is noticed.
const POLL_TIMEOUT_MS: i32 = 250;

type Completion = (Box<Connection>, Next);

/// The reactor: one thread owning the listener, the epoll instance and the
/// connection table, feeding parse-and-resolve work to the worker pool.
///
/// Sockets are armed oneshot, so a connection produces at most one event
/// until it is re-armed. A connection handed to the pool is moved out of
/// the table and only re-armed once the worker hands it back, which keeps
/// every connection on exactly one thread at a time.
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    epoll: Epoll,
    wake_rx: OwnedFd,
    slab: ConnectionSlab,
    pool: WorkerPool<Box<Connection>>,
    completions: Receiver<Completion>,
    max_events: usize,
}

impl Server {
    pub fn bind(config: &Config) -> Result<Self> {
        let serve = Arc::new(config.serve_config()?);
        let addr = config.listen_addr();

        let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr.into())?;
        socket.listen(config.backlog)?;
        let listener: TcpListener = socket.into();
        let local_addr = listener.local_addr()?;

        let epoll = Epoll::new()?;
        epoll.add(listener.as_raw_fd(), LISTENER_TOKEN, EPOLLIN)?;
        let (wake_rx, wake_tx) = syscalls::create_pipe()?;
        epoll.add(wake_rx.as_raw_fd(), WAKE_TOKEN, EPOLLIN)?;

        let (done_tx, completions) = mpsc::channel::<Completion>();
        let pool = WorkerPool::new(config.worker_threads(), config.max_queue, move |conn| {
            run_connection(conn, &done_tx, &wake_tx)
        })?;

        info!(
            addr = %local_addr,
            doc_root = %serve.doc_root.display(),
            workers = pool.threads(),
            max_queue = config.max_queue,
            "server bound"
        );

        Ok(Self {
            listener,
            local_addr,
            epoll,
            wake_rx,
            slab: ConnectionSlab::new(config.max_connections, serve),
            pool,
            completions,
            max_events: config.max_events,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serve until `shutdown` is set. Stops the pool and closes every
    /// connection on the way out.
    pub fn run(mut self, shutdown: Arc<AtomicBool>) -> Result<()> {
        let mut events = syscalls::empty_events(self.max_events);
        info!(addr = %self.local_addr, "accepting connections");

        while !shutdown.load(Ordering::Acquire) {
            let n = self.epoll.wait(&mut events, POLL_TIMEOUT_MS)?;
            for event in &events[..n] {
                self.dispatch_event(event);
            }
            self.drain_completions();
        }

        info!(active = self.slab.len(), "shutting down");
        self.pool.shutdown();
        // Whatever the workers finished before stopping is dropped, closing it.
        drop(self.completions);
        let closed = self.slab.close_all();
        info!(closed, "server stopped");
        Ok(())
    }

    fn dispatch_event(&mut self, event: &epoll_event) {
        let token = event.u64;
        let flags = event.events as i32;
        match token {
            LISTENER_TOKEN => self.accept_ready(),
            WAKE_TOKEN => self.drain_wake_pipe(),
            _ => self.connection_ready(token as RawFd, flags),
        }
    }

    fn accept_ready(&mut self) {
        loop {
            let (stream, peer) = match self.listener.accept() {
                Ok(accepted) => accepted,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            };
            if let Err(e) = stream.set_nonblocking(true) {
                warn!(%peer, error = %e, "could not make socket non-blocking");
                continue;
            }

            let fd = stream.as_raw_fd();
            if let Err(e) = self.slab.accept(OwnedFd::from(stream), Some(peer)) {
                warn!(%peer, error = %e, "refusing connection");
                continue;
            }
            if let Err(e) = self.epoll.add(fd, fd as u64, EPOLLIN | CONN_FLAGS) {
                warn!(fd, error = %e, "epoll registration failed");
                self.slab.release(fd);
                continue;
            }
            debug!(fd, %peer, active = self.slab.len(), "accepted");
        }
    }

    fn connection_ready(&mut self, fd: RawFd, flags: i32) {
        let Some(conn) = self.slab.get_mut(fd) else {
            trace!(fd, "event for a connection not parked here");
            return;
        };

        let hangup = flags & (EPOLLHUP | EPOLLERR) != 0
            || (flags & EPOLLRDHUP != 0 && flags & EPOLLIN == 0);
        if hangup {
            debug!(fd, flags, "peer hung up");
            self.close(fd);
            return;
        }

        match conn.state() {
            ConnState::Reading if flags & EPOLLIN != 0 => {
                if conn.on_readable() {
                    self.submit(fd);
                } else {
                    self.close(fd);
                }
            }
            ConnState::Writing if flags & EPOLLOUT != 0 => {
                let next = conn.on_writable();
                self.rearm(fd, next);
            }
            ConnState::Writing => self.rearm(fd, Next::Write),
            ConnState::Reading => self.rearm(fd, Next::Read),
            ConnState::Free => self.close(fd),
        }
    }

    fn submit(&mut self, fd: RawFd) {
        let Some(conn) = self.slab.checkout(fd) else {
            return;
        };
        if let Err(conn) = self.pool.submit(conn) {
            warn!(fd, queued = self.pool.queued(), "worker queue full; dropping connection");
            self.slab.checkin(conn);
            self.close(fd);
        }
    }

    fn drain_wake_pipe(&mut self) {
        loop {
            match syscalls::recv_fd_from_pipe(self.wake_rx.as_raw_fd()) {
                Ok(Some(fd)) => trace!(fd, "worker finished"),
                Ok(None) => return,
                Err(e) => {
                    warn!(error = %e, "wake pipe read failed");
                    return;
                }
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok((conn, next)) = self.completions.try_recv() {
            let fd = conn.token();
            self.slab.checkin(conn);
            self.rearm(fd, next);
        }
    }

    fn rearm(&mut self, fd: RawFd, next: Next) {
        let interest = match next {
            Next::Read => EPOLLIN,
            Next::Write => EPOLLOUT,
            Next::Close => {
                self.close(fd);
                return;
            }
        };
        if let Err(e) = self.epoll.modify(fd, fd as u64, interest | CONN_FLAGS) {
            warn!(fd, error = %e, "re-arm failed");
            self.close(fd);
        }
    }

    fn close(&mut self, fd: RawFd) {
        if let Err(e) = self.epoll.delete(fd) {
            debug!(fd, error = %e, "epoll delete failed");
        }
        if self.slab.release(fd) {
            trace!(fd, active = self.slab.len(), "slot released");
        }
    }
}

/// Worker side of a dispatch: parse and resolve, then hand the connection
/// back to the reactor and wake it.
fn run_connection(
    mut conn: Box<Connection>,
    done: &mpsc::Sender<Completion>,
    wake: &OwnedFd,
) {
    let fd = conn.token();
    let next = panic::catch_unwind(AssertUnwindSafe(|| conn.process())).unwrap_or_else(|_| {
        error!(fd, "request processing panicked; closing connection");
        Next::Close
    });

    // A closed channel means the reactor is gone; dropping the connection closes it.
    if done.send((conn, next)).is_err() {
        return;
    }
    if let Err(e) = syscalls::send_fd_over_pipe(wake.as_raw_fd(), fd) {
        warn!(fd, error = %e, "could not wake reactor");
    }
}

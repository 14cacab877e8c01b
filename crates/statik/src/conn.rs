// src/conn.rs
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::ServeConfig;
use crate::parser::{ParseOutcome, RequestHead, RequestParser};
use crate::resolver::{self, MappedFile};
use crate::response::{self, Status};
use crate::send::{Flush, SendState};
use crate::syscalls;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum ConnState {
    /// No socket attached.
    #[default]
    Free = 0,
    /// Accumulating and parsing a request.
    Reading = 1,
    /// A response is armed in the send state.
    Writing = 2,
}

/// What the reactor should wait for next on this connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next {
    Read,
    Write,
    Close,
}

/// One accepted socket with its buffers, parser and pending response.
///
/// No internal locking: whoever holds `&mut Connection` is the only thread
/// touching it. The reactor keeps that true by moving the connection to a
/// worker for `process()` and re-arming the descriptor only once it is back.
pub struct Connection {
    fd: Option<OwnedFd>,
    token: RawFd,
    peer: Option<SocketAddr>,
    config: Arc<ServeConfig>,
    state: ConnState,

    read_buf: Box<[u8]>,
    read_end: usize,
    parser: RequestParser,

    write_buf: Box<[u8]>,
    write_len: usize,
    send: SendState,
    /// Reset instead of closing once the response is out.
    linger: bool,
    requests_served: u32,
}

impl Connection {
    pub fn new(config: Arc<ServeConfig>) -> Self {
        let limits = config.limits;
        Self {
            fd: None,
            token: -1,
            peer: None,
            config,
            state: ConnState::Free,
            read_buf: vec![0; limits.read_buffer].into_boxed_slice(),
            read_end: 0,
            parser: RequestParser::new(),
            write_buf: vec![0; limits.write_buffer].into_boxed_slice(),
            write_len: 0,
            send: SendState::new(),
            linger: false,
            requests_served: 0,
        }
    }

    /// Attach a freshly accepted, non-blocking socket.
    pub fn init(&mut self, fd: OwnedFd, peer: Option<SocketAddr>) {
        if self.is_active() {
            self.close();
        }
        self.reset();
        self.token = fd.as_raw_fd();
        self.fd = Some(fd);
        self.peer = peer;
        self.state = ConnState::Reading;
        self.requests_served = 0;
    }

    /// Back to a pristine parsing state. Drops any mapping still held.
    pub fn reset(&mut self) {
        self.read_buf.fill(0);
        self.read_end = 0;
        self.parser.reset();
        self.write_buf.fill(0);
        self.write_len = 0;
        self.send.reset();
        self.linger = false;
        if self.is_active() {
            self.state = ConnState::Reading;
        }
    }

    /// Release the mapping and the socket. Deregistering the descriptor
    /// from the reactor is the caller's job and must happen first.
    pub fn close(&mut self) {
        if let Some(file) = self.send.release() {
            debug!(fd = self.token, path = %file.path().display(), "releasing mapping on close");
        }
        if self.fd.take().is_some() {
            debug!(fd = self.token, requests = self.requests_served, "connection closed");
        }
        self.state = ConnState::Free;
    }

    pub fn is_active(&self) -> bool {
        self.fd.is_some()
    }

    pub fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }

    /// Descriptor number the connection was last initialised with; kept
    /// after close so the slot table can find its entry.
    pub fn token(&self) -> RawFd {
        self.token
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn read_end(&self) -> usize {
        self.read_end
    }

    pub fn request(&self) -> &RequestHead {
        self.parser.head()
    }

    pub fn requests_served(&self) -> u32 {
        self.requests_served
    }

    /// Drain the socket into the read buffer. `false` means the peer went
    /// away, the read failed, or the buffer was already full: close it.
    pub fn on_readable(&mut self) -> bool {
        let Some(fd) = self.raw_fd() else {
            return false;
        };
        if self.read_end >= self.read_buf.len() {
            return false;
        }

        while self.read_end < self.read_buf.len() {
            match syscalls::read_nonblocking(fd, &mut self.read_buf[self.read_end..]) {
                Ok(Some(0)) => return false,
                Ok(Some(n)) => self.read_end += n,
                Ok(None) => break,
                Err(e) => {
                    debug!(fd, error = %e, "read failed");
                    return false;
                }
            }
        }
        true
    }

    /// Parse what has been buffered and, once a request is complete (or
    /// hopeless), arm the response. Runs on a worker thread.
    pub fn process(&mut self) -> Next {
        let outcome = self.parser.parse(&mut self.read_buf[..self.read_end]);
        let resolved = match outcome {
            ParseOutcome::NeedMoreData => {
                if self.read_end >= self.read_buf.len() {
                    debug!(fd = self.token, "request head exceeds read buffer");
                    return Next::Close;
                }
                return Next::Read;
            }
            ParseOutcome::Malformed => {
                debug!(fd = self.token, "malformed request");
                // Answered, then back to reading regardless of keep-alive.
                self.linger = true;
                Err(Status::BadRequest)
            }
            ParseOutcome::Complete => {
                let head = self.parser.head();
                self.linger = head.keep_alive;
                resolver::resolve(&self.config, head.target.slice(&self.read_buf))
            }
        };
        self.requests_served += 1;
        self.respond(resolved)
    }

    fn respond(&mut self, resolved: Result<MappedFile, Status>) -> Next {
        let keep_alive = self.parser.head().keep_alive;
        let status = resolved.as_ref().err().copied().unwrap_or(Status::Ok);
        let built = match resolved {
            Ok(file) => response::compose(&mut self.write_buf, Status::Ok, file.len(), keep_alive, &[])
                .map(|len| (len, Some(file))),
            Err(status) => response::compose_error(&mut self.write_buf, status, keep_alive)
                .map(|len| (len, None)),
        };

        let (len, file) = match built {
            Ok(armed) => armed,
            // A 500 is longer than any response that failed to fit, so there
            // is nothing smaller to fall back to.
            Err(overflow) => {
                warn!(fd = self.token, status = status.code(), %overflow, "response does not fit; closing");
                self.write_len = 0;
                return Next::Close;
            }
        };

        debug!(
            fd = self.token,
            status = status.code(),
            path = %String::from_utf8_lossy(self.parser.head().target.slice(&self.read_buf)),
            bytes = len + file.as_ref().map_or(0, MappedFile::len),
            "response armed"
        );
        self.write_len = len;
        self.send.start(len, file);
        self.state = ConnState::Writing;
        Next::Write
    }

    /// Push the armed response out. Runs on the reactor thread.
    pub fn on_writable(&mut self) -> Next {
        let Some(fd) = self.raw_fd() else {
            return Next::Close;
        };
        if self.send.total() == 0 {
            self.reset();
            return Next::Read;
        }

        match self.send.flush(fd, &self.write_buf[..self.write_len]) {
            Ok(Flush::WouldBlock) => Next::Write,
            Ok(Flush::Done) => {
                self.send.release();
                if self.linger {
                    self.reset();
                    Next::Read
                } else {
                    Next::Close
                }
            }
            Err(e) => {
                debug!(fd, error = %e, "write failed");
                self.send.release();
                Next::Close
            }
        }
    }
}

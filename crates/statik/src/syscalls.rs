// src/syscalls.rs
use crate::error::Result;
use libc::{c_int, c_void};
use std::io;
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::ptr;

pub use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLRDHUP, epoll_event};

/// Interest flags every client socket is (re)armed with besides IN/OUT:
/// one notification per arming, plus peer half-close detection.
pub const CONN_FLAGS: i32 = EPOLLONESHOT | EPOLLRDHUP;

/// Most iovecs handed to one `writev` call.
const MAX_IOVECS: usize = 8;

// ---- Epoll Operations ----

pub struct Epoll {
    pub fd: c_int,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        unsafe {
            let fd = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if fd < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self { fd })
        }
    }

    /// Register `fd`. Edge-triggered (EPOLLET) is always added.
    pub fn add(&self, fd: RawFd, token: u64, interests: i32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, token, interests)
    }

    /// Re-arm a oneshot registration, possibly with new interests.
    pub fn modify(&self, fd: RawFd, token: u64, interests: i32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, token, interests)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
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

    pub fn wait(&self, events: &mut [epoll_event], timeout_ms: i32) -> Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd,
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );

            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }

            Ok(res as usize)
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, token: u64, interests: i32) -> Result<()> {
        let mut event = epoll_event {
            events: (interests | EPOLLET) as u32,
            u64: token,
        };

        unsafe {
            if libc::epoll_ctl(self.fd, op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.fd);
        }
    }
}

pub fn empty_events(n: usize) -> Vec<epoll_event> {
    vec![epoll_event { events: 0, u64: 0 }; n]
}

// ---- Socket I/O ----

/// Non-blocking receive. `Ok(None)` means would-block, `Ok(Some(0))` is EOF.
pub fn read_nonblocking(fd: RawFd, buf: &mut [u8]) -> Result<Option<usize>> {
    loop {
        let res = unsafe { libc::recv(fd, buf.as_mut_ptr() as *mut c_void, buf.len(), 0) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err.into()),
        }
    }
}

/// Vectored write: gather all `bufs` in a single syscall. `Ok(None)` means
/// the socket buffer is full.
pub fn writev_nonblocking(fd: RawFd, bufs: &[&[u8]]) -> Result<Option<usize>> {
    if bufs.is_empty() {
        return Ok(Some(0));
    }

    // Build iovec array on stack
    let mut iovecs: [libc::iovec; MAX_IOVECS] = unsafe { std::mem::zeroed() };
    let iov_count = bufs.len().min(MAX_IOVECS);

    for (iov, buf) in iovecs.iter_mut().zip(&bufs[..iov_count]) {
        *iov = libc::iovec {
            iov_base: buf.as_ptr() as *mut c_void,
            iov_len: buf.len(),
        };
    }

    loop {
        let res = unsafe { libc::writev(fd, iovecs.as_ptr(), iov_count as c_int) };
        if res >= 0 {
            return Ok(Some(res as usize));
        }
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::Interrupted => continue,
            io::ErrorKind::WouldBlock => return Ok(None),
            _ => return Err(err.into()),
        }
    }
}

// ---- Wake Pipe Operations ----

/// Create a Unix pipe with a non-blocking read end. Returns (read, write).
pub fn create_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let mut fds = [0 as c_int; 2];
    unsafe {
        if libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let (read, write) = (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1]));
        let flags = libc::fcntl(fds[0], libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fds[0], libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok((read, write))
    }
}

/// Send a descriptor number over a pipe (blocking write of 4 bytes).
pub fn send_fd_over_pipe(pipe_write_fd: RawFd, fd: RawFd) -> Result<()> {
    let bytes = fd.to_ne_bytes();
    loop {
        let n = unsafe { libc::write(pipe_write_fd, bytes.as_ptr() as *const c_void, 4) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err.into());
        }
    }
}

/// Receive a descriptor number from a pipe (non-blocking read of 4 bytes).
pub fn recv_fd_from_pipe(pipe_read_fd: RawFd) -> Result<Option<RawFd>> {
    let mut buf = [0u8; 4];
    unsafe {
        let n = libc::read(pipe_read_fd, buf.as_mut_ptr() as *mut c_void, 4);
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else if n == 4 {
            Ok(Some(RawFd::from_ne_bytes(buf)))
        } else {
            Ok(None) // Partial read, writes of 4 bytes are atomic on a pipe
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::net::UnixStream;

    #[test]
    fn test_read_would_block_and_eof() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let mut buf = [0u8; 16];

        assert_eq!(read_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), None);
        b.write_all(b"ping").unwrap();
        assert_eq!(read_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), Some(4));
        drop(b);
        assert_eq!(read_nonblocking(a.as_raw_fd(), &mut buf).unwrap(), Some(0));
    }

    #[test]
    fn test_writev_gathers_segments() {
        let (a, mut b) = UnixStream::pair().unwrap();
        let n = writev_nonblocking(a.as_raw_fd(), &[b"head:", b"", b"body"]).unwrap();
        assert_eq!(n, Some(9));

        let mut out = [0u8; 9];
        b.read_exact(&mut out).unwrap();
        assert_eq!(&out, b"head:body");
    }

    #[test]
    fn test_pipe_round_trip() {
        let (read, write) = create_pipe().unwrap();
        assert_eq!(recv_fd_from_pipe(read.as_raw_fd()).unwrap(), None);
        send_fd_over_pipe(write.as_raw_fd(), 42).unwrap();
        send_fd_over_pipe(write.as_raw_fd(), 7).unwrap();
        assert_eq!(recv_fd_from_pipe(read.as_raw_fd()).unwrap(), Some(42));
        assert_eq!(recv_fd_from_pipe(read.as_raw_fd()).unwrap(), Some(7));
        assert_eq!(recv_fd_from_pipe(read.as_raw_fd()).unwrap(), None);
    }

    #[test]
    fn test_epoll_oneshot_fires_once() {
        let (a, mut b) = UnixStream::pair().unwrap();
        a.set_nonblocking(true).unwrap();
        let epoll = Epoll::new().unwrap();
        epoll.add(a.as_raw_fd(), 5, EPOLLIN | CONN_FLAGS).unwrap();

        let mut events = empty_events(4);
        b.write_all(b"x").unwrap();
        assert_eq!(epoll.wait(&mut events, 1000).unwrap(), 1);
        assert_eq!({ events[0].u64 }, 5);

        b.write_all(b"y").unwrap();
        assert_eq!(epoll.wait(&mut events, 50).unwrap(), 0);

        epoll.modify(a.as_raw_fd(), 5, EPOLLIN | CONN_FLAGS).unwrap();
        assert_eq!(epoll.wait(&mut events, 1000).unwrap(), 1);
    }
}

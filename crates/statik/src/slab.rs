// src/slab.rs
use std::net::SocketAddr;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::sync::Arc;

use tracing::warn;

use crate::config::ServeConfig;
use crate::conn::Connection;
use crate::error::{Result, StatikError};

enum Slot {
    /// Closed. Keeps the previous connection's allocation for reuse.
    Vacant(Option<Box<Connection>>),
    /// Live and owned by the reactor.
    Parked(Box<Connection>),
    /// Live, but moved out to a worker.
    Dispatched,
}

/// Connection table indexed by socket descriptor.
///
/// Owned by the reactor thread, which makes it the single owner of the
/// live-connection count. Connections are boxed once per slot and reused
/// across accepts; a slot is reset right before it is handed a new socket.
pub struct ConnectionSlab {
    entries: Box<[Slot]>,
    config: Arc<ServeConfig>,
    active_count: usize,
}

impl ConnectionSlab {
    /// Descriptors `0..capacity` can be tracked.
    pub fn new(capacity: usize, config: Arc<ServeConfig>) -> Self {
        let entries = (0..capacity).map(|_| Slot::Vacant(None)).collect();
        Self {
            entries,
            config,
            active_count: 0,
        }
    }

    /// Take ownership of an accepted socket. On error the socket is dropped,
    /// which closes it.
    pub fn accept(&mut self, fd: OwnedFd, peer: Option<SocketAddr>) -> Result<()> {
        let raw = fd.as_raw_fd();
        let Some(slot) = usize::try_from(raw).ok().and_then(|i| self.entries.get_mut(i)) else {
            return Err(StatikError::SlabFull { fd: raw });
        };

        let mut conn = match std::mem::replace(slot, Slot::Vacant(None)) {
            Slot::Vacant(Some(conn)) => conn,
            Slot::Vacant(None) => Box::new(Connection::new(self.config.clone())),
            busy => {
                *slot = busy;
                return Err(StatikError::SlotBusy { fd: raw });
            }
        };
        conn.init(fd, peer);
        *slot = Slot::Parked(conn);
        self.active_count += 1;
        Ok(())
    }

    /// The connection on `fd`, if it is live and not out on a worker.
    #[inline(always)]
    pub fn get_mut(&mut self, fd: RawFd) -> Option<&mut Connection> {
        match self.slot_mut(fd)? {
            Slot::Parked(conn) => Some(&mut **conn),
            _ => None,
        }
    }

    /// Move the connection out for dispatch. The slot stays reserved until
    /// [`checkin`](Self::checkin).
    pub fn checkout(&mut self, fd: RawFd) -> Option<Box<Connection>> {
        let slot = self.slot_mut(fd)?;
        match std::mem::replace(slot, Slot::Dispatched) {
            Slot::Parked(conn) => Some(conn),
            other => {
                *slot = other;
                None
            }
        }
    }

    /// Return a dispatched connection to its slot.
    pub fn checkin(&mut self, conn: Box<Connection>) {
        let fd = conn.token();
        match self.slot_mut(fd) {
            Some(slot) if matches!(slot, Slot::Dispatched) => *slot = Slot::Parked(conn),
            _ => warn!(fd, "checkin for a slot that was not dispatched; dropping connection"),
        }
    }

    /// Close the connection on `fd` and free its slot. Only parked
    /// connections are closed; a dispatched one is closed after checkin.
    pub fn release(&mut self, fd: RawFd) -> bool {
        let Some(slot) = self.slot_mut(fd) else {
            return false;
        };
        match std::mem::replace(slot, Slot::Vacant(None)) {
            Slot::Parked(mut conn) => {
                conn.close();
                *slot = Slot::Vacant(Some(conn));
                self.active_count -= 1;
                true
            }
            other => {
                *slot = other;
                false
            }
        }
    }

    /// Close every parked connection. Returns how many were closed.
    pub fn close_all(&mut self) -> usize {
        let mut closed = 0;
        for slot in self.entries.iter_mut() {
            // Dispatched slots are left to whoever holds the connection.
            if !matches!(slot, Slot::Parked(_)) {
                continue;
            }
            if let Slot::Parked(mut conn) = std::mem::replace(slot, Slot::Vacant(None)) {
                conn.close();
                *slot = Slot::Vacant(Some(conn));
                closed += 1;
            }
        }
        self.active_count -= closed;
        closed
    }

    #[inline(always)]
    pub fn len(&self) -> usize {
        self.active_count
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.active_count == 0
    }

    #[inline(always)]
    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    fn slot_mut(&mut self, fd: RawFd) -> Option<&mut Slot> {
        usize::try_from(fd).ok().and_then(|i| self.entries.get_mut(i))
    }
}

use std::io;
use std::os::fd::RawFd;

use thiserror::Error;

/// Central error type for the statik server.
///
/// Protocol problems never show up here: a malformed request or a missing
/// file is answered with an HTTP status by the connection itself. These are
/// the failures that stop the server or cost it a connection slot.
#[derive(Debug, Error)]
pub enum StatikError {
    /// Underlying I/O error from the OS or network.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Rejected or inconsistent configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The descriptor is beyond the slot table's capacity.
    #[error("connection slot table is full (fd {fd})")]
    SlabFull { fd: RawFd },

    /// The slot for this descriptor is still owned by a live connection.
    #[error("connection slot for fd {fd} is still in use")]
    SlotBusy { fd: RawFd },

    /// A worker thread could not be spawned.
    #[error("failed to spawn worker thread: {0}")]
    PoolSpawn(io::Error),
}

pub type Result<T> = std::result::Result<T, StatikError>;

// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("statik drives sockets through epoll and only builds on Linux");

pub mod config;
pub mod conn;
pub mod error;
pub mod logging;
pub mod parser;
pub mod pool;
pub mod resolver;
pub mod response;
pub mod send;
pub mod server;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use config::{Config, Limits, ServeConfig};
pub use conn::{Connection, Next};
pub use error::{Result, StatikError};
pub use logging::{init_logging, init_logging_with_level};
pub use pool::WorkerPool;
pub use server::Server;

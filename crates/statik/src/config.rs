use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use clap::Parser;

use crate::error::{Result, StatikError};

pub const DEFAULT_READ_BUFFER: usize = 2048;
pub const DEFAULT_WRITE_BUFFER: usize = 2048;
pub const DEFAULT_MAX_PATH_LEN: usize = 200;

/// Server configuration, from the command line with `STATIK_*` environment
/// fallbacks (a `.env` file in the working directory is honoured).
#[derive(Debug, Clone, Parser)]
#[command(name = "statik", version, about = "Serve a directory over HTTP/1.1")]
pub struct Config {
    /// Port to listen on
    #[arg(env = "STATIK_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Address to bind
    #[arg(long, env = "STATIK_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Directory that request targets are resolved under
    #[arg(long, env = "STATIK_DOC_ROOT", default_value = "./www")]
    pub doc_root: PathBuf,

    /// Longest resolved file path (document root + target), in bytes
    #[arg(long, env = "STATIK_MAX_PATH_LEN", default_value_t = DEFAULT_MAX_PATH_LEN)]
    pub max_path_len: usize,

    /// Per-connection read buffer capacity; a request head must fit in it
    #[arg(long, env = "STATIK_READ_BUFFER", default_value_t = DEFAULT_READ_BUFFER)]
    pub read_buffer: usize,

    /// Per-connection write buffer capacity for status line, headers and error bodies
    #[arg(long, env = "STATIK_WRITE_BUFFER", default_value_t = DEFAULT_WRITE_BUFFER)]
    pub write_buffer: usize,

    /// Worker threads (defaults to the number of CPUs)
    #[arg(long, env = "STATIK_WORKERS")]
    pub workers: Option<usize>,

    /// Maximum connections waiting in the worker queue
    #[arg(long, env = "STATIK_MAX_QUEUE", default_value_t = 10_000)]
    pub max_queue: usize,

    /// Connection slot table size; descriptors at or above it are refused
    #[arg(long, env = "STATIK_MAX_CONNECTIONS", default_value_t = 65_535)]
    pub max_connections: usize,

    /// Readiness events fetched per epoll wait
    #[arg(long, env = "STATIK_MAX_EVENTS", default_value_t = 1024)]
    pub max_events: usize,

    /// Listen backlog
    #[arg(long, env = "STATIK_BACKLOG", default_value_t = 1024)]
    pub backlog: i32,
}

impl Config {
    /// Load `.env` (if present), then parse the process arguments.
    pub fn load() -> Self {
        // A missing .env is the normal case.
        let _ = dotenvy::dotenv();
        Config::parse()
    }

    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }

    pub fn worker_threads(&self) -> usize {
        self.workers.unwrap_or_else(num_cpus::get)
    }

    pub fn limits(&self) -> Limits {
        Limits {
            read_buffer: self.read_buffer,
            write_buffer: self.write_buffer,
            max_path_len: self.max_path_len,
        }
    }

    pub fn validate(&self) -> Result<()> {
        let nonzero = [
            ("read buffer", self.read_buffer),
            ("write buffer", self.write_buffer),
            ("max path length", self.max_path_len),
            ("worker count", self.worker_threads()),
            ("queue depth", self.max_queue),
            ("connection limit", self.max_connections),
            ("event batch", self.max_events),
        ];
        if let Some((name, _)) = nonzero.iter().find(|(_, v)| *v == 0) {
            return Err(StatikError::Config(format!("{name} must be greater than zero")));
        }
        if !self.doc_root.is_dir() {
            return Err(StatikError::Config(format!(
                "document root {} is not a directory",
                self.doc_root.display()
            )));
        }
        Ok(())
    }

    /// Validate and build the read-only view shared by every connection.
    pub fn serve_config(&self) -> Result<ServeConfig> {
        self.validate()?;
        let doc_root = self.doc_root.canonicalize()?;
        if doc_root.as_os_str().len() >= self.max_path_len {
            return Err(StatikError::Config(format!(
                "document root {} leaves no room under the {}-byte path limit",
                doc_root.display(),
                self.max_path_len
            )));
        }
        Ok(ServeConfig::new(doc_root, self.limits()))
    }
}

/// Buffer and path bounds applied to every connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub read_buffer: usize,
    pub write_buffer: usize,
    pub max_path_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            read_buffer: DEFAULT_READ_BUFFER,
            write_buffer: DEFAULT_WRITE_BUFFER,
            max_path_len: DEFAULT_MAX_PATH_LEN,
        }
    }
}

/// Process-wide, set once at startup and read by every connection.
#[derive(Debug, Clone)]
pub struct ServeConfig {
    pub doc_root: PathBuf,
    pub limits: Limits,
}

impl ServeConfig {
    pub fn new(doc_root: impl Into<PathBuf>, limits: Limits) -> Self {
        Self {
            doc_root: doc_root.into(),
            limits,
        }
    }
}

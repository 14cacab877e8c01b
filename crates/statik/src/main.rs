// src/main.rs
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use statik::{Config, Server, StatikError, init_logging};
use tracing::{error, info};

fn main() -> Result<(), StatikError> {
    let config = Config::load();
    init_logging();

    let server = Server::bind(&config).inspect_err(|e| error!(error = %e, "startup failed"))?;

    let shutdown = Arc::new(AtomicBool::new(false));
    let flag = shutdown.clone();
    ctrlc::set_handler(move || {
        info!("received interrupt, shutting down");
        flag.store(true, Ordering::SeqCst);
    })
    .map_err(|e| StatikError::Config(format!("cannot install signal handler: {e}")))?;

    server.run(shutdown)
}

//! echo-server: a diagnostic echo endpoint for testing clients and proxies
//!
//! Every request is answered by reflecting it back:
//! - Plain HTTP requests get a text rendering of the request
//! - WebSocket connections echo each text or binary message
//! - `/.sse` streams the request followed by a heartbeat every second
//! - `/.ws` serves a browser console for the WebSocket echo
//!
//! Long-lived connections close after a sliding idle timeout.
//! Configuration via CLI arguments or TOML file, session behaviour via
//! environment variables.

mod announce;
mod config;
mod dispatch;
mod echo;
mod env;
mod server;
mod session;
mod timeout;

use config::Config;
use dispatch::AppState;
use env::{EnvSource, ProcessEnv};
use server::Server;
use std::sync::Arc;
use timeout::ConnectionTimeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    let env: Arc<dyn EnvSource> = Arc::new(ProcessEnv);
    info!(
        listen = %config.listen,
        workers = ?config.workers,
        max_connections = config.max_connections,
        timeout_minutes = ConnectionTimeout::from_env(env.as_ref()).minutes(),
        "Starting echo-server"
    );

    let mut runtime = tokio::runtime::Builder::new_multi_thread();
    runtime.enable_all();
    if let Some(workers) = config.workers {
        runtime.worker_threads(workers);
    }

    let server = Server::new(config, Arc::new(AppState::new(env)));
    runtime.build()?.block_on(server.run())?;
    Ok(())
}

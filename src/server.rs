//! TCP server for the echo endpoints.
//!
//! Accepts connections, serves each one as HTTP/1.1 or cleartext HTTP/2
//! on its own task, and hands every request to the dispatcher.

use crate::config::Config;
use crate::dispatch::{self, AppState};
use axum::extract::ConnectInfo;
use axum::Router;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Semaphore;
use tower::ServiceExt;
use tracing::{debug, error, info, trace};

/// Listen backlog
const BACKLOG: i32 = 1024;

/// Server instance
pub struct Server {
    config: Config,
    router: Router,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config, state: Arc<AppState>) -> Self {
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            router: dispatch::router(state),
            connection_limit,
        }
    }

    /// Bind the configured address and serve until Ctrl-C
    pub async fn run(self) -> Result<(), ServerError> {
        let listener = bind(&self.config.listen).await?;
        self.serve_until(listener, shutdown_signal()).await
    }

    /// Accept connections on `listener` until `shutdown` resolves.
    ///
    /// Connections already being served are left to finish on their own.
    pub async fn serve_until<F>(self, listener: TcpListener, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let local = listener.local_addr().map_err(ServerError::Accept)?;
        info!(address = %local, "Server listening");
        tokio::pin!(shutdown);

        loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break,
                permit = self.connection_limit.clone().acquire_owned() => {
                    permit.map_err(|_| ServerError::Closed)?
                }
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, addr)) => {
                    debug!(peer = %addr, "New connection");

                    let router = self.router.clone();

                    tokio::spawn(async move {
                        serve_connection(stream, addr, router).await;
                        drop(permit);
                    });
                }
                Err(e) => {
                    error!(error = %e, "Failed to accept connection");
                }
            }
        }

        info!("Shutting down");
        Ok(())
    }
}

/// Resolve `listen` and bind a listening socket on the first address.
pub async fn bind(listen: &str) -> Result<TcpListener, ServerError> {
    let addr = tokio::net::lookup_host(listen)
        .await
        .map_err(|e| ServerError::Resolve(listen.to_string(), e))?
        .next()
        .ok_or_else(|| {
            ServerError::Resolve(
                listen.to_string(),
                io::Error::new(io::ErrorKind::NotFound, "no addresses found"),
            )
        })?;

    let listener = create_listener(addr).map_err(|e| ServerError::Bind(addr, e))?;
    TcpListener::from_std(listener).map_err(|e| ServerError::Bind(addr, e))
}

fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

/// Serve one client connection, with upgrades enabled.
async fn serve_connection(stream: TcpStream, addr: SocketAddr, router: Router) {
    if let Err(e) = stream.set_nodelay(true) {
        trace!(peer = %addr, error = %e, "Failed to set TCP_NODELAY");
    }

    let service = service_fn(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(ConnectInfo(addr));
        router.clone().oneshot(request)
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let connection = builder.serve_connection_with_upgrades(TokioIo::new(stream), service);
    if let Err(e) = connection.await {
        debug!(peer = %addr, error = %e, "Connection error");
    }
    trace!(peer = %addr, "Connection closed");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Server errors
#[derive(Debug)]
pub enum ServerError {
    Resolve(String, io::Error),
    Bind(SocketAddr, io::Error),
    Accept(io::Error),
    Closed,
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Resolve(listen, e) => {
                write!(f, "Failed to resolve listen address '{}': {}", listen, e)
            }
            ServerError::Bind(addr, e) => write!(f, "Failed to bind {}: {}", addr, e),
            ServerError::Accept(e) => write!(f, "Listener error: {}", e),
            ServerError::Closed => write!(f, "Connection limiter closed"),
        }
    }
}

impl std::error::Error for ServerError {}

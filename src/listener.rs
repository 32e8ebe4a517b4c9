//! Listening socket and accept loop.
//!
//! The listener is the only reader of the listening socket. Every accepted
//! stream is moved into its own task; the loop never waits on a handler.

use crate::config::Config;
use crate::connection::handle_connection;
use crate::error::BindError;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// First pause after a failed accept.
const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(10);

/// Longest pause between failed accepts.
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Owns the bound, listening socket.
pub struct Listener {
    inner: TcpListener,
    local_addr: SocketAddr,
    nodelay: bool,
    read_buffer_size: usize,
    next_conn_id: u64,
}

impl Listener {
    /// Bind `config.listen` with SO_REUSEADDR and start listening.
    ///
    /// Must be called from within a tokio runtime.
    pub fn bind(config: &Config) -> Result<Self, BindError> {
        let addr = config.listen;
        let socket = create_listener(addr, config.backlog).map_err(|e| BindError::new(addr, e))?;
        let inner = TcpListener::from_std(socket).map_err(|e| BindError::new(addr, e))?;
        let local_addr = inner.local_addr().map_err(|e| BindError::new(addr, e))?;

        Ok(Self {
            inner,
            local_addr,
            nodelay: config.nodelay,
            read_buffer_size: config.read_buffer_size,
            next_conn_id: 1,
        })
    }

    /// Address actually bound (resolves port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.inner.accept().await
    }

    /// Accept forever, spawning a handler task per connection into `handlers`.
    ///
    /// Finished handlers are reaped here so `handlers` only holds live
    /// connections.
    pub async fn accept_loop(&mut self, handlers: &mut JoinSet<()>) {
        let mut backoff = AcceptBackoff::new();

        loop {
            tokio::select! {
                accepted = self.accept() => {
                    self.on_accept(accepted, handlers, &mut backoff).await;
                }
                Some(joined) = handlers.join_next(), if !handlers.is_empty() => {
                    if let Err(e) = joined {
                        if e.is_panic() {
                            error!(error = %e, "Connection handler panicked");
                        }
                    }
                }
            }
        }
    }

    /// Handle one accept outcome.
    ///
    /// A failed accept is logged and followed by a short, growing pause;
    /// the caller keeps looping either way.
    async fn on_accept(
        &mut self,
        accepted: io::Result<(TcpStream, SocketAddr)>,
        handlers: &mut JoinSet<()>,
        backoff: &mut AcceptBackoff,
    ) {
        match accepted {
            Ok((stream, peer)) => {
                backoff.reset();
                self.dispatch(stream, peer, handlers);
            }
            Err(e) => {
                let pause = backoff.next_pause();
                error!(
                    error = %e,
                    pause_ms = pause.as_millis() as u64,
                    "Failed to accept connection"
                );
                tokio::time::sleep(pause).await;
            }
        }
    }

    fn dispatch(&mut self, stream: TcpStream, peer: SocketAddr, handlers: &mut JoinSet<()>) {
        let conn_id = self.next_conn_id;
        self.next_conn_id += 1;

        if self.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!(conn_id, peer = %peer, error = %e, "Failed to set TCP_NODELAY");
            }
        }

        info!(conn_id, peer = %peer, "Accepted connection");
        handlers.spawn(handle_connection(stream, conn_id, peer, self.read_buffer_size));
        debug!(active = handlers.len(), "Handler spawned");
    }
}

/// Pause schedule between consecutive failed accepts.
#[derive(Debug)]
struct AcceptBackoff {
    next: Duration,
}

impl AcceptBackoff {
    fn new() -> Self {
        Self {
            next: ACCEPT_BACKOFF_START,
        }
    }

    /// Pause to take now; doubles the following one up to the cap.
    fn next_pause(&mut self) -> Duration {
        let pause = self.next;
        self.next = (self.next * 2).min(ACCEPT_BACKOFF_MAX);
        pause
    }

    fn reset(&mut self) {
        self.next = ACCEPT_BACKOFF_START;
    }
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
///
/// SO_REUSEPORT is left off so a second instance on the same port fails
/// with `AddrInUse`.
fn create_listener(addr: SocketAddr, backlog: u32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(i32::try_from(backlog).unwrap_or(i32::MAX))?;

    Ok(socket.into())
}

//! Error types for the echo server.
//!
//! Only [`BindError`] (and configuration errors) are fatal. Connection
//! errors stay inside the task that owns the connection.

use std::io;
use std::net::SocketAddr;

/// The listening socket could not be created, bound, or put into
/// listening state.
#[derive(Debug)]
pub struct BindError {
    pub addr: SocketAddr,
    pub source: io::Error,
}

impl BindError {
    pub fn new(addr: SocketAddr, source: io::Error) -> Self {
        Self { addr, source }
    }

    /// True when another socket already holds the address.
    pub fn is_addr_in_use(&self) -> bool {
        self.source.kind() == io::ErrorKind::AddrInUse
    }
}

impl std::fmt::Display for BindError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Failed to bind to {}: {}", self.addr, self.source)
    }
}

impl std::error::Error for BindError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.source)
    }
}

/// A read or write on one connection failed.
///
/// Terminal for that connection only.
#[derive(Debug)]
pub enum ConnectionError {
    Read(io::Error),
    Write(io::Error),
}

impl ConnectionError {
    pub fn io_error(&self) -> &io::Error {
        match self {
            ConnectionError::Read(e) | ConnectionError::Write(e) => e,
        }
    }
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Read(e) => write!(f, "read failed: {e}"),
            ConnectionError::Write(e) => write!(f, "write failed: {e}"),
        }
    }
}

impl std::error::Error for ConnectionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(self.io_error())
    }
}

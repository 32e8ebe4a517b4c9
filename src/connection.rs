//! Per-connection echo handler.
//!
//! A handler owns exactly one stream. It reads at most `read_size` bytes,
//! writes all of them back, and only then issues the next read:
//!
//! ```text
//! Open -> (Reading <-> Writing)* -> Closed
//! ```
//!
//! `Closed` is reached from `Reading` on EOF or a read error, and from
//! `Writing` on a write error. The stream is dropped when the handler is,
//! so the socket is closed on every exit path, including task abort.

use crate::error::ConnectionError;
use bytes::BytesMut;
use std::io;
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, trace, warn};

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Accepted, nothing read yet.
    Open,
    /// Waiting for the peer to send data.
    Reading,
    /// Echoing the last chunk back.
    Writing {
        /// Bytes already written.
        written: usize,
        /// Total bytes in the chunk.
        total: usize,
    },
    /// Terminal.
    Closed,
}

/// Counters reported when a connection ends.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionSummary {
    pub bytes_echoed: u64,
    pub chunks: u64,
}

/// A single client connection running the echo cycle.
pub struct Connection<S> {
    stream: S,
    state: ConnState,
    buffer: BytesMut,
    read_size: usize,
    summary: ConnectionSummary,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Create a new connection in the `Open` state.
    pub fn new(stream: S, read_size: usize) -> Self {
        debug_assert!(read_size > 0, "read size must be non-zero");
        Self {
            stream,
            state: ConnState::Open,
            buffer: BytesMut::with_capacity(read_size),
            read_size,
            summary: ConnectionSummary::default(),
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn summary(&self) -> ConnectionSummary {
        self.summary
    }

    /// Echo until the peer closes its write side or an I/O error occurs.
    ///
    /// `Ok(())` means the peer performed an orderly shutdown. Either way
    /// the connection ends in `Closed`.
    pub async fn serve(&mut self) -> Result<(), ConnectionError> {
        let result = self.echo_loop().await;
        if result.is_ok() {
            // Send our FIN so the client sees a zero-byte read, not a reset.
            if let Err(e) = self.stream.shutdown().await {
                debug!(error = %e, "Shutdown after EOF failed");
            }
        }
        self.state = ConnState::Closed;
        result
    }

    async fn echo_loop(&mut self) -> Result<(), ConnectionError> {
        loop {
            let n = self.read_chunk().await?;
            if n == 0 {
                trace!("Connection closed by client");
                return Ok(());
            }
            self.write_chunk(n).await?;
        }
    }

    /// Read one chunk into a freshly cleared buffer.
    async fn read_chunk(&mut self) -> Result<usize, ConnectionError> {
        self.start_reading();
        self.buffer.clear();
        self.buffer.resize(self.read_size, 0);

        let n = loop {
            match self.stream.read(&mut self.buffer[..]).await {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Read(e)),
            }
        };

        self.buffer.truncate(n);
        Ok(n)
    }

    /// Write the whole chunk back, retrying partial writes.
    async fn write_chunk(&mut self, total: usize) -> Result<(), ConnectionError> {
        self.start_writing(total);

        let mut written = 0;
        while written < total {
            match self.stream.write(&self.buffer[written..total]).await {
                Ok(0) => {
                    return Err(ConnectionError::Write(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "write returned 0",
                    )));
                }
                Ok(n) => {
                    written += n;
                    self.state = ConnState::Writing { written, total };
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(ConnectionError::Write(e)),
            }
        }
        self.stream.flush().await.map_err(ConnectionError::Write)?;

        self.summary.bytes_echoed += total as u64;
        self.summary.chunks += 1;
        Ok(())
    }

    fn start_reading(&mut self) {
        debug_assert!(
            matches!(self.state, ConnState::Open | ConnState::Writing { .. }),
            "cannot read from {:?}",
            self.state
        );
        self.state = ConnState::Reading;
    }

    fn start_writing(&mut self, total: usize) {
        debug_assert_eq!(self.state, ConnState::Reading, "write must follow a read");
        self.state = ConnState::Writing { written: 0, total };
    }
}

/// Run one accepted connection to completion and log how it ended.
pub async fn handle_connection<S>(stream: S, conn_id: u64, peer: SocketAddr, read_size: usize)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut conn = Connection::new(stream, read_size);
    let result = conn.serve().await;
    debug_assert_eq!(conn.state(), ConnState::Closed);
    let summary = conn.summary();

    match result {
        Ok(()) => info!(
            conn_id,
            peer = %peer,
            reason = "eof",
            bytes = summary.bytes_echoed,
            chunks = summary.chunks,
            "Connection closed"
        ),
        Err(e) => warn!(
            conn_id,
            peer = %peer,
            reason = "error",
            error = %e,
            bytes = summary.bytes_echoed,
            chunks = summary.chunks,
            "Connection closed"
        ),
    }
}

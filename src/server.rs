//! TCP echo server.
//!
//! Runs the listener's accept loop until the shutdown future resolves, then
//! closes the listening socket and cancels every in-flight handler.

use crate::config::Config;
use crate::error::BindError;
use crate::listener::Listener;
use std::future::Future;
use std::net::SocketAddr;
use tokio::task::JoinSet;
use tracing::info;

/// Server instance
pub struct Server {
    listener: Listener,
    read_buffer_size: usize,
}

impl Server {
    /// Bind the listening socket. Fails fast if the address is taken.
    pub fn bind(config: &Config) -> Result<Self, BindError> {
        let listener = Listener::bind(config)?;
        Ok(Server {
            listener,
            read_buffer_size: config.read_buffer_size,
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr()
    }

    /// Serve connections until `shutdown` completes.
    ///
    /// On return the listening socket and every connection socket have been
    /// closed. Bytes still queued for a client at that point may be lost.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let Server {
            mut listener,
            read_buffer_size,
        } = self;
        let mut handlers = JoinSet::new();

        info!(
            address = %listener.local_addr(),
            read_buffer_size,
            "Server listening"
        );

        tokio::select! {
            _ = listener.accept_loop(&mut handlers) => {}
            _ = shutdown => {}
        }

        drop(listener);
        let active = handlers.len();
        handlers.shutdown().await;

        info!(cancelled = active, "Server stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;
    use tokio::task::JoinHandle;

    struct TestServer {
        addr: SocketAddr,
        stop: oneshot::Sender<()>,
        handle: JoinHandle<()>,
    }

    impl TestServer {
        async fn stop(self) {
            let _ = self.stop.send(());
            tokio::time::timeout(Duration::from_secs(5), self.handle)
                .await
                .expect("server did not stop")
                .unwrap();
        }
    }

    fn start() -> TestServer {
        let config = Config {
            listen: "127.0.0.1:0".parse().unwrap(),
            ..Config::default()
        };
        let server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let (stop, stopped) = oneshot::channel::<()>();

        let handle = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));

        TestServer { addr, stop, handle }
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    /// Send `data` in pieces of the given sizes, close the write side, and
    /// collect everything echoed back.
    async fn echo_in_pieces(addr: SocketAddr, data: &[u8], pieces: &[usize]) -> Vec<u8> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();

        let send = async {
            let mut rest = data;
            for &size in pieces.iter().cycle() {
                if rest.is_empty() {
                    break;
                }
                let n = size.min(rest.len());
                writer.write_all(&rest[..n]).await.unwrap();
                rest = &rest[n..];
            }
            writer.shutdown().await.unwrap();
        };
        let recv = async {
            let mut received = Vec::new();
            reader.read_to_end(&mut received).await.unwrap();
            received
        };

        let ((), received) = tokio::join!(send, recv);
        received
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let server = start();
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(client);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_single_byte_and_empty() {
        let server = start();

        assert_eq!(echo_in_pieces(server.addr, b"x", &[1]).await, b"x");
        assert!(echo_in_pieces(server.addr, b"", &[1]).await.is_empty());

        server.stop().await;
    }

    #[tokio::test]
    async fn test_large_payload_any_chunking() {
        let server = start();
        let data = payload(64 * 1024, 7);

        for pieces in [&[64 * 1024][..], &[1, 7, 1500, 3][..], &[1024][..], &[1025][..]] {
            let received = echo_in_pieces(server.addr, &data, pieces).await;
            assert_eq!(received.len(), data.len());
            assert!(received == data, "payload corrupted with pieces {pieces:?}");
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_repeated_message_not_mixed() {
        let server = start();
        let mut client = TcpStream::connect(server.addr).await.unwrap();
        let message = b"the same message";

        client.write_all(message).await.unwrap();
        client.write_all(message).await.unwrap();

        let mut buf = vec![0u8; message.len() * 2];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf[..message.len()], message);
        assert_eq!(&buf[message.len()..], message);

        drop(client);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_clients_get_own_payload() {
        let server = start();
        let mut clients = JoinSet::new();

        for i in 0..100u32 {
            let addr = server.addr;
            clients.spawn(async move {
                let data = format!("client-{i}:").repeat(50 + i as usize).into_bytes();
                let received = echo_in_pieces(addr, &data, &[97]).await;
                assert!(received == data, "client {i} got the wrong bytes");
            });
        }

        while let Some(result) = clients.join_next().await {
            result.unwrap();
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn test_orderly_close() {
        let server = start();
        let mut client = TcpStream::connect(server.addr).await.unwrap();

        client.write_all(b"goodbye").await.unwrap();
        client.shutdown().await.unwrap();

        let mut received = Vec::new();
        client.read_to_end(&mut received).await.unwrap();
        assert_eq!(received, b"goodbye");

        // Server side is closed: further reads keep returning zero bytes.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        server.stop().await;
    }

    #[tokio::test]
    async fn test_listener_serves_after_client_reset() {
        let server = start();

        // Linger 0 makes the close an RST instead of a FIN.
        let mut doomed = TcpStream::connect(server.addr).await.unwrap();
        doomed.write_all(b"abc").await.unwrap();
        let mut buf = [0u8; 3];
        doomed.read_exact(&mut buf).await.unwrap();
        socket2::SockRef::from(&doomed)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(doomed);

        let received = echo_in_pieces(server.addr, b"still here", &[4]).await;
        assert_eq!(received, b"still here");

        server.stop().await;
    }

    #[tokio::test]
    async fn test_second_server_fails_to_bind() {
        let server = start();
        let config = Config {
            listen: server.addr,
            ..Config::default()
        };

        let err = Server::bind(&config).err().expect("address should be in use");
        assert!(err.is_addr_in_use());

        // The first instance is unaffected.
        assert_eq!(echo_in_pieces(server.addr, b"ok", &[2]).await, b"ok");
        server.stop().await;
    }

    #[tokio::test]
    async fn test_shutdown_closes_connections_and_listener() {
        let server = start();
        let addr = server.addr;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        server.stop().await;

        let n = tokio::time::timeout(Duration::from_secs(5), client.read(&mut buf))
            .await
            .expect("connection was not closed")
            .unwrap_or(0);
        assert_eq!(n, 0);

        assert!(TcpStream::connect(addr).await.is_err());
    }
}

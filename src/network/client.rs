//! Network Client
//!
//! Pooled TCP client for sending packets to meta nodes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{read_packet, write_packet, MetaTransport};
use crate::config::NetworkConfig;
use crate::error::{Error, Result};
use crate::proto::Packet;

/// Idle connection kept for reuse
struct PoolEntry {
    stream: TcpStream,
    last_used: Instant,
}

/// Network client for talking to meta nodes
pub struct NetworkClient {
    /// Idle connections per address
    pool: Mutex<HashMap<String, Vec<PoolEntry>>>,
    connect_timeout: Duration,
    read_deadline: Duration,
    write_deadline: Duration,
    /// Max idle connections kept per address
    max_idle: usize,
}

impl NetworkClient {
    /// Create a new network client
    pub fn new(connect_timeout: Duration, read_deadline: Duration, write_deadline: Duration) -> Self {
        Self {
            pool: Mutex::new(HashMap::new()),
            connect_timeout,
            read_deadline,
            write_deadline,
            max_idle: 8,
        }
    }

    /// Create a client from the network section of the configuration
    pub fn from_config(config: &NetworkConfig) -> Self {
        Self::new(
            config.connect_timeout(),
            config.read_deadline(),
            config.write_deadline(),
        )
    }

    /// Send a packet and wait for its reply
    ///
    /// A pooled connection is only abandoned for a fresh one when the packet
    /// provably never reached the peer: the write failed, or the peer closed
    /// the connection without sending a byte back. Any other failure is
    /// returned as is, since the request may already have been applied.
    pub async fn request(&self, address: &str, packet: &Packet) -> Result<Packet> {
        if let Some(entry) = self.take_idle(address) {
            let mut stream = entry.stream;
            if let Some(reply) = self.exchange(&mut stream, address, packet).await? {
                self.put_idle(address, stream);
                return Ok(reply);
            }
            tracing::debug!("Pooled connection to {} was closed by the peer, reconnecting", address);
        }

        let mut stream = self.connect(address).await?;
        match self.exchange(&mut stream, address, packet).await? {
            Some(reply) => {
                self.put_idle(address, stream);
                Ok(reply)
            }
            None => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: "connection closed before the reply".into(),
            }),
        }
    }

    /// Write `packet` and read its reply
    ///
    /// `None` means the packet was not delivered and may be resent.
    async fn exchange(&self, stream: &mut TcpStream, address: &str, packet: &Packet) -> Result<Option<Packet>> {
        let (mut reader, mut writer) = stream.split();

        let written = timeout(self.write_deadline, write_packet(&mut writer, packet))
            .await
            .map_err(|_| Error::ConnectionTimeout(address.to_string()))?;
        match written {
            Ok(()) => {}
            Err(Error::Io(e)) => {
                tracing::debug!("Write to {} failed: {}", address, e);
                return Ok(None);
            }
            Err(e) => return Err(e),
        }

        let reply = timeout(self.read_deadline, async {
            let mut first = [0u8; 1];
            if reader.read(&mut first).await? == 0 {
                return Ok(None);
            }
            let mut rest = (&first[..]).chain(&mut reader);
            read_packet(&mut rest).await.map(Some)
        })
        .await
        .map_err(|_| Error::ConnectionTimeout(address.to_string()))??;

        let Some(reply) = reply else {
            return Ok(None);
        };
        if reply.req_id != packet.req_id {
            return Err(Error::Network(format!(
                "reply {} from {} does not match request {}",
                reply.req_id, address, packet.req_id
            )));
        }
        Ok(Some(reply))
    }

    /// Connect to an address
    async fn connect(&self, address: &str) -> Result<TcpStream> {
        let result = timeout(self.connect_timeout, TcpStream::connect(address)).await;

        match result {
            Ok(Ok(stream)) => {
                stream.set_nodelay(true)?;
                Ok(stream)
            }
            Ok(Err(e)) => Err(Error::ConnectionFailed {
                address: address.to_string(),
                reason: e.to_string(),
            }),
            Err(_) => Err(Error::ConnectionTimeout(address.to_string())),
        }
    }

    fn take_idle(&self, address: &str) -> Option<PoolEntry> {
        self.pool.lock().get_mut(address)?.pop()
    }

    fn put_idle(&self, address: &str, stream: TcpStream) {
        let mut pool = self.pool.lock();
        let idle = pool.entry(address.to_string()).or_default();
        if idle.len() < self.max_idle {
            idle.push(PoolEntry {
                stream,
                last_used: Instant::now(),
            });
        }
    }

    /// Drop connections idle for longer than `max_idle`
    pub fn cleanup_stale(&self, max_idle: Duration) {
        let now = Instant::now();
        let mut pool = self.pool.lock();
        for (addr, idle) in pool.iter_mut() {
            let before = idle.len();
            idle.retain(|entry| now.duration_since(entry.last_used) <= max_idle);
            if idle.len() != before {
                tracing::debug!("Removed {} stale connections to {}", before - idle.len(), addr);
            }
        }
        pool.retain(|_, idle| !idle.is_empty());
    }

    /// Close all connections
    pub fn close_all(&self) {
        self.pool.lock().clear();
    }

    /// Number of idle connections held
    pub fn connection_count(&self) -> usize {
        self.pool.lock().values().map(Vec::len).sum()
    }
}

#[async_trait::async_trait]
impl MetaTransport for NetworkClient {
    async fn send(&self, addr: &str, packet: Packet) -> Result<Packet> {
        self.request(addr, &packet).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{OpCode, ResultCode};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use tokio::net::TcpListener;

    async fn echo_server() -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    while let Ok(packet) = read_packet(&mut reader).await {
                        let reply = packet.reply_code(ResultCode::Ok, "pong");
                        if write_packet(&mut writer, &reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_request_reuses_connection() {
        let addr = echo_server().await;
        let client = NetworkClient::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );

        for _ in 0..3 {
            let packet = Packet::request(OpCode::InodeGet, 1, &1u64).unwrap();
            let reply = client.request(&addr, &packet).await.unwrap();
            assert_eq!(reply.req_id, packet.req_id);
            assert_eq!(reply.message(), "pong");
        }
        assert_eq!(client.connection_count(), 1);

        client.cleanup_stale(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(5)).await;
        client.cleanup_stale(Duration::ZERO);
        assert_eq!(client.connection_count(), 0);
    }

    /// Answers the first packet of each connection at once and the rest
    /// after `delay`, counting every packet it reads
    async fn slow_server(delay: Duration, received: Arc<AtomicUsize>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let received = Arc::clone(&received);
                tokio::spawn(async move {
                    let (mut reader, mut writer) = socket.split();
                    let mut answered = 0;
                    while let Ok(packet) = read_packet(&mut reader).await {
                        received.fetch_add(1, Ordering::SeqCst);
                        if answered > 0 {
                            tokio::time::sleep(delay).await;
                        }
                        answered += 1;
                        let reply = packet.reply_code(ResultCode::Ok, "late");
                        if write_packet(&mut writer, &reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_timeout_on_pooled_connection_is_not_resent() {
        let received = Arc::new(AtomicUsize::new(0));
        let addr = slow_server(Duration::from_millis(300), Arc::clone(&received)).await;
        let client = NetworkClient::new(
            Duration::from_secs(1),
            Duration::from_millis(100),
            Duration::from_secs(1),
        );

        let packet = Packet::request(OpCode::UnlinkInode, 1, &7u64).unwrap();
        client.request(&addr, &packet).await.unwrap();
        assert_eq!(client.connection_count(), 1);

        let packet = Packet::request(OpCode::UnlinkInode, 1, &7u64).unwrap();
        let err = client.request(&addr, &packet).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout(_)));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 2);
        assert_eq!(client.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_reconnects_when_peer_closed_idle_connection() {
        let received = Arc::new(AtomicUsize::new(0));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let counter = Arc::clone(&received);
        tokio::spawn(async move {
            // one reply per connection, then close
            loop {
                let Ok((mut socket, _)) = listener.accept().await else { break };
                let (mut reader, mut writer) = socket.split();
                if let Ok(packet) = read_packet(&mut reader).await {
                    counter.fetch_add(1, Ordering::SeqCst);
                    let _ = write_packet(&mut writer, &packet.reply_code(ResultCode::Ok, "once")).await;
                }
            }
        });

        let client = NetworkClient::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        for _ in 0..2 {
            let packet = Packet::request(OpCode::InodeGet, 1, &1u64).unwrap();
            let reply = client.request(&addr, &packet).await.unwrap();
            assert_eq!(reply.message(), "once");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(received.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_connect_failure() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let client = NetworkClient::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let packet = Packet::request(OpCode::InodeGet, 1, &1u64).unwrap();
        let err = client.request(&addr, &packet).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_read_deadline() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move {
            let (_socket, _) = listener.accept().await.unwrap();
            tokio::time::sleep(Duration::from_secs(5)).await;
        });

        let client = NetworkClient::new(
            Duration::from_secs(1),
            Duration::from_millis(50),
            Duration::from_secs(1),
        );
        let packet = Packet::request(OpCode::InodeGet, 1, &1u64).unwrap();
        let err = client.request(&addr, &packet).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionTimeout(_)));
    }
}

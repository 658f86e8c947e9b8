//! Network Module
//!
//! Packet framing over TCP between meta clients and meta nodes.

mod client;
mod server;

pub use client::NetworkClient;
pub use server::MetaServer;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::Result;
use crate::proto::{Packet, PacketHeader};

/// Request/response exchange with a meta node
#[async_trait::async_trait]
pub trait MetaTransport: Send + Sync {
    /// Send `packet` to `addr` and wait for its reply
    async fn send(&self, addr: &str, packet: Packet) -> Result<Packet>;
}

/// Read a framed packet from a reader
pub async fn read_packet<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Packet> {
    let mut header_bytes = [0u8; PacketHeader::SIZE];
    reader.read_exact(&mut header_bytes).await?;
    let header = PacketHeader::from_bytes(&header_bytes)?;

    let mut body = vec![0u8; header.size as usize];
    reader.read_exact(&mut body).await?;

    Packet::from_parts(header, body)
}

/// Write a framed packet to a writer
pub async fn write_packet<W: AsyncWrite + Unpin>(writer: &mut W, packet: &Packet) -> Result<()> {
    writer.write_all(&packet.header().to_bytes()).await?;
    writer.write_all(&packet.data).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proto::{OpCode, ResultCode};

    #[tokio::test]
    async fn test_packet_framing() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = Packet::request(OpCode::Lookup, 9, &(1u64, "name".to_string())).unwrap();
        write_packet(&mut a, &request).await.unwrap();

        let received = read_packet(&mut b).await.unwrap();
        assert_eq!(received, request);
        assert_eq!(received.result_code(), ResultCode::Pending);
    }

    #[tokio::test]
    async fn test_corrupted_body_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let request = Packet::request(OpCode::ReadDir, 9, &1u64).unwrap();
        let mut header = request.header();
        header.crc ^= 1;
        a.write_all(&header.to_bytes()).await.unwrap();
        a.write_all(&request.data).await.unwrap();

        assert!(read_packet(&mut b).await.is_err());
    }
}

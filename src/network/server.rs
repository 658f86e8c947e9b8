//! Meta Server
//!
//! TCP server accepting client packets and handing them to the
//! metadata manager.

use std::sync::Arc;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

use super::{read_packet, write_packet};
use crate::error::{Error, Result};
use crate::metadata::MetadataManager;

/// Packet server for one meta node
pub struct MetaServer {
    bind_address: String,
    manager: Arc<MetadataManager>,
    shutdown: watch::Sender<bool>,
}

impl MetaServer {
    /// Create a new server
    pub fn new(bind_address: impl Into<String>, manager: Arc<MetadataManager>) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bind_address: bind_address.into(),
            manager,
            shutdown,
        }
    }

    /// Bind and serve until stopped
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.bind_address).await?;
        tracing::info!("Meta server listening on {}", self.bind_address);
        self.serve(listener).await
    }

    /// Serve connections from an already bound listener
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((socket, addr)) => {
                            let peer_addr = addr.to_string();
                            let manager = Arc::clone(&self.manager);
                            let shutdown = self.shutdown.subscribe();

                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(socket, &peer_addr, manager, shutdown).await {
                                    tracing::warn!("Connection error from {}: {}", peer_addr, e);
                                }
                            });
                        }
                        Err(e) => {
                            tracing::error!("Accept error: {}", e);
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Meta server stopped");
        Ok(())
    }

    /// Stop the server
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }
}

/// Serve packets on one connection in request order
async fn handle_connection(
    socket: TcpStream,
    peer_addr: &str,
    manager: Arc<MetadataManager>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    socket.set_nodelay(true)?;
    let (mut reader, mut writer) = socket.into_split();

    loop {
        let packet = tokio::select! {
            result = read_packet(&mut reader) => result,
            _ = shutdown.changed() => break,
        };

        match packet {
            Ok(packet) => {
                tracing::trace!("Received {} from {}", packet.describe(), peer_addr);
                let reply = manager.handle_packet(packet).await;
                write_packet(&mut writer, &reply).await?;
            }
            Err(Error::Io(ref e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                break;
            }
            Err(e) => {
                tracing::warn!("Error reading packet from {}: {}", peer_addr, e);
                break;
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PartitionSettings;
    use crate::network::NetworkClient;
    use crate::proto::{
        CreateInodeRequest, CreatePartitionRequest, InodeResponse, OpCode, Packet, ResultCode,
    };
    use std::time::Duration;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_serve_over_tcp() {
        let root = tempdir().unwrap();
        let manager = Arc::new(MetadataManager::new(
            "127.0.0.1:17210",
            root.path(),
            PartitionSettings::default(),
        ));
        manager
            .create_partition(&CreatePartitionRequest {
                partition_id: 1,
                volume: "ltptest".into(),
                start: 1,
                end: 100,
                members: vec!["127.0.0.1:17210".into()],
            })
            .await
            .unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let server = Arc::new(MetaServer::new(addr.clone(), Arc::clone(&manager)));
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let client = NetworkClient::new(
            Duration::from_secs(1),
            Duration::from_secs(1),
            Duration::from_secs(1),
        );
        let request = Packet::request(
            OpCode::CreateInode,
            1,
            &CreateInodeRequest {
                volume: "ltptest".into(),
                partition_id: 1,
                mode: 0o100644,
                uid: 0,
                gid: 0,
                target: None,
                parent: 0,
            },
        )
        .unwrap();
        let reply = client.request(&addr, &request).await.unwrap();
        assert_eq!(reply.result_code(), ResultCode::Ok);
        assert_eq!(reply.payload::<InodeResponse>().unwrap().info.inode, 1);

        let missing = Packet::request(OpCode::InodeGet, 9, &crate::proto::InodeRequest {
            partition_id: 9,
            inode: 1,
        })
        .unwrap();
        let reply = client.request(&addr, &missing).await.unwrap();
        assert_eq!(reply.result_code(), ResultCode::NotExist);

        server.stop();
        serving.await.unwrap().unwrap();
        manager.stop().await;
    }
}

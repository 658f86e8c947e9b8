//! Metadata manager
//!
//! Hosts every partition on a meta node: loads them from the metadata
//! directory at startup, creates and deletes them on request, and routes
//! incoming packets to the owning partition.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;

use super::layout::{parse_partition_dir, partition_dir, PartitionConfig};
use super::partition::MetaPartition;
use crate::config::PartitionSettings;
use crate::error::{Error, Result};
use crate::network::MetaTransport;
use crate::proto::{
    CreatePartitionRequest, DeletePartitionRequest, OpCode, Packet, ResultCode, Status,
    UpdatePartitionRequest,
};

/// All partitions hosted by this node
pub struct MetadataManager {
    node_addr: String,
    root: PathBuf,
    settings: PartitionSettings,
    partitions: RwLock<HashMap<u64, Arc<MetaPartition>>>,
    proxy: Option<Arc<dyn MetaTransport>>,
}

impl MetadataManager {
    /// Create a manager rooted at `root`; call [`start`](Self::start) to load partitions
    pub fn new(node_addr: impl Into<String>, root: impl AsRef<Path>, settings: PartitionSettings) -> Self {
        Self {
            node_addr: node_addr.into(),
            root: root.as_ref().to_path_buf(),
            settings,
            partitions: RwLock::new(HashMap::new()),
            proxy: None,
        }
    }

    /// Forward requests that reach a follower to the partition leader
    pub fn with_proxy(mut self, transport: Arc<dyn MetaTransport>) -> Self {
        self.proxy = Some(transport);
        self
    }

    pub fn node_addr(&self) -> &str {
        &self.node_addr
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Load every partition directory under the root; returns how many started
    pub fn start(&self) -> Result<usize> {
        fs::create_dir_all(&self.root)?;

        let mut started = 0;
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_partition_dir) else {
                continue;
            };

            match MetaPartition::open(&entry.path(), &self.node_addr, &self.settings) {
                Ok(partition) => {
                    self.partitions.write().insert(id, partition);
                    started += 1;
                }
                Err(e) => {
                    tracing::error!("Failed to load partition {}: {}", id, e);
                }
            }
        }

        tracing::info!("Loaded {} partitions from {}", started, self.root.display());
        Ok(started)
    }

    /// Create and start a new partition
    pub async fn create_partition(&self, req: &CreatePartitionRequest) -> Result<Arc<MetaPartition>> {
        if self.partitions.read().contains_key(&req.partition_id) {
            return Err(Error::Status(Status::Exist));
        }

        let mut config = PartitionConfig::new(req.partition_id, req.volume.clone(), req.start, req.end);
        config.peers = req.members.clone();
        config.node_id = self.node_addr.clone();
        config.root_dir = partition_dir(&self.root, req.partition_id);
        config.validate()?;
        if config.root_dir.exists() {
            return Err(Error::Status(Status::Exist));
        }
        config.persist()?;

        let partition = MetaPartition::open(&config.root_dir, &self.node_addr, &self.settings)?;

        let mut partitions = self.partitions.write();
        if partitions.contains_key(&req.partition_id) {
            return Err(Error::Status(Status::Exist));
        }
        partitions.insert(req.partition_id, Arc::clone(&partition));
        drop(partitions);

        tracing::info!(
            "Created partition {} for {} with range [{}, {}]",
            req.partition_id,
            req.volume,
            req.start,
            req.end
        );
        Ok(partition)
    }

    /// Delete a partition through its log and drop it from this node
    pub async fn delete_partition(&self, id: u64) -> Result<()> {
        let partition = self.partition(id)?;
        partition.delete_partition().await?;
        self.partitions.write().remove(&id);
        partition.stop().await;
        tracing::info!("Deleted partition {}", id);
        Ok(())
    }

    /// Extend a partition's inode range
    pub async fn update_partition(&self, id: u64, end: u64) -> Result<()> {
        self.partition(id)?.update_partition(end).await
    }

    pub fn partition(&self, id: u64) -> Result<Arc<MetaPartition>> {
        self.partitions
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::PartitionNotFound(id))
    }

    /// Every hosted partition, ordered by id
    pub fn partitions(&self) -> Vec<Arc<MetaPartition>> {
        let mut partitions: Vec<_> = self.partitions.read().values().cloned().collect();
        partitions.sort_by_key(|p| p.partition_id());
        partitions
    }

    /// Ids in `expected` that this node does not host, in the given order
    pub fn missing_partitions(&self, expected: &[u64]) -> Vec<u64> {
        let partitions = self.partitions.read();
        expected
            .iter()
            .copied()
            .filter(|id| !partitions.contains_key(id))
            .collect()
    }

    /// Serve one packet, always producing a reply
    pub async fn handle_packet(&self, packet: Packet) -> Packet {
        match self.dispatch(&packet).await {
            Ok(reply) => reply,
            Err(Error::NotLeader(leader)) => self.redirect(packet, leader).await,
            Err(e) => {
                tracing::debug!("{} failed: {}", packet.describe(), e);
                packet.reply_status(e.status(), &e.to_string())
            }
        }
    }

    async fn dispatch(&self, packet: &Packet) -> Result<Packet> {
        match packet.op()? {
            OpCode::CreateMetaPartition => {
                let req: CreatePartitionRequest = packet.payload()?;
                self.create_partition(&req).await?;
                packet.reply(&())
            }
            OpCode::DeleteMetaPartition => {
                let req: DeletePartitionRequest = packet.payload()?;
                self.delete_partition(req.partition_id).await?;
                packet.reply(&())
            }
            OpCode::UpdateMetaPartition => {
                let req: UpdatePartitionRequest = packet.payload()?;
                self.update_partition(req.partition_id, req.end).await?;
                packet.reply(&())
            }
            _ => {
                let partition = self.partition(packet.partition_id)?;
                partition.handle_packet(packet).await
            }
        }
    }

    /// Hand a request that reached a follower on to its leader
    async fn redirect(&self, packet: Packet, leader: String) -> Packet {
        let proxy = match &self.proxy {
            Some(proxy) if !leader.is_empty() && leader != self.node_addr => proxy,
            _ => {
                return packet.reply_code(
                    ResultCode::TryOtherAddr,
                    &format!("not leader, leader is {:?}", leader),
                )
            }
        };

        match proxy.send(&leader, packet.clone()).await {
            Ok(reply) => reply,
            Err(e) => {
                tracing::warn!("Forwarding {} to {} failed: {}", packet.describe(), leader, e);
                packet.reply_code(ResultCode::TryOtherAddr, &e.to_string())
            }
        }
    }

    /// Stop every partition's persistence worker
    pub async fn stop(&self) {
        let partitions: Vec<_> = self.partitions.write().drain().map(|(_, p)| p).collect();
        for partition in partitions {
            partition.stop().await;
        }
        tracing::info!("Metadata manager stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::inode::S_IFREG;
    use crate::proto::{CreateInodeRequest, InodeRequest, InodeResponse};
    use tempfile::tempdir;

    fn create_req(id: u64, start: u64, end: u64) -> CreatePartitionRequest {
        CreatePartitionRequest {
            partition_id: id,
            volume: "ltptest".into(),
            start,
            end,
            members: vec!["127.0.0.1:17210".into()],
        }
    }

    fn inode_req(partition_id: u64) -> CreateInodeRequest {
        CreateInodeRequest {
            volume: "ltptest".into(),
            partition_id,
            mode: S_IFREG | 0o644,
            uid: 0,
            gid: 0,
            target: None,
            parent: 1,
        }
    }

    #[tokio::test]
    async fn test_create_partition_twice() {
        let root = tempdir().unwrap();
        let manager = MetadataManager::new("127.0.0.1:17210", root.path(), PartitionSettings::default());

        manager.create_partition(&create_req(1, 1, 100)).await.unwrap();
        let err = manager.create_partition(&create_req(1, 1, 100)).await.unwrap_err();
        assert_eq!(err.status(), Status::Exist);

        let invalid = manager.create_partition(&create_req(2, 50, 10)).await.unwrap_err();
        assert!(matches!(invalid, Error::Config(_)));
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_missing_partitions() {
        let root = tempdir().unwrap();
        let manager = MetadataManager::new("127.0.0.1:17210", root.path(), PartitionSettings::default());
        manager.create_partition(&create_req(1, 1, 100)).await.unwrap();
        manager.create_partition(&create_req(2, 101, 200)).await.unwrap();

        assert!(manager.missing_partitions(&[2, 1]).is_empty());
        assert_eq!(manager.missing_partitions(&[7, 1, 3]), vec![7, 3]);
        assert!(manager.missing_partitions(&[]).is_empty());
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_packets_route_to_partition() {
        let root = tempdir().unwrap();
        let manager = MetadataManager::new("127.0.0.1:17210", root.path(), PartitionSettings::default());

        let create = Packet::request(OpCode::CreateMetaPartition, 0, &create_req(3, 201, 300)).unwrap();
        assert_eq!(manager.handle_packet(create).await.result_code(), ResultCode::Ok);

        let request = Packet::request(OpCode::CreateInode, 3, &inode_req(3)).unwrap();
        let reply = manager.handle_packet(request).await;
        assert_eq!(reply.result_code(), ResultCode::Ok);
        let info = reply.payload::<InodeResponse>().unwrap().info;
        assert_eq!(info.inode, 201);

        let get = Packet::request(OpCode::InodeGet, 3, &InodeRequest { partition_id: 3, inode: 250 }).unwrap();
        assert_eq!(manager.handle_packet(get).await.result_code(), ResultCode::NotExist);

        let unknown = Packet::request(OpCode::InodeGet, 4, &InodeRequest { partition_id: 4, inode: 1 }).unwrap();
        assert_eq!(manager.handle_packet(unknown).await.result_code(), ResultCode::NotExist);

        let mut garbage = Packet::request(OpCode::InodeGet, 3, &0u8).unwrap();
        garbage.opcode = 0x7E;
        assert_eq!(manager.handle_packet(garbage).await.result_code(), ResultCode::ArgMismatch);
        manager.stop().await;
    }

    #[tokio::test]
    async fn test_restart_loads_partitions() {
        let root = tempdir().unwrap();
        let manager = MetadataManager::new("127.0.0.1:17210", root.path(), PartitionSettings::default());
        manager.create_partition(&create_req(1, 1, 100)).await.unwrap();
        manager.create_partition(&create_req(2, 101, 200)).await.unwrap();
        manager.stop().await;

        fs::create_dir_all(root.path().join("not_a_partition")).unwrap();
        let restarted = MetadataManager::new("127.0.0.1:17210", root.path(), PartitionSettings::default());
        assert_eq!(restarted.start().unwrap(), 2);
        let ids: Vec<_> = restarted.partitions().iter().map(|p| p.partition_id()).collect();
        assert_eq!(ids, vec![1, 2]);
        restarted.stop().await;
    }

    #[tokio::test]
    async fn test_delete_partition_removes_directory() {
        let root = tempdir().unwrap();
        let manager = MetadataManager::new("127.0.0.1:17210", root.path(), PartitionSettings::default());
        let partition = manager.create_partition(&create_req(5, 1, 100)).await.unwrap();
        let dir = partition.dir().to_path_buf();

        manager.delete_partition(5).await.unwrap();
        assert!(!dir.exists());
        assert!(matches!(manager.partition(5), Err(Error::PartitionNotFound(5))));
        assert_eq!(partition.create_inode(&inode_req(5)).await.unwrap_err().status(), Status::Error);
    }
}

//! Metadata partition
//!
//! Leader-side request handling for one partition. Mutations are proposed
//! through the replication engine and answered with the state machine's
//! apply result; reads are served from structural clones of the trees.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::dentry::{Dentry, DentryKey};
use super::fsm::{ApplyResult, FsmProgress, PartitionFsm, PartitionState};
use super::inode::Inode;
use super::item::MetaItem;
use super::load::recover_partition;
use super::store::{store_queue, StoreHandle, StoreWorker};
use crate::config::PartitionSettings;
use crate::error::{Error, Result};
use crate::proto::{
    BatchInodeGetRequest, BatchInodeGetResponse, BatchUnlinkInodeRequest,
    BatchUnlinkInodeResponse, CreateDentryRequest, CreateInodeRequest, DeleteDentryResponse,
    DentryRequest, InodeInfo, InodeRequest, InodeResponse, LookupNameRequest,
    LookupNameResponse, LookupResponse, OpCode, Packet, ReadDirRequest, ReadDirResponse,
    SetAttrRequest, Status, UnlinkInodeItem, UpdateDentryRequest, UpdateDentryResponse,
};
use crate::replication::{LocalReplicator, ReplicationEngine, StateMachine};
use crate::tree::IndexedTree;

/// Replication engine driving a partition
pub type PartitionEngine = Arc<dyn ReplicationEngine<ApplyResult>>;

/// Point-in-time summary of a partition
#[derive(Debug, Clone, serde::Serialize)]
pub struct PartitionSummary {
    pub partition_id: u64,
    pub volume: String,
    pub start: u64,
    pub end: u64,
    pub cursor: u64,
    pub applied_index: u64,
    pub stored_index: u64,
    pub inode_count: usize,
    pub dentry_count: usize,
    pub leader: Option<String>,
    pub is_leader: bool,
    pub state: String,
}

/// One metadata partition hosted on this node
pub struct MetaPartition {
    partition_id: u64,
    volume: String,
    start: u64,
    dir: PathBuf,
    fsm: Arc<Mutex<PartitionFsm>>,
    progress: Arc<FsmProgress>,
    engine: PartitionEngine,
    store: Mutex<Option<StoreHandle>>,
    alloc_cursor: AtomicU64,
}

impl MetaPartition {
    /// Recover a partition directory and start it with a single-node engine
    pub fn open(dir: &Path, node_addr: &str, settings: &PartitionSettings) -> Result<Arc<Self>> {
        let address = node_addr.to_string();
        Self::open_with(dir, node_addr, settings, move |fsm, applied| {
            let engine: PartitionEngine = LocalReplicator::start(address, fsm, applied);
            engine
        })
    }

    /// Recover a partition directory and start it with the engine built by `start_engine`
    pub fn open_with<F>(
        dir: &Path,
        node_addr: &str,
        settings: &PartitionSettings,
        start_engine: F,
    ) -> Result<Arc<Self>>
    where
        F: FnOnce(Arc<Mutex<PartitionFsm>>, u64) -> PartitionEngine,
    {
        let recovered = recover_partition(dir)?;
        let (store_tx, store_rx) = store_queue(settings.store_queue_depth);
        let fsm = PartitionFsm::from_recovered(recovered, node_addr, store_tx);

        let partition_id = fsm.partition_id();
        let volume = fsm.config().volume.clone();
        let start = fsm.config().start;
        let cursor = fsm.cursor();
        let applied = StateMachine::applied_index(&fsm);
        let progress = fsm.progress();
        let fsm = Arc::new(Mutex::new(fsm));

        // the engine resumes right after the recovered applied index
        let engine = start_engine(Arc::clone(&fsm), applied);
        let store = StoreWorker::spawn(
            partition_id,
            dir.to_path_buf(),
            store_rx,
            Arc::clone(&engine),
            Arc::clone(&progress),
            settings.clone(),
        );

        tracing::info!(
            "Partition {} ({}) started at index {}, cursor {}",
            partition_id,
            volume,
            applied,
            cursor
        );

        Ok(Arc::new(Self {
            partition_id,
            volume,
            start,
            dir: dir.to_path_buf(),
            fsm,
            progress,
            engine,
            store: Mutex::new(Some(store)),
            alloc_cursor: AtomicU64::new(cursor),
        }))
    }

    pub fn partition_id(&self) -> u64 {
        self.partition_id
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn progress(&self) -> &FsmProgress {
        &self.progress
    }

    pub fn is_leader(&self) -> bool {
        self.engine.is_leader()
    }

    pub fn leader(&self) -> Option<String> {
        self.engine.leader()
    }

    /// Check if the partition still accepts requests
    pub fn is_serving(&self) -> bool {
        self.progress.state() == PartitionState::Running
    }

    /// Structural clones of both trees
    pub fn trees(&self) -> (IndexedTree<u64, Inode>, IndexedTree<DentryKey, Dentry>) {
        let fsm = self.fsm.lock();
        (fsm.inode_tree(), fsm.dentry_tree())
    }

    pub fn summary(&self) -> PartitionSummary {
        let (inodes, dentries) = self.trees();
        PartitionSummary {
            partition_id: self.partition_id,
            volume: self.volume.clone(),
            start: self.start,
            end: self.progress.end(),
            cursor: self.progress.cursor(),
            applied_index: self.progress.applied_index(),
            stored_index: self.progress.stored_index(),
            inode_count: inodes.len(),
            dentry_count: dentries.len(),
            leader: self.leader(),
            is_leader: self.is_leader(),
            state: format!("{:?}", self.progress.state()),
        }
    }

    /// Stop the persistence worker
    pub async fn stop(&self) {
        let handle = self.store.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
    }

    fn check_serving(&self) -> Result<()> {
        if self.is_serving() {
            Ok(())
        } else {
            Err(Error::PartitionStopped(self.partition_id))
        }
    }

    /// Reserve the next inode id in this partition's range
    fn next_inode_id(&self) -> Result<u64> {
        loop {
            let current = self.alloc_cursor.load(Ordering::Acquire);
            let next = current.max(self.progress.cursor()) + 1;
            if next > self.progress.end() {
                return Err(Error::Status(Status::Full));
            }
            if self
                .alloc_cursor
                .compare_exchange(current, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(next);
            }
        }
    }

    async fn propose(&self, item: MetaItem) -> Result<ApplyResult> {
        self.check_serving()?;
        if !self.engine.is_leader() {
            return Err(Error::NotLeader(self.leader().unwrap_or_default()));
        }
        self.engine.submit(item.encode()?).await
    }

    async fn propose_inode(&self, item: MetaItem) -> Result<Inode> {
        let result = self.propose(item).await?;
        match (result.status, result.inode) {
            (Status::Ok, Some(inode)) => Ok(inode),
            (Status::Ok, None) => Err(Error::Internal("apply returned no inode".into())),
            (status, _) => Err(Error::Status(status)),
        }
    }

    // ============ Mutations ============

    pub async fn create_inode(&self, req: &CreateInodeRequest) -> Result<Inode> {
        self.check_serving()?;
        let ino = self.next_inode_id()?;
        let now = chrono::Utc::now().timestamp();

        let mut inode = Inode::new(ino, req.mode, now);
        inode.uid = req.uid;
        inode.gid = req.gid;
        inode.parent = req.parent;
        inode.link_target = req.target.clone();
        if let Some(target) = &req.target {
            inode.size = target.len() as u64;
        }

        self.propose_inode(MetaItem::CreateInode(inode)).await
    }

    pub async fn unlink_inode(&self, ino: u64) -> Result<Inode> {
        self.propose_inode(MetaItem::UnlinkInode { inode: ino }).await
    }

    /// Unlink several inodes through one log entry; one item per requested inode
    pub async fn batch_unlink_inodes(&self, inos: &[u64]) -> Result<Vec<UnlinkInodeItem>> {
        if inos.is_empty() {
            return Ok(Vec::new());
        }
        let result = self
            .propose(MetaItem::BatchUnlinkInode {
                inodes: inos.to_vec(),
            })
            .await?;
        status_to_result(result.status)?;

        Ok(inos
            .iter()
            .zip(result.batch)
            .map(|(&inode, item)| UnlinkInodeItem {
                inode,
                status: item.status,
                info: item.inode.as_ref().map(InodeInfo::from),
            })
            .collect())
    }

    pub async fn link_inode(&self, ino: u64) -> Result<Inode> {
        self.propose_inode(MetaItem::CreateLinkInode { inode: ino }).await
    }

    pub async fn evict_inode(&self, ino: u64) -> Result<()> {
        let result = self.propose(MetaItem::EvictInode { inode: ino }).await?;
        status_to_result(result.status)
    }

    pub async fn set_attr(&self, req: &SetAttrRequest) -> Result<Inode> {
        self.propose_inode(MetaItem::SetAttr(req.clone())).await
    }

    pub async fn create_dentry(&self, req: &CreateDentryRequest) -> Result<()> {
        validate_name(&req.name)?;
        if req.parent == req.inode {
            return Err(Error::Status(Status::Exist));
        }
        let dentry = Dentry::new(req.parent, req.name.clone(), req.inode, req.mode);
        let result = self.propose(MetaItem::CreateDentry(dentry)).await?;
        status_to_result(result.status)
    }

    /// Remove a dentry, returning the child it pointed at
    pub async fn delete_dentry(&self, parent: u64, name: &str) -> Result<u64> {
        let item = MetaItem::DeleteDentry {
            parent,
            name: name.to_string(),
        };
        let result = self.propose(item).await?;
        status_to_result(result.status)?;
        result
            .dentry
            .map(|d| d.inode)
            .ok_or_else(|| Error::Internal("apply returned no dentry".into()))
    }

    /// Point a dentry at a new child, returning the previous child
    pub async fn update_dentry(&self, req: &UpdateDentryRequest) -> Result<u64> {
        let mode = self
            .lookup(req.parent, &req.name)
            .map(|d| d.mode)
            .unwrap_or(0);
        let dentry = Dentry::new(req.parent, req.name.clone(), req.inode, mode);
        let result = self.propose(MetaItem::UpdateDentry(dentry)).await?;
        status_to_result(result.status)?;
        result
            .dentry
            .map(|d| d.inode)
            .ok_or_else(|| Error::Internal("apply returned no dentry".into()))
    }

    pub async fn update_partition(&self, end: u64) -> Result<()> {
        let result = self.propose(MetaItem::UpdatePartition { end }).await?;
        status_to_result(result.status)
    }

    pub async fn delete_partition(&self) -> Result<()> {
        let result = self.propose(MetaItem::DeletePartition).await?;
        status_to_result(result.status)
    }

    /// Force a snapshot at the current log position
    pub async fn store_tick(&self) -> Result<()> {
        self.propose(MetaItem::StoreTick).await.map(|_| ())
    }

    // ============ Reads ============

    pub fn get_inode(&self, ino: u64) -> Result<Inode> {
        let (inodes, _) = self.trees();
        match inodes.get(&ino) {
            Some(inode) if !inode.is_marked_delete() => Ok(inode.clone()),
            _ => Err(Error::Status(Status::Noent)),
        }
    }

    pub fn batch_get_inodes(&self, inos: &[u64]) -> Vec<Inode> {
        let (inodes, _) = self.trees();
        inos.iter()
            .filter_map(|ino| inodes.get(ino))
            .filter(|inode| !inode.is_marked_delete())
            .cloned()
            .collect()
    }

    pub fn lookup(&self, parent: u64, name: &str) -> Result<Dentry> {
        let (_, dentries) = self.trees();
        dentries
            .get(&(parent, name.to_string()))
            .cloned()
            .ok_or(Error::Status(Status::Noent))
    }

    pub fn read_dir(&self, parent: u64) -> Vec<Dentry> {
        let (_, dentries) = self.trees();
        dentries
            .range(Dentry::children_range(parent))
            .map(|(_, dentry)| dentry.clone())
            .collect()
    }

    pub fn lookup_name(&self, parent: u64, ino: u64) -> Result<String> {
        let (_, dentries) = self.trees();
        let name = dentries
            .range(Dentry::children_range(parent))
            .find(|(_, dentry)| dentry.inode == ino)
            .map(|(_, dentry)| dentry.name.clone());
        name.ok_or(Error::Status(Status::Noent))
    }

    // ============ Packet handling ============

    /// Serve a client packet addressed to this partition
    pub async fn handle_packet(&self, packet: &Packet) -> Result<Packet> {
        match packet.op()? {
            OpCode::CreateInode => {
                let req: CreateInodeRequest = packet.payload()?;
                let inode = self.create_inode(&req).await?;
                packet.reply(&InodeResponse {
                    info: InodeInfo::from(&inode),
                })
            }
            OpCode::UnlinkInode => {
                let req: InodeRequest = packet.payload()?;
                let inode = self.unlink_inode(req.inode).await?;
                packet.reply(&InodeResponse {
                    info: InodeInfo::from(&inode),
                })
            }
            OpCode::BatchUnlinkInode => {
                let req: BatchUnlinkInodeRequest = packet.payload()?;
                let items = self.batch_unlink_inodes(&req.inodes).await?;
                packet.reply(&BatchUnlinkInodeResponse { items })
            }
            OpCode::LinkInode => {
                let req: InodeRequest = packet.payload()?;
                let inode = self.link_inode(req.inode).await?;
                packet.reply(&InodeResponse {
                    info: InodeInfo::from(&inode),
                })
            }
            OpCode::EvictInode => {
                let req: InodeRequest = packet.payload()?;
                self.evict_inode(req.inode).await?;
                packet.reply(&())
            }
            OpCode::SetAttr => {
                let req: SetAttrRequest = packet.payload()?;
                let inode = self.set_attr(&req).await?;
                packet.reply(&InodeResponse {
                    info: InodeInfo::from(&inode),
                })
            }
            OpCode::CreateDentry => {
                let req: CreateDentryRequest = packet.payload()?;
                self.create_dentry(&req).await?;
                packet.reply(&())
            }
            OpCode::DeleteDentry => {
                let req: DentryRequest = packet.payload()?;
                let inode = self.delete_dentry(req.parent, &req.name).await?;
                packet.reply(&DeleteDentryResponse { inode })
            }
            OpCode::UpdateDentry => {
                let req: UpdateDentryRequest = packet.payload()?;
                let inode = self.update_dentry(&req).await?;
                packet.reply(&UpdateDentryResponse { inode })
            }
            OpCode::InodeGet => {
                let req: InodeRequest = packet.payload()?;
                let inode = self.get_inode(req.inode)?;
                packet.reply(&InodeResponse {
                    info: InodeInfo::from(&inode),
                })
            }
            OpCode::BatchInodeGet => {
                let req: BatchInodeGetRequest = packet.payload()?;
                let infos = self
                    .batch_get_inodes(&req.inodes)
                    .iter()
                    .map(InodeInfo::from)
                    .collect();
                packet.reply(&BatchInodeGetResponse { infos })
            }
            OpCode::Lookup => {
                let req: DentryRequest = packet.payload()?;
                let dentry = self.lookup(req.parent, &req.name)?;
                packet.reply(&LookupResponse {
                    inode: dentry.inode,
                    mode: dentry.mode,
                })
            }
            OpCode::ReadDir => {
                let req: ReadDirRequest = packet.payload()?;
                packet.reply(&ReadDirResponse {
                    children: self.read_dir(req.parent),
                })
            }
            OpCode::LookupName => {
                let req: LookupNameRequest = packet.payload()?;
                let name = self.lookup_name(req.parent, req.inode)?;
                packet.reply(&LookupNameResponse { name })
            }
            op @ (OpCode::CreateMetaPartition
            | OpCode::DeleteMetaPartition
            | OpCode::UpdateMetaPartition) => Err(Error::Internal(format!(
                "{} is not a partition request",
                op.name()
            ))),
        }
    }
}

impl std::fmt::Debug for MetaPartition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetaPartition")
            .field("partition_id", &self.partition_id)
            .field("volume", &self.volume)
            .field("dir", &self.dir)
            .field("state", &self.progress.state())
            .finish()
    }
}

fn status_to_result(status: Status) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(Error::Status(status))
    }
}

fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() || name.contains('/') || name == "." || name == ".." {
        return Err(Error::Status(Status::Inval));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::inode::{S_IFDIR, S_IFREG};
    use crate::metadata::layout::{partition_dir, PartitionConfig};
    use tempfile::tempdir;

    fn open(root: &Path, start: u64, end: u64) -> Arc<MetaPartition> {
        let mut config = PartitionConfig::new(1, "ltptest", start, end);
        config.root_dir = partition_dir(root, 1);
        config.persist().unwrap();
        MetaPartition::open(&config.root_dir, "127.0.0.1:17210", &PartitionSettings::default())
            .unwrap()
    }

    fn create_req(mode: u32) -> CreateInodeRequest {
        CreateInodeRequest {
            volume: "ltptest".into(),
            partition_id: 1,
            mode,
            uid: 1000,
            gid: 1000,
            target: None,
            parent: 1,
        }
    }

    #[tokio::test]
    async fn test_inode_ids_follow_cursor() {
        let root = tempdir().unwrap();
        let mp = open(root.path(), 1, 100);

        let first = mp.create_inode(&create_req(S_IFDIR | 0o755)).await.unwrap();
        let second = mp.create_inode(&create_req(S_IFREG | 0o644)).await.unwrap();

        assert_eq!(first.inode, 1);
        assert_eq!(second.inode, 2);
        assert_eq!(mp.progress().cursor(), 2);
        assert_eq!(mp.get_inode(2).unwrap().uid, 1000);
        mp.stop().await;
    }

    #[tokio::test]
    async fn test_range_exhaustion_reports_full() {
        let root = tempdir().unwrap();
        let mp = open(root.path(), 10, 11);

        mp.create_inode(&create_req(S_IFREG)).await.unwrap();
        mp.create_inode(&create_req(S_IFREG)).await.unwrap();
        let err = mp.create_inode(&create_req(S_IFREG)).await.unwrap_err();
        assert_eq!(err.status(), Status::Full);

        mp.update_partition(20).await.unwrap();
        assert_eq!(mp.create_inode(&create_req(S_IFREG)).await.unwrap().inode, 12);
        mp.stop().await;
    }

    #[tokio::test]
    async fn test_dentries_and_reads() {
        let root = tempdir().unwrap();
        let mp = open(root.path(), 1, 100);
        let dir = mp.create_inode(&create_req(S_IFDIR | 0o755)).await.unwrap();
        let file = mp.create_inode(&create_req(S_IFREG | 0o644)).await.unwrap();

        let req = CreateDentryRequest {
            partition_id: 1,
            parent: dir.inode,
            name: "a.txt".into(),
            inode: file.inode,
            mode: file.mode,
        };
        mp.create_dentry(&req).await.unwrap();

        let found = mp.lookup(dir.inode, "a.txt").unwrap();
        assert_eq!(found.inode, file.inode);
        assert_eq!(found.mode, S_IFREG);
        assert_eq!(mp.read_dir(dir.inode).len(), 1);
        assert_eq!(mp.lookup_name(dir.inode, file.inode).unwrap(), "a.txt");

        let self_ref = CreateDentryRequest {
            inode: dir.inode,
            name: "self".into(),
            ..req.clone()
        };
        assert_eq!(
            mp.create_dentry(&self_ref).await.unwrap_err().status(),
            Status::Exist
        );

        let bad = CreateDentryRequest {
            name: "a/b".into(),
            ..req
        };
        assert_eq!(mp.create_dentry(&bad).await.unwrap_err().status(), Status::Inval);

        assert_eq!(mp.delete_dentry(dir.inode, "a.txt").await.unwrap(), file.inode);
        assert!(mp.read_dir(dir.inode).is_empty());

        let batch = mp.batch_get_inodes(&[dir.inode, 77, file.inode]);
        assert_eq!(batch.len(), 2);
        mp.stop().await;
    }

    #[tokio::test]
    async fn test_restart_recovers_snapshot() {
        let root = tempdir().unwrap();
        let mp = open(root.path(), 1, 100);
        for _ in 0..3 {
            mp.create_inode(&create_req(S_IFREG)).await.unwrap();
        }
        mp.store_tick().await.unwrap();

        for _ in 0..200 {
            if mp.progress().stored_index() == 4 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(mp.progress().stored_index(), 4);
        let (inodes, dentries) = mp.trees();
        mp.stop().await;

        let reopened =
            MetaPartition::open(mp.dir(), "127.0.0.1:17210", &PartitionSettings::default()).unwrap();
        let (recovered_inodes, recovered_dentries) = reopened.trees();
        assert_eq!(recovered_inodes, inodes);
        assert_eq!(recovered_dentries, dentries);
        assert_eq!(reopened.progress().applied_index(), 4);

        let next = reopened.create_inode(&create_req(S_IFREG)).await.unwrap();
        assert_eq!(next.inode, 4);
        reopened.stop().await;
    }

    #[tokio::test]
    async fn test_batch_unlink_packet() {
        let root = tempdir().unwrap();
        let mp = open(root.path(), 1, 100);
        let a = mp.create_inode(&create_req(S_IFREG | 0o644)).await.unwrap();
        let b = mp.create_inode(&create_req(S_IFREG | 0o644)).await.unwrap();
        mp.link_inode(b.inode).await.unwrap();

        let request = Packet::request(
            OpCode::BatchUnlinkInode,
            1,
            &BatchUnlinkInodeRequest {
                partition_id: 1,
                inodes: vec![a.inode, 77, b.inode],
            },
        )
        .unwrap();
        let reply = mp.handle_packet(&request).await.unwrap();
        let items = reply.payload::<BatchUnlinkInodeResponse>().unwrap().items;

        assert_eq!(items.len(), 3);
        assert_eq!(items[0].status, Status::Ok);
        assert_eq!(items[0].info.as_ref().unwrap().nlink, 0);
        assert_eq!(items[1].inode, 77);
        assert_eq!(items[1].status, Status::Noent);
        assert!(items[1].info.is_none());
        assert_eq!(items[2].info.as_ref().unwrap().nlink, 1);

        assert_eq!(mp.get_inode(a.inode).unwrap_err().status(), Status::Noent);
        assert!(mp.batch_unlink_inodes(&[]).await.unwrap().is_empty());
        mp.stop().await;
    }
}

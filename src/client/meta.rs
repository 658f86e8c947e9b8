//! Meta client
//!
//! Typed filesystem metadata operations for one volume. Every call resolves
//! the owning partition through the [`PartitionRouter`] and makes one round
//! trip to that partition's leader; only inode creation rotates across
//! write targets.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::master::{MasterClient, VolStat, VolStatus, VolumeInfo};
use super::partition::Partition;
use super::router::PartitionRouter;
use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::metadata::Dentry;
use crate::network::MetaTransport;
use crate::proto::{
    BatchInodeGetRequest, BatchInodeGetResponse, BatchUnlinkInodeRequest,
    BatchUnlinkInodeResponse, CreateDentryRequest, CreateInodeRequest,
    DeleteDentryResponse, DentryRequest, InodeInfo, InodeRequest, InodeResponse,
    LookupNameRequest, LookupNameResponse, LookupResponse, OpCode, Packet, ReadDirRequest,
    ReadDirResponse, ResultCode, SetAttrRequest, Status, UnlinkInodeItem, UpdateDentryRequest,
    UpdateDentryResponse,
};

/// Metadata client for one volume
pub struct MetaClient {
    volume: String,
    router: Arc<PartitionRouter>,
    master: Option<MasterClient>,
    transport: Arc<dyn MetaTransport>,
    stat: RwLock<Option<VolStat>>,
    info: RwLock<Option<VolumeInfo>>,
    refresh_interval: Duration,
    shutdown: watch::Sender<bool>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
}

impl MetaClient {
    /// Client whose partition map comes from the master
    pub fn new(
        volume: impl Into<String>,
        master: MasterClient,
        transport: Arc<dyn MetaTransport>,
        refresh_interval: Duration,
    ) -> Self {
        Self::build(volume.into(), Arc::new(PartitionRouter::new()), Some(master), transport, refresh_interval)
    }

    /// Client over a router whose map is installed by the caller
    pub fn with_router(
        volume: impl Into<String>,
        router: Arc<PartitionRouter>,
        transport: Arc<dyn MetaTransport>,
    ) -> Self {
        Self::build(volume.into(), router, None, transport, Duration::from_secs(60))
    }

    /// Client built from the `[client]` configuration section
    pub fn from_config(config: &ClientConfig, transport: Arc<dyn MetaTransport>) -> Result<Self> {
        let master = MasterClient::new(config.master_addrs.clone(), config.http_timeout())?;
        Ok(Self::new(config.volume.clone(), master, transport, config.refresh_interval()))
    }

    fn build(
        volume: String,
        router: Arc<PartitionRouter>,
        master: Option<MasterClient>,
        transport: Arc<dyn MetaTransport>,
        refresh_interval: Duration,
    ) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            volume,
            router,
            master,
            transport,
            stat: RwLock::new(None),
            info: RwLock::new(None),
            refresh_interval,
            shutdown,
            refresh_task: Mutex::new(None),
        }
    }

    pub fn volume(&self) -> &str {
        &self.volume
    }

    pub fn router(&self) -> &Arc<PartitionRouter> {
        &self.router
    }

    // ============ Topology ============

    /// Fetch the partition map and volume statistics from the master
    ///
    /// A failed fetch leaves the previous map and statistics in place. The
    /// volume descriptor is fetched once; failing to get it does not fail
    /// the refresh.
    pub async fn refresh(&self) -> Result<()> {
        let Some(master) = &self.master else {
            return Ok(());
        };

        let view = master.volume_view(&self.volume).await?;
        self.router.install(view.partitions)?;

        let stat = master.vol_stat(&self.volume).await?;
        *self.stat.write() = Some(stat);

        if self.info.read().is_none() {
            match master.get_volume(&self.volume).await {
                Ok(info) => *self.info.write() = Some(info),
                Err(e) => tracing::warn!("Descriptor of volume {} unavailable: {}", self.volume, e),
            }
        }
        Ok(())
    }

    /// Spawn the periodic refresh task; it ends on [`stop`](Self::stop) or when the client is dropped
    pub fn start_refresh(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown.subscribe();
        let interval = self.refresh_interval;
        let volume = self.volume.clone();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let Some(client) = weak.upgrade() else { break };
                        if let Err(e) = client.refresh().await {
                            tracing::warn!("Refresh of volume {} failed, keeping previous map: {}", volume, e);
                        }
                    }
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::debug!("Refresh task for volume {} stopped", volume);
        });

        if let Some(previous) = self.refresh_task.lock().replace(task) {
            previous.abort();
        }
    }

    /// Stop the refresh task
    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let task = self.refresh_task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }

    /// Last fetched volume statistics
    pub fn vol_stat(&self) -> Option<VolStat> {
        self.stat.read().clone()
    }

    /// Volume descriptor, once a refresh has fetched it
    pub fn volume_info(&self) -> Option<VolumeInfo> {
        self.info.read().clone()
    }

    /// Last fetched volume status
    pub fn volume_status(&self) -> Option<VolStatus> {
        self.stat.read().as_ref().map(|stat| stat.status)
    }

    fn check_writable(&self) -> Result<()> {
        match self.volume_status() {
            Some(VolStatus::ReadWrite) | None => Ok(()),
            Some(status) => {
                tracing::debug!("Volume {} is {:?}, refusing create", self.volume, status);
                Err(Error::Status(Status::NotPerm))
            }
        }
    }

    // ============ Transport ============

    async fn call<T: Serialize>(&self, partition: &Partition, op: OpCode, req: &T) -> Result<Packet> {
        let packet = Packet::request(op, partition.id, req)?;
        let addr = partition.leader_addr()?;
        let reply = self.transport.send(addr, packet).await?;

        match reply.result_code() {
            ResultCode::Ok => Ok(reply),
            ResultCode::TryOtherAddr => Err(Error::NotLeader(reply.message())),
            code => {
                tracing::debug!(
                    "{} on partition {} returned {:?}: {}",
                    op.name(),
                    partition.id,
                    code,
                    reply.message()
                );
                Err(Error::Status(code.to_status()))
            }
        }
    }

    async fn create_inode_on(
        &self,
        partition: &Partition,
        mode: u32,
        uid: u32,
        gid: u32,
        target: Option<Vec<u8>>,
        parent: u64,
    ) -> Result<InodeInfo> {
        let req = CreateInodeRequest {
            volume: self.volume.clone(),
            partition_id: partition.id,
            mode,
            uid,
            gid,
            target,
            parent,
        };
        let reply = self.call(partition, OpCode::CreateInode, &req).await?;
        Ok(reply.payload::<InodeResponse>()?.info)
    }

    async fn create_dentry_on(
        &self,
        partition: &Partition,
        parent: u64,
        name: &str,
        inode: u64,
        mode: u32,
    ) -> Result<()> {
        if parent == inode {
            return Err(Error::Status(Status::Exist));
        }
        let req = CreateDentryRequest {
            partition_id: partition.id,
            parent,
            name: name.to_string(),
            inode,
            mode,
        };
        self.call(partition, OpCode::CreateDentry, &req).await?;
        Ok(())
    }

    /// Undo an inode whose dentry could not be created
    async fn compensate(&self, partition: &Partition, inode: u64) {
        let req = InodeRequest {
            partition_id: partition.id,
            inode,
        };
        if let Err(e) = self.call(partition, OpCode::UnlinkInode, &req).await {
            tracing::error!("Compensating unlink of inode {} failed: {}", inode, e);
        }
        if let Err(e) = self.call(partition, OpCode::EvictInode, &req).await {
            tracing::error!("Compensating evict of inode {} failed: {}", inode, e);
        }
    }

    // ============ Inode operations ============

    /// Create an inode on the next write target, rotating on transient failures
    pub async fn create_inode(
        &self,
        mode: u32,
        uid: u32,
        gid: u32,
        target: Option<Vec<u8>>,
    ) -> Result<InodeInfo> {
        self.check_writable()?;
        let mut last_error = Error::NoWritablePartition;

        for partition in self.router.write_targets()? {
            match self.create_inode_on(&partition, mode, uid, gid, target.clone(), 0).await {
                Ok(info) => return Ok(info),
                Err(e) if rotates(&e) => {
                    tracing::debug!("Create on partition {} failed, trying next: {}", partition.id, e);
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_error)
    }

    /// Create an inode and link it under `parent` as `name`
    pub async fn create_inode_and_dentry(
        &self,
        parent: u64,
        name: &str,
        mode: u32,
        uid: u32,
        gid: u32,
        target: Option<Vec<u8>>,
    ) -> Result<InodeInfo> {
        self.check_writable()?;
        let parent_partition = self.router.resolve_partition(parent)?;
        let mut last_error = Error::NoWritablePartition;

        for partition in self.router.write_targets()? {
            let info = match self.create_inode_on(&partition, mode, uid, gid, target.clone(), parent).await {
                Ok(info) => info,
                Err(e) if rotates(&e) => {
                    tracing::debug!("Create on partition {} failed, trying next: {}", partition.id, e);
                    last_error = e;
                    continue;
                }
                Err(e) => return Err(e),
            };

            return match self
                .create_dentry_on(&parent_partition, parent, name, info.inode, mode)
                .await
            {
                Ok(()) => Ok(info),
                Err(e) => {
                    tracing::warn!(
                        "Dentry {} under {} failed after creating inode {}: {}",
                        name,
                        parent,
                        info.inode,
                        e
                    );
                    self.compensate(&partition, info.inode).await;
                    Err(e)
                }
            };
        }
        Err(last_error)
    }

    pub async fn get_inode(&self, inode: u64) -> Result<InodeInfo> {
        let partition = self.router.resolve_partition(inode)?;
        let req = InodeRequest {
            partition_id: partition.id,
            inode,
        };
        let reply = self.call(&partition, OpCode::InodeGet, &req).await?;
        Ok(reply.payload::<InodeResponse>()?.info)
    }

    /// Fetch several inodes, one request per owning partition; missing ids are left out
    pub async fn batch_get_inodes(&self, inodes: &[u64]) -> Result<Vec<InodeInfo>> {
        let mut groups: BTreeMap<u64, (Partition, Vec<u64>)> = BTreeMap::new();
        for &inode in inodes {
            match self.router.resolve_partition(inode) {
                Ok(partition) => groups
                    .entry(partition.id)
                    .or_insert_with(|| (partition, Vec::new()))
                    .1
                    .push(inode),
                Err(e) => tracing::debug!("Skipping inode {}: {}", inode, e),
            }
        }

        let mut infos = Vec::with_capacity(inodes.len());
        for (_, (partition, inodes)) in groups {
            let req = BatchInodeGetRequest {
                partition_id: partition.id,
                inodes,
            };
            let reply = self.call(&partition, OpCode::BatchInodeGet, &req).await?;
            infos.extend(reply.payload::<BatchInodeGetResponse>()?.infos);
        }
        Ok(infos)
    }

    pub async fn unlink_inode(&self, inode: u64) -> Result<InodeInfo> {
        self.inode_op(OpCode::UnlinkInode, inode).await
    }

    /// Unlink several inodes, one request per owning partition
    ///
    /// Returns one item per requested id in request order. Ids outside every
    /// partition come back as `Noent` without a round trip.
    pub async fn batch_unlink_inodes(&self, inodes: &[u64]) -> Result<Vec<UnlinkInodeItem>> {
        let mut groups: BTreeMap<u64, (Partition, Vec<u64>)> = BTreeMap::new();
        let mut unrouted = Vec::new();
        for &inode in inodes {
            match self.router.resolve_partition(inode) {
                Ok(partition) => groups
                    .entry(partition.id)
                    .or_insert_with(|| (partition, Vec::new()))
                    .1
                    .push(inode),
                Err(e) => {
                    tracing::debug!("Unlink of inode {} not routed: {}", inode, e);
                    unrouted.push(inode);
                }
            }
        }

        let mut results: BTreeMap<u64, UnlinkInodeItem> = unrouted
            .into_iter()
            .map(|inode| {
                let item = UnlinkInodeItem {
                    inode,
                    status: Status::Noent,
                    info: None,
                };
                (inode, item)
            })
            .collect();

        for (_, (partition, inodes)) in groups {
            let req = BatchUnlinkInodeRequest {
                partition_id: partition.id,
                inodes,
            };
            let reply = self.call(&partition, OpCode::BatchUnlinkInode, &req).await?;
            for item in reply.payload::<BatchUnlinkInodeResponse>()?.items {
                results.insert(item.inode, item);
            }
        }

        Ok(inodes
            .iter()
            .map(|inode| {
                results.get(inode).cloned().unwrap_or(UnlinkInodeItem {
                    inode: *inode,
                    status: Status::Noent,
                    info: None,
                })
            })
            .collect())
    }

    pub async fn link_inode(&self, inode: u64) -> Result<InodeInfo> {
        self.inode_op(OpCode::LinkInode, inode).await
    }

    pub async fn evict_inode(&self, inode: u64) -> Result<()> {
        let partition = self.router.resolve_partition(inode)?;
        let req = InodeRequest {
            partition_id: partition.id,
            inode,
        };
        self.call(&partition, OpCode::EvictInode, &req).await?;
        Ok(())
    }

    async fn inode_op(&self, op: OpCode, inode: u64) -> Result<InodeInfo> {
        let partition = self.router.resolve_partition(inode)?;
        let req = InodeRequest {
            partition_id: partition.id,
            inode,
        };
        let reply = self.call(&partition, op, &req).await?;
        Ok(reply.payload::<InodeResponse>()?.info)
    }

    /// Apply the fields selected by `req.valid` to `req.inode`
    pub async fn set_attr(&self, mut req: SetAttrRequest) -> Result<InodeInfo> {
        let partition = self.router.resolve_partition(req.inode)?;
        req.partition_id = partition.id;
        let reply = self.call(&partition, OpCode::SetAttr, &req).await?;
        Ok(reply.payload::<InodeResponse>()?.info)
    }

    // ============ Dentry operations ============

    pub async fn create_dentry(&self, parent: u64, name: &str, inode: u64, mode: u32) -> Result<()> {
        self.check_writable()?;
        let partition = self.router.resolve_partition(parent)?;
        self.create_dentry_on(&partition, parent, name, inode, mode).await
    }

    /// Remove `name` from `parent`, returning the child it pointed at
    pub async fn delete_dentry(&self, parent: u64, name: &str) -> Result<u64> {
        let partition = self.router.resolve_partition(parent)?;
        let req = DentryRequest {
            partition_id: partition.id,
            parent,
            name: name.to_string(),
        };
        let reply = self.call(&partition, OpCode::DeleteDentry, &req).await?;
        Ok(reply.payload::<DeleteDentryResponse>()?.inode)
    }

    /// Point `name` under `parent` at `inode`, returning the previous child
    pub async fn update_dentry(&self, parent: u64, name: &str, inode: u64) -> Result<u64> {
        let partition = self.router.resolve_partition(parent)?;
        let req = UpdateDentryRequest {
            partition_id: partition.id,
            parent,
            name: name.to_string(),
            inode,
        };
        let reply = self.call(&partition, OpCode::UpdateDentry, &req).await?;
        Ok(reply.payload::<UpdateDentryResponse>()?.inode)
    }

    /// Child inode and file type of `name` under `parent`
    pub async fn lookup(&self, parent: u64, name: &str) -> Result<(u64, u32)> {
        let partition = self.router.resolve_partition(parent)?;
        let req = DentryRequest {
            partition_id: partition.id,
            parent,
            name: name.to_string(),
        };
        let reply = self.call(&partition, OpCode::Lookup, &req).await?;
        let resp: LookupResponse = reply.payload()?;
        Ok((resp.inode, resp.mode))
    }

    pub async fn read_dir(&self, parent: u64) -> Result<Vec<Dentry>> {
        let partition = self.router.resolve_partition(parent)?;
        let req = ReadDirRequest {
            partition_id: partition.id,
            parent,
        };
        let reply = self.call(&partition, OpCode::ReadDir, &req).await?;
        Ok(reply.payload::<ReadDirResponse>()?.children)
    }

    /// Name under which `inode` is linked in `parent`
    pub async fn lookup_name(&self, parent: u64, inode: u64) -> Result<String> {
        let partition = self.router.resolve_partition(parent)?;
        let req = LookupNameRequest {
            partition_id: partition.id,
            parent,
            inode,
        };
        let reply = self.call(&partition, OpCode::LookupName, &req).await?;
        Ok(reply.payload::<LookupNameResponse>()?.name)
    }
}

impl Drop for MetaClient {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

/// Check if a create failure should move on to the next write target
fn rotates(err: &Error) -> bool {
    err.is_retryable() || err.status() == Status::Full
}

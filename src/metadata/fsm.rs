//! Partition state machine
//!
//! The only mutator of a partition's inode and dentry trees. The replication
//! engine calls [`PartitionFsm::apply`] once per committed entry, in log order;
//! everything else reads through structural clones of the trees.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use super::dentry::{Dentry, DentryKey};
use super::inode::Inode;
use super::item::{MetaItem, SnapshotRecord};
use super::layout::PartitionConfig;
use super::load::RecoveredState;
use super::store::{StoreJob, StoreMsg, StoreQueue};
use crate::error::{Error, Result};
use crate::proto::{SetAttrRequest, Status};
use crate::replication::{SnapshotIter, StateMachine};
use crate::tree::IndexedTree;

/// Lifecycle of a partition replica
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartitionState {
    Running = 0,
    Deleted = 1,
    Fatal = 2,
}

impl PartitionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => PartitionState::Running,
            1 => PartitionState::Deleted,
            _ => PartitionState::Fatal,
        }
    }
}

/// Progress counters published by the state machine for lock-free readers
#[derive(Debug, Default)]
pub struct FsmProgress {
    applied: AtomicU64,
    cursor: AtomicU64,
    end: AtomicU64,
    stored: AtomicU64,
    state: AtomicU8,
}

impl FsmProgress {
    pub fn applied_index(&self) -> u64 {
        self.applied.load(Ordering::Acquire)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor.load(Ordering::Acquire)
    }

    pub fn end(&self) -> u64 {
        self.end.load(Ordering::Acquire)
    }

    /// Index of the last snapshot written to disk
    pub fn stored_index(&self) -> u64 {
        self.stored.load(Ordering::Acquire)
    }

    pub fn state(&self) -> PartitionState {
        PartitionState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_stored_index(&self, index: u64) {
        self.stored.fetch_max(index, Ordering::AcqRel);
    }

    fn set_state(&self, state: PartitionState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Per-entry outcome returned to the proposer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyResult {
    pub status: Status,
    pub inode: Option<Inode>,
    pub dentry: Option<Dentry>,
    /// One result per inode of a batch entry, in request order
    pub batch: Vec<ApplyResult>,
}

impl ApplyResult {
    pub fn status(status: Status) -> Self {
        Self {
            status,
            inode: None,
            dentry: None,
            batch: Vec::new(),
        }
    }

    pub fn ok() -> Self {
        Self::status(Status::Ok)
    }

    pub fn with_inode(inode: Inode) -> Self {
        Self {
            status: Status::Ok,
            inode: Some(inode),
            dentry: None,
            batch: Vec::new(),
        }
    }

    pub fn with_dentry(status: Status, dentry: Dentry) -> Self {
        Self {
            status,
            inode: None,
            dentry: Some(dentry),
            batch: Vec::new(),
        }
    }
}

/// State machine of one metadata partition
pub struct PartitionFsm {
    config: PartitionConfig,
    node_addr: String,
    inodes: IndexedTree<u64, Inode>,
    dentries: IndexedTree<DentryKey, Dentry>,
    applied_index: u64,
    progress: Arc<FsmProgress>,
    store_tx: StoreQueue,
}

impl PartitionFsm {
    /// Empty state machine for a freshly created partition
    pub fn new(config: PartitionConfig, node_addr: impl Into<String>, store_tx: StoreQueue) -> Self {
        Self::from_recovered(RecoveredState::empty(config), node_addr, store_tx)
    }

    /// State machine seeded from a recovered snapshot
    pub fn from_recovered(
        recovered: RecoveredState,
        node_addr: impl Into<String>,
        store_tx: StoreQueue,
    ) -> Self {
        let mut config = recovered.config;
        config.cursor = config.cursor.max(recovered.cursor);

        let progress = Arc::new(FsmProgress::default());
        progress.applied.store(recovered.applied_index, Ordering::Release);
        progress.stored.store(recovered.applied_index, Ordering::Release);
        progress.cursor.store(config.cursor, Ordering::Release);
        progress.end.store(config.end, Ordering::Release);

        Self {
            config,
            node_addr: node_addr.into(),
            inodes: recovered.inodes,
            dentries: recovered.dentries,
            applied_index: recovered.applied_index,
            progress,
            store_tx,
        }
    }

    pub fn partition_id(&self) -> u64 {
        self.config.partition_id
    }

    pub fn config(&self) -> &PartitionConfig {
        &self.config
    }

    pub fn cursor(&self) -> u64 {
        self.config.cursor
    }

    pub fn progress(&self) -> Arc<FsmProgress> {
        Arc::clone(&self.progress)
    }

    /// Structural clone of the inode tree
    pub fn inode_tree(&self) -> IndexedTree<u64, Inode> {
        self.inodes.clone()
    }

    /// Structural clone of the dentry tree
    pub fn dentry_tree(&self) -> IndexedTree<DentryKey, Dentry> {
        self.dentries.clone()
    }

    fn dispatch(&mut self, item: MetaItem, index: u64) -> Result<ApplyResult> {
        match item {
            MetaItem::CreateInode(inode) => self.fsm_create_inode(inode),
            MetaItem::UnlinkInode { inode } => Ok(self.fsm_unlink_inode(inode)),
            MetaItem::BatchUnlinkInode { inodes } => Ok(self.fsm_batch_unlink_inode(&inodes)),
            MetaItem::CreateLinkInode { inode } => Ok(self.fsm_link_inode(inode)),
            MetaItem::EvictInode { inode } => Ok(self.fsm_evict_inode(inode)),
            MetaItem::SetAttr(req) => Ok(self.fsm_set_attr(&req)),
            MetaItem::CreateDentry(dentry) => Ok(self.fsm_create_dentry(dentry)),
            MetaItem::DeleteDentry { parent, name } => Ok(self.fsm_delete_dentry(parent, name)),
            MetaItem::UpdateDentry(dentry) => Ok(self.fsm_update_dentry(dentry)),
            MetaItem::UpdatePartition { end } => Ok(self.fsm_update_partition(end)),
            MetaItem::DeletePartition => Ok(self.fsm_delete_partition()),
            MetaItem::StoreTick => Ok(self.fsm_store_tick(index)),
            MetaItem::StartStoreTick => {
                self.enqueue(StoreMsg::StartTick);
                Ok(ApplyResult::ok())
            }
            MetaItem::StopStoreTick => {
                self.enqueue(StoreMsg::StopTick);
                Ok(ApplyResult::ok())
            }
        }
    }

    fn fsm_create_inode(&mut self, inode: Inode) -> Result<ApplyResult> {
        if !self.config.contains(inode.inode) {
            return Err(Error::Internal(format!(
                "inode {} outside partition {} range [{}, {}]",
                inode.inode, self.config.partition_id, self.config.start, self.config.end
            )));
        }

        self.config.cursor = self.config.cursor.max(inode.inode);
        self.progress.cursor.store(self.config.cursor, Ordering::Release);
        self.inodes.insert(inode.inode, inode.clone());
        Ok(ApplyResult::with_inode(inode))
    }

    fn fsm_unlink_inode(&mut self, ino: u64) -> ApplyResult {
        let updated = self.inodes.update(&ino, |inode| {
            if inode.is_marked_delete() {
                return None;
            }
            inode.unlink();
            Some(inode.clone())
        });

        match updated.flatten() {
            Some(inode) => ApplyResult::with_inode(inode),
            None => ApplyResult::status(Status::Noent),
        }
    }

    fn fsm_batch_unlink_inode(&mut self, inos: &[u64]) -> ApplyResult {
        let batch = inos.iter().map(|&ino| self.fsm_unlink_inode(ino)).collect();
        ApplyResult {
            batch,
            ..ApplyResult::ok()
        }
    }

    fn fsm_link_inode(&mut self, ino: u64) -> ApplyResult {
        let updated = self.inodes.update(&ino, |inode| {
            if inode.is_marked_delete() {
                return None;
            }
            inode.link();
            Some(inode.clone())
        });

        match updated.flatten() {
            Some(inode) => ApplyResult::with_inode(inode),
            None => ApplyResult::status(Status::Noent),
        }
    }

    fn fsm_evict_inode(&mut self, ino: u64) -> ApplyResult {
        let evictable = match self.inodes.get(&ino) {
            Some(inode) => inode.can_evict(),
            None => return ApplyResult::status(Status::Noent),
        };
        if evictable {
            self.inodes.remove(&ino);
        }
        ApplyResult::ok()
    }

    fn fsm_set_attr(&mut self, req: &SetAttrRequest) -> ApplyResult {
        let updated = self.inodes.update(&req.inode, |inode| {
            if inode.is_marked_delete() {
                return None;
            }
            inode.set_attr(req);
            Some(inode.clone())
        });

        match updated.flatten() {
            Some(inode) => ApplyResult::with_inode(inode),
            None => ApplyResult::status(Status::Noent),
        }
    }

    fn fsm_create_dentry(&mut self, dentry: Dentry) -> ApplyResult {
        if dentry.inode == dentry.parent {
            return ApplyResult::with_dentry(Status::Exist, dentry);
        }

        let key = dentry.key();
        if let Some(existing) = self.dentries.get(&key) {
            let status = if existing.inode == dentry.inode {
                Status::Ok
            } else {
                Status::Exist
            };
            return ApplyResult::with_dentry(status, existing.clone());
        }

        self.dentries.insert(key, dentry.clone());
        ApplyResult::with_dentry(Status::Ok, dentry)
    }

    fn fsm_delete_dentry(&mut self, parent: u64, name: String) -> ApplyResult {
        match self.dentries.remove(&(parent, name)) {
            Some(removed) => ApplyResult::with_dentry(Status::Ok, removed.as_ref().clone()),
            None => ApplyResult::status(Status::Noent),
        }
    }

    fn fsm_update_dentry(&mut self, dentry: Dentry) -> ApplyResult {
        let child = dentry.inode;
        let previous = self.dentries.update(&dentry.key(), |existing| {
            let previous = existing.clone();
            existing.inode = child;
            existing.mode = dentry.mode;
            previous
        });

        match previous {
            Some(previous) => ApplyResult::with_dentry(Status::Ok, previous),
            None => ApplyResult::status(Status::Noent),
        }
    }

    fn fsm_update_partition(&mut self, end: u64) -> ApplyResult {
        if end < self.config.cursor || end < self.config.start {
            return ApplyResult::status(Status::Inval);
        }

        self.config.end = end;
        self.progress.end.store(end, Ordering::Release);
        self.enqueue(StoreMsg::PersistConfig(self.config.clone()));
        tracing::info!("Partition {} range end set to {}", self.config.partition_id, end);
        ApplyResult::ok()
    }

    fn fsm_delete_partition(&mut self) -> ApplyResult {
        self.progress.set_state(PartitionState::Deleted);
        self.enqueue(StoreMsg::Destroy);
        tracing::info!("Partition {} marked deleted", self.config.partition_id);
        ApplyResult::ok()
    }

    fn fsm_store_tick(&mut self, index: u64) -> ApplyResult {
        self.enqueue(StoreMsg::Store(StoreJob {
            apply_index: index,
            cursor: self.config.cursor,
            inodes: self.inodes.clone(),
            dentries: self.dentries.clone(),
        }));
        ApplyResult::ok()
    }

    /// Hand a message to the persistence worker without blocking apply
    fn enqueue(&self, msg: StoreMsg) {
        let name = msg.name();
        if let Err(e) = self.store_tx.send(msg) {
            tracing::warn!(
                "Partition {} dropped {} for the store worker: {}",
                self.config.partition_id,
                name,
                e
            );
        }
    }
}

impl StateMachine for PartitionFsm {
    type Response = ApplyResult;

    fn apply(&mut self, data: &[u8], index: u64) -> Result<ApplyResult> {
        match self.progress.state() {
            PartitionState::Running => {}
            _ => return Err(Error::PartitionStopped(self.config.partition_id)),
        }

        if index <= self.applied_index {
            tracing::debug!(
                "Partition {} skipping entry {} (applied {})",
                self.config.partition_id,
                index,
                self.applied_index
            );
            return Ok(ApplyResult::ok());
        }

        let item = MetaItem::decode(data).map_err(|e| {
            tracing::warn!(
                "Partition {} failed to decode entry {}: {}",
                self.config.partition_id,
                index,
                e
            );
            e
        })?;
        tracing::trace!("Partition {} applying {} at {}", self.config.partition_id, item.name(), index);

        let result = self.dispatch(item, index)?;
        self.applied_index = index;
        self.progress.applied.store(index, Ordering::Release);
        Ok(result)
    }

    fn snapshot(&self) -> Result<SnapshotIter> {
        let position = SnapshotRecord::Position {
            applied_index: self.applied_index,
            cursor: self.config.cursor,
        };
        let inodes = self
            .inodes
            .clone()
            .into_records()
            .map(|(_, inode)| SnapshotRecord::Inode(inode.as_ref().clone()));
        let dentries = self
            .dentries
            .clone()
            .into_records()
            .map(|(_, dentry)| SnapshotRecord::Dentry(dentry.as_ref().clone()));

        Ok(Box::new(
            std::iter::once(position)
                .chain(inodes)
                .chain(dentries)
                .map(|record| record.encode()),
        ))
    }

    fn apply_snapshot(&mut self, peers: &[String], records: SnapshotIter) -> Result<()> {
        let mut inodes = IndexedTree::new();
        let mut dentries = IndexedTree::new();
        let mut applied_index = 0;
        let mut cursor = self.config.start.saturating_sub(1);

        for record in records {
            match SnapshotRecord::decode(&record?)? {
                SnapshotRecord::Position {
                    applied_index: index,
                    cursor: stored,
                } => {
                    applied_index = index;
                    cursor = cursor.max(stored);
                }
                SnapshotRecord::Inode(inode) => {
                    cursor = cursor.max(inode.inode);
                    inodes.insert(inode.inode, inode);
                }
                SnapshotRecord::Dentry(dentry) => {
                    dentries.insert(dentry.key(), dentry);
                }
            }
        }

        self.inodes = inodes;
        self.dentries = dentries;
        self.applied_index = applied_index;
        self.config.cursor = self.config.cursor.max(cursor);
        self.config.peers = peers.to_vec();
        self.progress.applied.store(applied_index, Ordering::Release);
        self.progress.cursor.store(self.config.cursor, Ordering::Release);

        tracing::info!(
            "Partition {} installed snapshot at index {} ({} inodes, {} dentries)",
            self.config.partition_id,
            applied_index,
            self.inodes.len(),
            self.dentries.len()
        );

        self.enqueue(StoreMsg::PersistConfig(self.config.clone()));
        self.fsm_store_tick(applied_index);
        Ok(())
    }

    fn handle_leader_change(&mut self, leader: Option<&str>) {
        let is_self = leader == Some(self.node_addr.as_str());
        tracing::info!(
            "Partition {} leader changed to {} (self: {})",
            self.config.partition_id,
            leader.unwrap_or("none"),
            is_self
        );
        self.enqueue(if is_self {
            StoreMsg::StartTick
        } else {
            StoreMsg::StopTick
        });
    }

    fn handle_fatal(&mut self, err: &Error) {
        self.progress.set_state(PartitionState::Fatal);
        self.enqueue(StoreMsg::StopTick);
        tracing::error!(
            "Partition {} stopped after fatal replication error: {}",
            self.config.partition_id,
            err
        );
    }

    fn applied_index(&self) -> u64 {
        self.applied_index
    }
}

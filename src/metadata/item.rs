//! Log entries submitted to and replayed from the replication log

use serde::{Deserialize, Serialize};

use super::dentry::Dentry;
use super::inode::Inode;
use crate::error::Result;
use crate::proto::SetAttrRequest;

/// One replicated mutation of a partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetaItem {
    CreateInode(Inode),
    UnlinkInode { inode: u64 },
    BatchUnlinkInode { inodes: Vec<u64> },
    CreateLinkInode { inode: u64 },
    EvictInode { inode: u64 },
    SetAttr(SetAttrRequest),
    CreateDentry(Dentry),
    DeleteDentry { parent: u64, name: String },
    UpdateDentry(Dentry),
    UpdatePartition { end: u64 },
    DeletePartition,
    StoreTick,
    StartStoreTick,
    StopStoreTick,
}

impl MetaItem {
    /// Serialize to log bytes
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize from log bytes
    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }

    /// Get entry name for logging
    pub fn name(&self) -> &'static str {
        match self {
            MetaItem::CreateInode(_) => "CreateInode",
            MetaItem::UnlinkInode { .. } => "UnlinkInode",
            MetaItem::BatchUnlinkInode { .. } => "BatchUnlinkInode",
            MetaItem::CreateLinkInode { .. } => "CreateLinkInode",
            MetaItem::EvictInode { .. } => "EvictInode",
            MetaItem::SetAttr(_) => "SetAttr",
            MetaItem::CreateDentry(_) => "CreateDentry",
            MetaItem::DeleteDentry { .. } => "DeleteDentry",
            MetaItem::UpdateDentry(_) => "UpdateDentry",
            MetaItem::UpdatePartition { .. } => "UpdatePartition",
            MetaItem::DeletePartition => "DeletePartition",
            MetaItem::StoreTick => "StoreTick",
            MetaItem::StartStoreTick => "StartStoreTick",
            MetaItem::StopStoreTick => "StopStoreTick",
        }
    }
}

/// Unit of a snapshot transferred between replicas
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotRecord {
    Position { applied_index: u64, cursor: u64 },
    Inode(Inode),
    Dentry(Dentry),
}

impl SnapshotRecord {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}

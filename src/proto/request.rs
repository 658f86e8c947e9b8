//! Request and response payloads carried in packet bodies

use serde::{Deserialize, Serialize};

use super::status::Status;
use crate::metadata::{Dentry, Inode};

/// Set-attr field: mode permission bits
pub const ATTR_MODE: u32 = 1 << 0;
/// Set-attr field: owner
pub const ATTR_UID: u32 = 1 << 1;
/// Set-attr field: group
pub const ATTR_GID: u32 = 1 << 2;
/// Set-attr field: modify time
pub const ATTR_MODIFY_TIME: u32 = 1 << 3;
/// Set-attr field: access time
pub const ATTR_ACCESS_TIME: u32 = 1 << 4;

/// Inode attributes returned to clients
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InodeInfo {
    pub inode: u64,
    pub mode: u32,
    pub nlink: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
    pub generation: u64,
    pub create_time: i64,
    pub access_time: i64,
    pub modify_time: i64,
    pub target: Option<Vec<u8>>,
    pub parent: u64,
}

impl From<&Inode> for InodeInfo {
    fn from(inode: &Inode) -> Self {
        Self {
            inode: inode.inode,
            mode: inode.mode,
            nlink: inode.nlink,
            size: inode.size,
            uid: inode.uid,
            gid: inode.gid,
            generation: inode.generation,
            create_time: inode.create_time,
            access_time: inode.access_time,
            modify_time: inode.modify_time,
            target: inode.link_target.clone(),
            parent: inode.parent,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateInodeRequest {
    pub volume: String,
    pub partition_id: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub target: Option<Vec<u8>>,
    pub parent: u64,
}

/// Unlink, link, evict and get of a single inode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeRequest {
    pub partition_id: u64,
    pub inode: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InodeResponse {
    pub info: InodeInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInodeGetRequest {
    pub partition_id: u64,
    pub inodes: Vec<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchInodeGetResponse {
    pub infos: Vec<InodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUnlinkInodeRequest {
    pub partition_id: u64,
    pub inodes: Vec<u64>,
}

/// Outcome of unlinking one inode of a batch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnlinkInodeItem {
    pub inode: u64,
    pub status: Status,
    pub info: Option<InodeInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchUnlinkInodeResponse {
    pub items: Vec<UnlinkInodeItem>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDentryRequest {
    pub partition_id: u64,
    pub parent: u64,
    pub name: String,
    pub inode: u64,
    pub mode: u32,
}

/// Delete and lookup of a single dentry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DentryRequest {
    pub partition_id: u64,
    pub parent: u64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteDentryResponse {
    pub inode: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDentryRequest {
    pub partition_id: u64,
    pub parent: u64,
    pub name: String,
    pub inode: u64,
}

/// Carries the child the dentry pointed at before the update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateDentryResponse {
    pub inode: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupResponse {
    pub inode: u64,
    pub mode: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadDirRequest {
    pub partition_id: u64,
    pub parent: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadDirResponse {
    pub children: Vec<Dentry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupNameRequest {
    pub partition_id: u64,
    pub parent: u64,
    pub inode: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupNameResponse {
    pub name: String,
}

/// Attribute update; only fields whose bit is set in `valid` are applied
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetAttrRequest {
    pub partition_id: u64,
    pub inode: u64,
    pub valid: u32,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub access_time: i64,
    pub modify_time: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreatePartitionRequest {
    pub partition_id: u64,
    pub volume: String,
    pub start: u64,
    pub end: u64,
    pub members: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeletePartitionRequest {
    pub partition_id: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePartitionRequest {
    pub partition_id: u64,
    pub end: u64,
}

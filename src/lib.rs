//! WolfMeta - Replicated Metadata Partitions for a Distributed Filesystem
//!
//! The metadata tier of a sharded filesystem: inodes and directory entries
//! are split into partitions by inode range, each partition is a replicated
//! state machine, and clients route every request to the partition that
//! owns the inode involved.
//!
//! # Architecture
//!
//! A metanode hosts many partitions. Each one keeps its inode and dentry
//! trees in memory, applies committed log entries in order, and
//! periodically persists a checksummed snapshot. Clients hold an atomically
//! swapped partition map fetched from the control plane and spread new
//! inodes across writable partitions.
//!
//! # Features
//!
//! - Copy-on-write inode and dentry trees with O(1) structural clones
//! - Ordered, idempotent apply with a durable watermark
//! - Crash-safe snapshot swap with CRC signatures and recovery
//! - Binary packet protocol with per-request deadlines
//! - Client router with lock-free map refresh and write-target rotation
//! - HTTP API for partition inspection

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod metadata;
pub mod network;
pub mod proto;
pub mod replication;
pub mod tree;

pub use config::WolfMetaConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::client::{MetaClient, Partition, PartitionRouter};
    pub use crate::config::WolfMetaConfig;
    pub use crate::error::{Error, Result};
    pub use crate::metadata::{Dentry, Inode, MetaPartition, MetadataManager};
    pub use crate::network::{MetaServer, NetworkClient};
    pub use crate::proto::{OpCode, Packet, Status};
}

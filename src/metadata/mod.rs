//! Metadata Module
//!
//! Server side of the metadata tier: the inode and dentry records, the
//! partition state machine that mutates them, snapshot persistence and
//! recovery, and the manager hosting every partition on a node.

mod dentry;
mod fsm;
mod inode;
mod item;
mod layout;
mod load;
mod manager;
mod partition;
mod store;

pub use dentry::{Dentry, DentryKey};
pub use fsm::{ApplyResult, FsmProgress, PartitionFsm, PartitionState};
pub use inode::{Inode, DELETE_MARK_FLAG, S_IFDIR, S_IFLNK, S_IFMT, S_IFREG};
pub use item::{MetaItem, SnapshotRecord};
pub use layout::{partition_dir, parse_partition_dir, PartitionConfig};
pub use load::{load_snapshot, recover_partition, RecoveredState, Snapshot};
pub use manager::MetadataManager;
pub use partition::{MetaPartition, PartitionEngine, PartitionSummary};
pub use store::{store_snapshot, SnapshotSign, StoreHandle, StoreJob, StoreMsg, StoreWorker};

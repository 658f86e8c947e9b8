//! Partition records
//!
//! Routing metadata for every partition of a volume, as published by the
//! control plane, and the immutable view the router swaps in on refresh.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tree::IndexedTree;

/// Health of a partition as reported by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "i8", into = "i8")]
pub enum PartitionStatus {
    ReadOnly,
    ReadWrite,
    Unavailable,
}

impl From<i8> for PartitionStatus {
    fn from(value: i8) -> Self {
        match value {
            1 => PartitionStatus::ReadOnly,
            2 => PartitionStatus::ReadWrite,
            _ => PartitionStatus::Unavailable,
        }
    }
}

impl From<PartitionStatus> for i8 {
    fn from(status: PartitionStatus) -> Self {
        match status {
            PartitionStatus::ReadOnly => 1,
            PartitionStatus::ReadWrite => 2,
            PartitionStatus::Unavailable => -1,
        }
    }
}

/// Routing record for one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partition {
    pub id: u64,
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub members: Vec<String>,
    #[serde(default)]
    pub leader: String,
    pub status: PartitionStatus,
}

impl Partition {
    /// Check if `inode` falls inside this partition's range
    pub fn contains(&self, inode: u64) -> bool {
        self.start <= inode && inode <= self.end
    }

    pub fn is_writable(&self) -> bool {
        self.status == PartitionStatus::ReadWrite
    }

    /// Address requests should be sent to
    pub fn leader_addr(&self) -> Result<&str> {
        if self.leader.is_empty() {
            return Err(Error::NotLeader(format!("partition {} has no leader", self.id)));
        }
        Ok(&self.leader)
    }
}

/// Immutable partition map of one volume
#[derive(Debug, Clone, Default)]
pub struct PartitionView {
    ranges: IndexedTree<u64, Partition>,
    by_id: HashMap<u64, Partition>,
    writable: Vec<Partition>,
}

impl PartitionView {
    /// Build a view, rejecting empty, duplicate or overlapping ranges
    pub fn build(mut partitions: Vec<Partition>) -> Result<Self> {
        partitions.sort_by_key(|p| p.start);

        let mut previous: Option<&Partition> = None;
        for partition in &partitions {
            if partition.start > partition.end {
                return Err(Error::InvalidTopology(format!(
                    "partition {} has empty range [{}, {}]",
                    partition.id, partition.start, partition.end
                )));
            }
            if let Some(prev) = previous {
                if prev.end >= partition.start {
                    return Err(Error::InvalidTopology(format!(
                        "partition {} [{}, {}] overlaps partition {} [{}, {}]",
                        partition.id, partition.start, partition.end, prev.id, prev.start, prev.end
                    )));
                }
            }
            previous = Some(partition);
        }

        let mut by_id = HashMap::with_capacity(partitions.len());
        for partition in &partitions {
            if by_id.insert(partition.id, partition.clone()).is_some() {
                return Err(Error::InvalidTopology(format!(
                    "partition {} listed twice",
                    partition.id
                )));
            }
        }

        let writable = partitions.iter().filter(|p| p.is_writable()).cloned().collect();
        let ranges = partitions.into_iter().map(|p| (p.start, p)).collect();

        Ok(Self {
            ranges,
            by_id,
            writable,
        })
    }

    /// Partition whose range contains `inode`
    pub fn resolve(&self, inode: u64) -> Option<&Partition> {
        self.ranges
            .descend_le(&inode)
            .map(|(_, partition)| partition)
            .filter(|partition| partition.contains(inode))
    }

    pub fn by_id(&self, id: u64) -> Option<&Partition> {
        self.by_id.get(&id)
    }

    /// Partitions accepting new inodes, ordered by range
    pub fn writable(&self) -> &[Partition] {
        &self.writable
    }

    /// Every partition, ordered by range
    pub fn all(&self) -> Vec<Partition> {
        self.ranges.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }
}

//! Partition router
//!
//! Resolves inode ids to their owning partition and picks write targets for
//! new inodes. The partition map is replaced wholesale through an atomic
//! pointer swap, so readers always see either the old or the new map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arc_swap::ArcSwap;

use super::partition::{Partition, PartitionView};
use crate::error::{Error, Result};

/// Client-side router over one volume's partition map
pub struct PartitionRouter {
    view: ArcSwap<PartitionView>,
    epoch: AtomicU64,
}

impl Default for PartitionRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl PartitionRouter {
    /// Router with an empty map
    pub fn new() -> Self {
        Self {
            view: ArcSwap::from_pointee(PartitionView::default()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Replace the partition map; an invalid map leaves the current one in place
    pub fn install(&self, partitions: Vec<Partition>) -> Result<()> {
        let view = PartitionView::build(partitions)?;
        tracing::debug!(
            "Installed partition map with {} partitions ({} writable)",
            view.len(),
            view.writable().len()
        );
        self.view.store(Arc::new(view));
        Ok(())
    }

    /// Current partition map
    pub fn view(&self) -> Arc<PartitionView> {
        self.view.load_full()
    }

    /// Partition owning `inode`
    pub fn resolve_partition(&self, inode: u64) -> Result<Partition> {
        self.view
            .load()
            .resolve(inode)
            .cloned()
            .ok_or(Error::NoPartitionForInode(inode))
    }

    pub fn partition(&self, id: u64) -> Result<Partition> {
        self.view
            .load()
            .by_id(id)
            .cloned()
            .ok_or(Error::PartitionNotFound(id))
    }

    /// Next write target in epoch order
    pub fn select_write_target(&self) -> Result<Partition> {
        let view = self.view.load();
        let candidates = candidates(&view);
        if candidates.is_empty() {
            return Err(Error::NoWritablePartition);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        Ok(candidates[(epoch % candidates.len() as u64) as usize].clone())
    }

    /// Every write target, rotated to start at the next epoch
    ///
    /// Retry `i` of a create goes to `writable[(epoch + i) % len]`, so a run
    /// of failures visits each writable partition exactly once.
    pub fn write_targets(&self) -> Result<Vec<Partition>> {
        let view = self.view.load();
        let candidates = candidates(&view);
        if candidates.is_empty() {
            return Err(Error::NoWritablePartition);
        }
        let epoch = self.epoch.fetch_add(1, Ordering::Relaxed);
        let len = candidates.len() as u64;
        Ok((0..len)
            .map(|i| candidates[((epoch + i) % len) as usize].clone())
            .collect())
    }
}

/// Writable partitions, or every partition when none is marked writable
fn candidates(view: &PartitionView) -> Vec<Partition> {
    if view.writable().is_empty() {
        view.all()
    } else {
        view.writable().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::partition::PartitionStatus;

    fn partition(id: u64, start: u64, end: u64, status: PartitionStatus) -> Partition {
        Partition {
            id,
            start,
            end,
            members: vec![format!("10.0.0.{}:17210", id)],
            leader: format!("10.0.0.{}:17210", id),
            status,
        }
    }

    #[test]
    fn test_single_partition_scenario() {
        let router = PartitionRouter::new();
        router
            .install(vec![partition(1, 1, 100, PartitionStatus::ReadWrite)])
            .unwrap();

        assert_eq!(router.resolve_partition(2).unwrap().id, 1);
        assert!(matches!(
            router.resolve_partition(101),
            Err(Error::NoPartitionForInode(101))
        ));
        assert!(matches!(router.partition(9), Err(Error::PartitionNotFound(9))));
    }

    #[test]
    fn test_write_targets_rotate_through_each_once() {
        let router = PartitionRouter::new();
        router
            .install(vec![
                partition(1, 1, 100, PartitionStatus::ReadWrite),
                partition(2, 101, 200, PartitionStatus::ReadOnly),
                partition(3, 201, 300, PartitionStatus::ReadWrite),
                partition(4, 301, 400, PartitionStatus::ReadWrite),
            ])
            .unwrap();

        let picked: Vec<_> = (0..3)
            .map(|_| router.select_write_target().unwrap().id)
            .collect();
        assert_eq!(picked, vec![1, 3, 4]);

        // epoch is now 3, so the rotation starts at offset 0 again
        let targets: Vec<_> = router.write_targets().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(targets, vec![1, 3, 4]);
        let targets: Vec<_> = router.write_targets().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(targets, vec![3, 4, 1]);
    }

    #[test]
    fn test_falls_back_to_all_partitions() {
        let router = PartitionRouter::new();
        assert!(matches!(
            router.select_write_target(),
            Err(Error::NoWritablePartition)
        ));

        router
            .install(vec![
                partition(1, 1, 100, PartitionStatus::ReadOnly),
                partition(2, 101, 200, PartitionStatus::ReadOnly),
            ])
            .unwrap();
        let targets: Vec<_> = router.write_targets().unwrap().iter().map(|p| p.id).collect();
        assert_eq!(targets, vec![1, 2]);
    }

    #[test]
    fn test_invalid_map_keeps_previous() {
        let router = PartitionRouter::new();
        router
            .install(vec![partition(1, 1, 100, PartitionStatus::ReadWrite)])
            .unwrap();

        let bad = router.install(vec![
            partition(1, 1, 100, PartitionStatus::ReadWrite),
            partition(2, 50, 150, PartitionStatus::ReadWrite),
        ]);
        assert!(matches!(bad, Err(Error::InvalidTopology(_))));
        assert_eq!(router.view().len(), 1);
        assert_eq!(router.resolve_partition(60).unwrap().id, 1);
    }

    #[test]
    fn test_readers_keep_their_view() {
        let router = PartitionRouter::new();
        router
            .install(vec![partition(1, 1, 100, PartitionStatus::ReadWrite)])
            .unwrap();
        let before = router.view();

        router
            .install(vec![partition(2, 1, 500, PartitionStatus::ReadWrite)])
            .unwrap();

        assert_eq!(before.resolve(50).map(|p| p.id), Some(1));
        assert_eq!(router.resolve_partition(50).unwrap().id, 2);
    }
}

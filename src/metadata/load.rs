//! Recovery loader
//!
//! Rebuilds a partition from its directory before replication starts:
//! configuration, then the inode stream, then the dentry stream, then the
//! applied index and cursor. A snapshot without a matching signature is
//! treated as absent.

use std::fs;
use std::io::{Cursor, Read};
use std::path::{Path, PathBuf};

use byteorder::{BigEndian, ReadBytesExt};
use serde::de::DeserializeOwned;

use super::dentry::{Dentry, DentryKey};
use super::inode::Inode;
use super::layout::{
    PartitionConfig, APPLY_FILE, DENTRY_FILE, INODE_FILE, SIGN_FILE, SNAPSHOT_BACKUP_DIR,
    SNAPSHOT_DIR, SNAPSHOT_TMP_DIR,
};
use super::store::SnapshotSign;
use crate::error::{Error, Result};
use crate::tree::IndexedTree;

/// Contents of a verified snapshot directory
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub inodes: IndexedTree<u64, Inode>,
    pub dentries: IndexedTree<DentryKey, Dentry>,
    pub applied_index: u64,
    pub cursor: u64,
}

/// Everything a partition needs to resume
#[derive(Debug, Clone)]
pub struct RecoveredState {
    pub config: PartitionConfig,
    pub inodes: IndexedTree<u64, Inode>,
    pub dentries: IndexedTree<DentryKey, Dentry>,
    pub applied_index: u64,
    pub cursor: u64,
}

impl RecoveredState {
    pub fn empty(config: PartitionConfig) -> Self {
        let cursor = config.cursor;
        Self {
            config,
            inodes: IndexedTree::new(),
            dentries: IndexedTree::new(),
            applied_index: 0,
            cursor,
        }
    }
}

fn corrupted(path: &Path, reason: impl Into<String>) -> Error {
    Error::SnapshotCorrupted {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

/// Read a length-prefixed record stream and its running CRC32
fn read_stream<T: DeserializeOwned>(path: &Path) -> Result<(Vec<T>, u32)> {
    let data = fs::read(path)?;
    let total = data.len() as u64;
    let mut reader = Cursor::new(data.as_slice());
    let mut hasher = crc32fast::Hasher::new();
    let mut records = Vec::new();

    while reader.position() < total {
        if total - reader.position() < 4 {
            return Err(corrupted(path, "truncated length prefix"));
        }
        let len = reader.read_u32::<BigEndian>()?;
        if total - reader.position() < len as u64 {
            return Err(corrupted(
                path,
                format!("record of {} bytes runs past end of file", len),
            ));
        }

        let mut payload = vec![0u8; len as usize];
        reader.read_exact(&mut payload)?;
        hasher.update(&len.to_be_bytes());
        hasher.update(&payload);

        let record = bincode::deserialize(&payload)
            .map_err(|e| corrupted(path, format!("undecodable record: {}", e)))?;
        records.push(record);
    }

    Ok((records, hasher.finalize()))
}

fn parse_apply(path: &Path) -> Result<(u64, u64)> {
    let text = fs::read_to_string(path)?;
    let (applied, cursor) = text
        .trim()
        .split_once('|')
        .ok_or_else(|| corrupted(path, "missing separator"))?;
    let applied = applied
        .parse()
        .map_err(|_| corrupted(path, "bad applied index"))?;
    let cursor = cursor.parse().map_err(|_| corrupted(path, "bad cursor"))?;
    Ok((applied, cursor))
}

/// Load and verify `snapshot_dir`; `Ok(None)` when no signed snapshot exists
pub fn load_snapshot(snapshot_dir: &Path) -> Result<Option<Snapshot>> {
    let sign_path = snapshot_dir.join(SIGN_FILE);
    if !sign_path.exists() {
        return Ok(None);
    }
    let sign_text = fs::read_to_string(&sign_path)?;
    let sign = SnapshotSign::parse(&sign_text).ok_or_else(|| corrupted(&sign_path, "malformed signature"))?;

    let inode_path = snapshot_dir.join(INODE_FILE);
    let (inodes, inode_crc) = read_stream::<Inode>(&inode_path)?;
    if inode_crc != sign.inode_crc {
        return Err(corrupted(
            &inode_path,
            format!("crc {} does not match signature {}", inode_crc, sign.inode_crc),
        ));
    }

    let dentry_path = snapshot_dir.join(DENTRY_FILE);
    let (dentries, dentry_crc) = read_stream::<Dentry>(&dentry_path)?;
    if dentry_crc != sign.dentry_crc {
        return Err(corrupted(
            &dentry_path,
            format!("crc {} does not match signature {}", dentry_crc, sign.dentry_crc),
        ));
    }

    let (applied_index, stored_cursor) = parse_apply(&snapshot_dir.join(APPLY_FILE))?;
    let max_inode = inodes.last().map(|inode: &Inode| inode.inode).unwrap_or(0);

    Ok(Some(Snapshot {
        inodes: inodes.into_iter().map(|inode| (inode.inode, inode)).collect(),
        dentries: dentries.into_iter().map(|dentry| (dentry.key(), dentry)).collect(),
        applied_index,
        cursor: stored_cursor.max(max_inode),
    }))
}

/// Put an interrupted snapshot swap back in place and drop half-written stores
fn repair_snapshot_dirs(dir: &Path) -> Result<()> {
    let current = dir.join(SNAPSHOT_DIR);
    let backup = dir.join(SNAPSHOT_BACKUP_DIR);
    if !current.exists() && backup.exists() {
        tracing::warn!("Restoring {} from backup", current.display());
        fs::rename(&backup, &current)?;
    }

    let tmp: PathBuf = dir.join(SNAPSHOT_TMP_DIR);
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    Ok(())
}

/// Recover a partition directory
pub fn recover_partition(dir: &Path) -> Result<RecoveredState> {
    repair_snapshot_dirs(dir)?;

    let config = PartitionConfig::load(dir)?;
    let mut state = RecoveredState::empty(config);

    match load_snapshot(&state.config.snapshot_dir()) {
        Ok(Some(snapshot)) => {
            state.inodes = snapshot.inodes;
            state.dentries = snapshot.dentries;
            state.applied_index = snapshot.applied_index;
            state.cursor = state.cursor.max(snapshot.cursor);
            tracing::info!(
                "Partition {} recovered {} inodes, {} dentries at index {}",
                state.config.partition_id,
                state.inodes.len(),
                state.dentries.len(),
                state.applied_index
            );
        }
        Ok(None) => {
            tracing::info!("Partition {} has no snapshot", state.config.partition_id);
        }
        Err(e) => {
            tracing::warn!(
                "Partition {} snapshot ignored: {}",
                state.config.partition_id,
                e
            );
        }
    }

    state.config.cursor = state.cursor;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::inode::{S_IFDIR, S_IFREG};
    use crate::metadata::layout::partition_dir;
    use crate::metadata::store::{store_snapshot, StoreJob};
    use tempfile::tempdir;

    fn setup(root: &Path) -> PathBuf {
        let mut config = PartitionConfig::new(1, "ltptest", 1, 1000);
        config.root_dir = partition_dir(root, 1);
        config.persist().unwrap();
        config.root_dir
    }

    fn sample_job(apply_index: u64, cursor: u64) -> StoreJob {
        let mut inodes = IndexedTree::new();
        let mut dentries = IndexedTree::new();
        inodes.insert(1, Inode::new(1, S_IFDIR | 0o755, 1_700_000_000));
        for ino in 2..=40u64 {
            let mut inode = Inode::new(ino, S_IFREG | 0o644, 1_700_000_000);
            inode.size = ino * 4096;
            inode.parent = 1;
            inodes.insert(ino, inode);
            let dentry = Dentry::new(1, format!("file-{}", ino), ino, S_IFREG);
            dentries.insert(dentry.key(), dentry);
        }
        StoreJob {
            apply_index,
            cursor,
            inodes,
            dentries,
        }
    }

    #[test]
    fn test_store_then_load_round_trip() {
        let root = tempdir().unwrap();
        let dir = setup(root.path());
        let job = sample_job(57, 40);
        store_snapshot(&dir, &job).unwrap();

        let recovered = recover_partition(&dir).unwrap();
        assert_eq!(recovered.inodes, job.inodes);
        assert_eq!(recovered.dentries, job.dentries);
        assert_eq!(recovered.applied_index, 57);
        assert_eq!(recovered.cursor, 40);
        assert_eq!(recovered.config.cursor, 40);
    }

    #[test]
    fn test_any_flipped_byte_is_detected() {
        let root = tempdir().unwrap();
        let dir = setup(root.path());
        store_snapshot(&dir, &sample_job(10, 40)).unwrap();

        for name in [INODE_FILE, DENTRY_FILE] {
            let path = dir.join(SNAPSHOT_DIR).join(name);
            let original = fs::read(&path).unwrap();
            for offset in [0, 3, 4, original.len() / 2, original.len() - 1] {
                let mut flipped = original.clone();
                flipped[offset] ^= 0x01;
                fs::write(&path, &flipped).unwrap();

                assert!(
                    matches!(
                        load_snapshot(&dir.join(SNAPSHOT_DIR)),
                        Err(Error::SnapshotCorrupted { .. })
                    ),
                    "flip at {} in {} not detected",
                    offset,
                    name
                );
                let recovered = recover_partition(&dir).unwrap();
                assert!(recovered.inodes.is_empty());
                assert_eq!(recovered.applied_index, 0);
            }
            fs::write(&path, &original).unwrap();
        }

        assert!(load_snapshot(&dir.join(SNAPSHOT_DIR)).unwrap().is_some());
    }

    #[test]
    fn test_missing_signature_means_no_snapshot() {
        let root = tempdir().unwrap();
        let dir = setup(root.path());
        store_snapshot(&dir, &sample_job(10, 40)).unwrap();
        fs::remove_file(dir.join(SNAPSHOT_DIR).join(SIGN_FILE)).unwrap();

        assert!(load_snapshot(&dir.join(SNAPSHOT_DIR)).unwrap().is_none());
        let recovered = recover_partition(&dir).unwrap();
        assert!(recovered.inodes.is_empty());
        assert_eq!(recovered.cursor, 0);
    }

    #[test]
    fn test_cursor_never_regresses() {
        let root = tempdir().unwrap();
        let dir = setup(root.path());
        store_snapshot(&dir, &sample_job(10, 40)).unwrap();

        let mut config = PartitionConfig::load(&dir).unwrap();
        config.cursor = 500;
        config.persist().unwrap();

        let recovered = recover_partition(&dir).unwrap();
        assert_eq!(recovered.cursor, 500);

        // a stored cursor below the highest stored inode is raised to it
        store_snapshot(&dir, &sample_job(11, 3)).unwrap();
        let snapshot = load_snapshot(&dir.join(SNAPSHOT_DIR)).unwrap().unwrap();
        assert_eq!(snapshot.cursor, 40);
    }

    #[test]
    fn test_backup_is_restored() {
        let root = tempdir().unwrap();
        let dir = setup(root.path());
        store_snapshot(&dir, &sample_job(12, 40)).unwrap();
        fs::rename(dir.join(SNAPSHOT_DIR), dir.join(SNAPSHOT_BACKUP_DIR)).unwrap();
        fs::create_dir_all(dir.join(SNAPSHOT_TMP_DIR)).unwrap();

        let recovered = recover_partition(&dir).unwrap();
        assert_eq!(recovered.applied_index, 12);
        assert!(!dir.join(SNAPSHOT_TMP_DIR).exists());
    }
}

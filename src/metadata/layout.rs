//! On-disk layout of a partition directory
//!
//! ```text
//! {meta_dir}/partition_{id}/
//!     meta                  partition configuration (JSON)
//!     snapshot/inode        inode stream
//!     snapshot/dentry       dentry stream
//!     snapshot/apply        "{applied_index}|{cursor}"
//!     snapshot/sign         "{inode_crc} {dentry_crc}", written last
//!     .snapshot/            store in progress
//!     .snapshot_backup/     previous snapshot while swapping
//! ```

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const PARTITION_PREFIX: &str = "partition_";
pub const META_FILE: &str = "meta";
pub const META_TMP_FILE: &str = ".meta";
pub const SNAPSHOT_DIR: &str = "snapshot";
pub const SNAPSHOT_TMP_DIR: &str = ".snapshot";
pub const SNAPSHOT_BACKUP_DIR: &str = ".snapshot_backup";
pub const INODE_FILE: &str = "inode";
pub const DENTRY_FILE: &str = "dentry";
pub const APPLY_FILE: &str = "apply";
pub const SIGN_FILE: &str = "sign";

/// Directory of partition `id` under `root`
pub fn partition_dir(root: &Path, id: u64) -> PathBuf {
    root.join(format!("{}{}", PARTITION_PREFIX, id))
}

/// Parse a `partition_{id}` directory name
pub fn parse_partition_dir(name: &str) -> Option<u64> {
    name.strip_prefix(PARTITION_PREFIX)?.parse().ok()
}

/// Persisted configuration of one partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub partition_id: u64,
    pub volume: String,
    pub start: u64,
    pub end: u64,
    #[serde(default)]
    pub peers: Vec<String>,
    /// Highest inode id allocated in `[start, end]`
    #[serde(default)]
    pub cursor: u64,
    #[serde(default)]
    pub node_id: String,
    #[serde(skip)]
    pub root_dir: PathBuf,
}

impl PartitionConfig {
    pub fn new(partition_id: u64, volume: impl Into<String>, start: u64, end: u64) -> Self {
        Self {
            partition_id,
            volume: volume.into(),
            start,
            end,
            peers: Vec::new(),
            cursor: start.saturating_sub(1),
            node_id: String::new(),
            root_dir: PathBuf::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.start == 0 {
            return Err(Error::Config("partition range must start above 0".into()));
        }
        if self.start > self.end {
            return Err(Error::Config(format!(
                "partition {} has empty range [{}, {}]",
                self.partition_id, self.start, self.end
            )));
        }
        Ok(())
    }

    /// Load `meta` from a partition directory
    pub fn load(dir: &Path) -> Result<Self> {
        let content = fs::read(dir.join(META_FILE))?;
        let mut config: PartitionConfig = serde_json::from_slice(&content)?;
        config.root_dir = dir.to_path_buf();
        config.cursor = config.cursor.max(config.start.saturating_sub(1));
        config.validate()?;
        Ok(config)
    }

    /// Write `meta` through a temporary file and rename it into place
    pub fn persist(&self) -> Result<()> {
        fs::create_dir_all(&self.root_dir)?;
        let tmp = self.root_dir.join(META_TMP_FILE);
        {
            let mut file = fs::File::create(&tmp)?;
            file.write_all(&serde_json::to_vec(self)?)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, self.root_dir.join(META_FILE))?;
        Ok(())
    }

    pub fn snapshot_dir(&self) -> PathBuf {
        self.root_dir.join(SNAPSHOT_DIR)
    }

    /// Check if an inode id belongs to this partition
    pub fn contains(&self, inode: u64) -> bool {
        self.start <= inode && inode <= self.end
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_partition_dir_names() {
        let root = Path::new("/var/lib/wolfmeta");
        assert_eq!(partition_dir(root, 12), root.join("partition_12"));
        assert_eq!(parse_partition_dir("partition_12"), Some(12));
        assert_eq!(parse_partition_dir("partition_x"), None);
        assert_eq!(parse_partition_dir(".snapshot"), None);
    }

    #[test]
    fn test_config_persist_and_load() {
        let dir = tempdir().unwrap();
        let mut config = PartitionConfig::new(3, "ltptest", 1, 100);
        config.root_dir = partition_dir(dir.path(), 3);
        config.peers = vec!["10.0.0.1:17210".into()];
        assert_eq!(config.cursor, 0);
        config.persist().unwrap();

        let loaded = PartitionConfig::load(&config.root_dir).unwrap();
        assert_eq!(loaded, config);
        assert!(!config.root_dir.join(META_TMP_FILE).exists());
    }

    #[test]
    fn test_config_rejects_empty_range() {
        assert!(PartitionConfig::new(1, "v", 10, 5).validate().is_err());
        assert!(PartitionConfig::new(1, "v", 0, 5).validate().is_err());
    }
}

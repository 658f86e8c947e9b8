//! Directory entries

use serde::{Deserialize, Serialize};

use super::inode::S_IFMT;

/// Dentry tree key: parent inode, then name
pub type DentryKey = (u64, String);

/// Maps `(parent, name)` to a child inode
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dentry {
    pub parent: u64,
    pub name: String,
    pub inode: u64,
    /// File type bits of the child
    pub mode: u32,
}

impl Dentry {
    pub fn new(parent: u64, name: impl Into<String>, inode: u64, mode: u32) -> Self {
        Self {
            parent,
            name: name.into(),
            inode,
            mode: mode & S_IFMT,
        }
    }

    pub fn key(&self) -> DentryKey {
        (self.parent, self.name.clone())
    }

    /// Range covering every child of `parent`
    pub fn children_range(parent: u64) -> std::ops::Range<DentryKey> {
        (parent, String::new())..(parent.saturating_add(1), String::new())
    }
}

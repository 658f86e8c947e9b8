//! Inode records

use serde::{Deserialize, Serialize};

use crate::proto::{
    SetAttrRequest, ATTR_ACCESS_TIME, ATTR_GID, ATTR_MODE, ATTR_MODIFY_TIME, ATTR_UID,
};

/// File type bits of `mode`
pub const S_IFMT: u32 = 0o170000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFLNK: u32 = 0o120000;

/// Set once the last link is gone; the record stays until evicted
pub const DELETE_MARK_FLAG: u32 = 1;

/// One inode of the partition's inode tree
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inode {
    pub inode: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub size: u64,
    pub generation: u64,
    pub create_time: i64,
    pub access_time: i64,
    pub modify_time: i64,
    pub link_target: Option<Vec<u8>>,
    pub nlink: u32,
    pub flag: u32,
    pub parent: u64,
}

impl Inode {
    /// Create a fresh inode; `now` is unix seconds chosen by the proposer
    pub fn new(inode: u64, mode: u32, now: i64) -> Self {
        let nlink = if mode & S_IFMT == S_IFDIR { 2 } else { 1 };
        Self {
            inode,
            mode,
            uid: 0,
            gid: 0,
            size: 0,
            generation: 1,
            create_time: now,
            access_time: now,
            modify_time: now,
            link_target: None,
            nlink,
            flag: 0,
            parent: 0,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.mode & S_IFMT == S_IFDIR
    }

    pub fn is_symlink(&self) -> bool {
        self.mode & S_IFMT == S_IFLNK
    }

    pub fn is_marked_delete(&self) -> bool {
        self.flag & DELETE_MARK_FLAG != 0
    }

    /// Drop one link. Directories cannot be hard linked, so they lose all of them.
    pub fn unlink(&mut self) {
        if self.is_dir() {
            self.nlink = 0;
        } else {
            self.nlink = self.nlink.saturating_sub(1);
        }
        if self.nlink == 0 {
            self.flag |= DELETE_MARK_FLAG;
        }
        self.generation += 1;
    }

    pub fn link(&mut self) {
        self.nlink += 1;
        self.generation += 1;
    }

    /// Whether an evict may physically remove the record
    pub fn can_evict(&self) -> bool {
        if self.is_dir() {
            self.nlink < 2
        } else {
            self.nlink == 0
        }
    }

    /// Apply the fields selected by `req.valid`
    pub fn set_attr(&mut self, req: &SetAttrRequest) {
        if req.valid & ATTR_MODE != 0 {
            self.mode = (self.mode & S_IFMT) | (req.mode & !S_IFMT);
        }
        if req.valid & ATTR_UID != 0 {
            self.uid = req.uid;
        }
        if req.valid & ATTR_GID != 0 {
            self.gid = req.gid;
        }
        if req.valid & ATTR_ACCESS_TIME != 0 {
            self.access_time = req.access_time;
        }
        if req.valid & ATTR_MODIFY_TIME != 0 {
            self.modify_time = req.modify_time;
        }
        self.generation += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_link_counts() {
        assert_eq!(Inode::new(1, S_IFDIR | 0o755, 0).nlink, 2);
        assert_eq!(Inode::new(2, S_IFREG | 0o644, 0).nlink, 1);
        assert_eq!(Inode::new(2, S_IFREG | 0o644, 0).generation, 1);
    }

    #[test]
    fn test_unlink_marks_delete() {
        let mut file = Inode::new(5, S_IFREG | 0o644, 0);
        file.link();
        file.unlink();
        assert_eq!(file.nlink, 1);
        assert!(!file.is_marked_delete());
        assert!(!file.can_evict());

        file.unlink();
        assert!(file.is_marked_delete());
        assert!(file.can_evict());

        let mut dir = Inode::new(6, S_IFDIR | 0o755, 0);
        assert!(!dir.can_evict());
        dir.unlink();
        assert_eq!(dir.nlink, 0);
        assert!(dir.can_evict());
    }

    #[test]
    fn test_set_attr_keeps_file_type() {
        let mut inode = Inode::new(9, S_IFREG | 0o644, 100);
        inode.set_attr(&SetAttrRequest {
            inode: 9,
            valid: ATTR_MODE | ATTR_UID | ATTR_MODIFY_TIME,
            mode: S_IFDIR | 0o600,
            uid: 1000,
            modify_time: 200,
            ..Default::default()
        });

        assert_eq!(inode.mode, S_IFREG | 0o600);
        assert_eq!(inode.uid, 1000);
        assert_eq!(inode.gid, 0);
        assert_eq!(inode.modify_time, 200);
        assert_eq!(inode.access_time, 100);
    }
}

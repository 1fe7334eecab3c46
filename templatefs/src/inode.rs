//! Inode allocation for the kernel-facing layer.
//!
//! The overlay itself is path-addressed, but the kernel speaks inodes.
//! This table hands out stable inode numbers for virtual paths and maps
//! them back. Lock-free maps keep it safe for concurrent callbacks.

use dashmap::DashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

/// The kernel's root inode.
pub const ROOT_INODE: u64 = 1;

/// Bidirectional inode ⇄ virtual-path map.
#[derive(Debug)]
pub struct InodeTable {
    inode_to_path: DashMap<u64, PathBuf>,
    path_to_inode: DashMap<PathBuf, u64>,
    next_inode: AtomicU64,
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

impl InodeTable {
    /// Create a table with the virtual root `/` at inode 1.
    pub fn new() -> Self {
        let inode_to_path = DashMap::new();
        let path_to_inode = DashMap::new();
        inode_to_path.insert(ROOT_INODE, PathBuf::from("/"));
        path_to_inode.insert(PathBuf::from("/"), ROOT_INODE);
        Self {
            inode_to_path,
            path_to_inode,
            next_inode: AtomicU64::new(ROOT_INODE + 1),
        }
    }

    /// Inode for a virtual path, allocating one on first sight.
    pub fn get_or_create(&self, path: &Path) -> u64 {
        if let Some(ino) = self.path_to_inode.get(path) {
            return *ino;
        }
        let ino = self.next_inode.fetch_add(1, Ordering::Relaxed);
        self.path_to_inode.insert(path.to_path_buf(), ino);
        self.inode_to_path.insert(ino, path.to_path_buf());
        ino
    }

    /// The virtual path behind an inode.
    pub fn path(&self, ino: u64) -> Option<PathBuf> {
        self.inode_to_path.get(&ino).map(|r| r.value().clone())
    }

    /// Forget a path after unlink/rmdir so a later entry of the same name
    /// gets a fresh inode.
    pub fn remove(&self, path: &Path) {
        if let Some((_, ino)) = self.path_to_inode.remove(path) {
            self.inode_to_path.remove(&ino);
        }
    }

    /// Move a mapping after a rename, keeping the inode stable.
    pub fn rename(&self, from: &Path, to: &Path) {
        if let Some((_, ino)) = self.path_to_inode.remove(from) {
            self.remove(to);
            self.path_to_inode.insert(to.to_path_buf(), ino);
            self.inode_to_path.insert(ino, to.to_path_buf());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_is_preassigned() {
        let table = InodeTable::new();
        assert_eq!(table.path(ROOT_INODE), Some(PathBuf::from("/")));
        assert_eq!(table.get_or_create(Path::new("/")), ROOT_INODE);
    }

    #[test]
    fn same_path_keeps_its_inode() {
        let table = InodeTable::new();
        let a = table.get_or_create(Path::new("/x"));
        let b = table.get_or_create(Path::new("/x"));
        assert_eq!(a, b);
    }

    #[test]
    fn distinct_paths_get_distinct_inodes() {
        let table = InodeTable::new();
        assert_ne!(
            table.get_or_create(Path::new("/x")),
            table.get_or_create(Path::new("/y"))
        );
    }

    #[test]
    fn remove_releases_the_mapping() {
        let table = InodeTable::new();
        let a = table.get_or_create(Path::new("/x"));
        table.remove(Path::new("/x"));
        assert_eq!(table.path(a), None);
        assert_ne!(table.get_or_create(Path::new("/x")), a);
    }

    #[test]
    fn rename_moves_the_inode() {
        let table = InodeTable::new();
        let ino = table.get_or_create(Path::new("/old"));
        table.rename(Path::new("/old"), Path::new("/new"));
        assert_eq!(table.path(ino), Some(PathBuf::from("/new")));
        assert_eq!(table.get_or_create(Path::new("/new")), ino);
    }
}

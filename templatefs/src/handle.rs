//! Per-open state behind the opaque tokens handed to the kernel.
//!
//! Every `open`/`opendir`/`create` allocates a [`Handle`] and stores it
//! under a token the kernel carries in its per-open structure; the
//! matching `release`/`releasedir` is the only thing that frees it. Typed
//! access enforces the variant tag set at creation: asking for a file
//! handle through a directory token (or a stale token) yields nothing,
//! which callers surface as `ENFILE`/`ENOTDIR`.

use dashmap::DashMap;
use std::ffi::OsString;
use std::fs::{File, FileType};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

/// State of one open file.
#[derive(Debug)]
pub struct FileHandle {
    /// The virtual path the kernel presented at open.
    pub path: PathBuf,
    /// The open descriptor: the template file when `is_template`, the
    /// lower-tree file otherwise.
    pub file: File,
    pub is_template: bool,
    pub is_executable: bool,
    /// Synthesized bytes, present iff this is a template and rendering
    /// succeeded. Freed with the handle on release.
    pub contents: Option<Vec<u8>>,
}

impl FileHandle {
    /// Length of the cached contents, if any.
    pub fn cached_len(&self) -> Option<u64> {
        self.contents.as_ref().map(|c| c.len() as u64)
    }
}

/// One entry of a directory snapshot.
#[derive(Debug, Clone)]
pub struct DirEntry {
    pub name: OsString,
    pub ino: u64,
    pub file_type: Option<FileType>,
}

/// State of one open directory: the entry snapshot taken at opendir plus
/// the stream cursor.
#[derive(Debug)]
pub struct DirHandle {
    pub entries: Vec<DirEntry>,
    /// Offset of the next entry to serve; repositioned when the kernel's
    /// offset diverges.
    pub offset: i64,
}

/// A tagged per-open handle.
#[derive(Debug)]
pub enum Handle {
    File(FileHandle),
    Dir(DirHandle),
}

/// Token-indexed storage for all live handles.
#[derive(Debug)]
pub struct HandleTable {
    handles: DashMap<u64, Handle>,
    next_token: AtomicU64,
}

impl Default for HandleTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandleTable {
    pub fn new() -> Self {
        Self {
            handles: DashMap::new(),
            // Token 0 is reserved so an unset kernel fh never matches.
            next_token: AtomicU64::new(1),
        }
    }

    /// Store a handle and return its token.
    pub fn insert(&self, handle: Handle) -> u64 {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        self.handles.insert(token, handle);
        token
    }

    /// Run `f` against the file handle for `token`. Returns `None` when
    /// the token is unset or names a directory handle.
    pub fn with_file<R>(&self, token: u64, f: impl FnOnce(&mut FileHandle) -> R) -> Option<R> {
        let mut entry = self.handles.get_mut(&token)?;
        match entry.value_mut() {
            Handle::File(file) => Some(f(file)),
            Handle::Dir(_) => None,
        }
    }

    /// Run `f` against the directory handle for `token`. Returns `None`
    /// when the token is unset or names a file handle.
    pub fn with_dir<R>(&self, token: u64, f: impl FnOnce(&mut DirHandle) -> R) -> Option<R> {
        let mut entry = self.handles.get_mut(&token)?;
        match entry.value_mut() {
            Handle::Dir(dir) => Some(f(dir)),
            Handle::File(_) => None,
        }
    }

    /// Drop the handle for `token`, closing its descriptor and freeing any
    /// cached contents.
    pub fn release(&self, token: u64) -> Option<Handle> {
        self.handles.remove(&token).map(|(_, handle)| handle)
    }

    /// Number of live handles; used by leak checks in tests.
    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn file_handle(dir: &std::path::Path) -> FileHandle {
        let path = dir.join("f");
        std::fs::write(&path, b"x").unwrap();
        FileHandle {
            path: PathBuf::from("/f"),
            file: File::open(&path).unwrap(),
            is_template: false,
            is_executable: false,
            contents: None,
        }
    }

    #[test]
    fn tokens_are_unique_and_nonzero() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();
        let a = table.insert(Handle::File(file_handle(dir.path())));
        let b = table.insert(Handle::File(file_handle(dir.path())));
        assert_ne!(a, 0);
        assert_ne!(a, b);
    }

    #[test]
    fn typed_access_enforces_the_variant_tag() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();
        let file_token = table.insert(Handle::File(file_handle(dir.path())));
        let dir_token = table.insert(Handle::Dir(DirHandle {
            entries: Vec::new(),
            offset: 0,
        }));

        assert!(table.with_file(file_token, |_| ()).is_some());
        assert!(table.with_dir(file_token, |_| ()).is_none());
        assert!(table.with_dir(dir_token, |_| ()).is_some());
        assert!(table.with_file(dir_token, |_| ()).is_none());
    }

    #[test]
    fn unset_tokens_match_nothing() {
        let table = HandleTable::new();
        assert!(table.with_file(0, |_| ()).is_none());
        assert!(table.with_file(42, |_| ()).is_none());
    }

    #[test]
    fn release_frees_exactly_once() {
        let dir = tempdir().unwrap();
        let table = HandleTable::new();
        let token = table.insert(Handle::File(file_handle(dir.path())));

        assert!(table.release(token).is_some());
        assert!(table.release(token).is_none());
        assert!(table.is_empty());
    }

    #[test]
    fn cached_len_reflects_contents() {
        let dir = tempdir().unwrap();
        let mut handle = file_handle(dir.path());
        assert_eq!(handle.cached_len(), None);
        handle.contents = Some(b"rendered".to_vec());
        assert_eq!(handle.cached_len(), Some(8));
    }
}

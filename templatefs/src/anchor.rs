//! Tree anchors: the two directory roots every operation resolves against.
//!
//! An anchor pairs the canonical absolute path of a tree root with an open
//! directory descriptor. The descriptor is the base of all `*at` system
//! calls, so path resolution stays rooted in the intended tree even if the
//! directory is renamed or shadowed after mount. Two anchors exist per
//! mount: the lower tree (at the mountpoint) and the template tree. Both
//! are created once at startup and never mutated afterwards.

use std::os::fd::{BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::sys;

/// Errors raised while resolving a tree root at startup.
///
/// Either variant is fatal: the overlay cannot operate without both roots.
#[derive(Debug, Error)]
pub enum AnchorError {
    /// The supplied path does not exist or cannot be canonicalized.
    #[error("path \"{path}\" is invalid: {source}")]
    InvalidPath {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The resolved directory could not be opened for use as a descriptor.
    #[error("cannot open directory \"{path}\": {errno}")]
    OpenFailed { path: PathBuf, errno: sys::Errno },
}

/// A resolved tree root: canonical path plus an open directory descriptor.
#[derive(Debug)]
pub struct TreeAnchor {
    path: PathBuf,
    dir: OwnedFd,
}

impl TreeAnchor {
    /// Resolve `path` to its canonical form and open it as an anchor.
    pub fn new(path: &Path) -> Result<Self, AnchorError> {
        let canonical = path.canonicalize().map_err(|source| AnchorError::InvalidPath {
            path: path.to_path_buf(),
            source,
        })?;
        let dir = sys::open_dir(&canonical).map_err(|errno| AnchorError::OpenFailed {
            path: canonical.clone(),
            errno,
        })?;
        tracing::info!(path = %canonical.display(), "tree anchor ready");
        Ok(Self {
            path: canonical,
            dir,
        })
    }

    /// Canonical absolute path of the tree root.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The open directory descriptor, borrowed for a `*at` call.
    pub fn dir(&self) -> BorrowedFd<'_> {
        use std::os::fd::AsFd;
        self.dir.as_fd()
    }

    /// Join a virtual path onto this anchor's root, producing the real
    /// absolute path of the entry inside this tree.
    pub fn full_path(&self, virt: &Path) -> PathBuf {
        self.path.join(rel(virt))
    }
}

/// Strip the leading slash the kernel puts on every virtual path.
///
/// The root path `/` becomes the empty path, which the `*at` wrappers
/// treat as the anchor directory itself via `AT_EMPTY_PATH`.
pub fn rel(virt: &Path) -> &Path {
    virt.strip_prefix("/").unwrap_or(virt)
}

//! The overlay core: every POSIX-shaped operation, kernel-free.
//!
//! [`Overlay`] owns the two tree anchors, the handle table, and the
//! per-mount configuration needed by rendering. Each method mirrors one
//! kernel callback and returns `Result<_, Errno>`; the FUSE glue in
//! [`crate::fs`] only translates between kernel types and these calls,
//! which keeps the whole operation surface testable without a mount.
//!
//! The template decision is made here: on `open` (and path-addressed
//! `getattr`) the template tree is probed, and a hit routes the open to
//! the render engine or the executable-template driver, caching the
//! synthesized bytes on the handle. Everything else passes through to the
//! lower tree, rooted at the mount anchor's descriptor.

use std::ffi::{OsStr, OsString};
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::os::unix::fs::{DirEntryExt, FileExt, MetadataExt};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::anchor::{rel, AnchorError, TreeAnchor};
use crate::exec;
use crate::handle::{DirEntry, DirHandle, FileHandle, Handle, HandleTable};
use crate::render;
use crate::sys::{self, Errno, SysResult};

/// Rename flags the lower tree honors; anything else is rejected rather
/// than silently dropped.
const SUPPORTED_RENAME_FLAGS: u32 = libc::RENAME_NOREPLACE | libc::RENAME_EXCHANGE;

/// Answer to a `getxattr`/`listxattr` size probe or data request.
pub enum XattrReply {
    Size(usize),
    Data(Vec<u8>),
}

/// The overlay filesystem core.
pub struct Overlay {
    mount: TreeAnchor,
    templates: TreeAnchor,
    store_path: PathBuf,
    handles: HandleTable,
    /// Environment snapshot taken at startup, inherited by executable
    /// templates.
    env: Vec<(OsString, OsString)>,
}

impl Overlay {
    /// Resolve both tree anchors and capture the process environment.
    pub fn new(
        mountpoint: &Path,
        template_root: &Path,
        store_path: &Path,
    ) -> Result<Self, AnchorError> {
        Ok(Self {
            mount: TreeAnchor::new(mountpoint)?,
            templates: TreeAnchor::new(template_root)?,
            store_path: store_path.to_path_buf(),
            handles: HandleTable::new(),
            env: std::env::vars_os().collect(),
        })
    }

    /// Number of live handles; the leak check used by tests.
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// Does the virtual path have an entry in the template tree?
    pub fn has_template(&self, virt: &Path) -> bool {
        sys::faccessat(
            self.templates.dir(),
            rel(virt),
            libc::R_OK,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    }

    fn is_executable_template(&self, virt: &Path) -> bool {
        sys::faccessat(
            self.templates.dir(),
            rel(virt),
            libc::X_OK,
            libc::AT_SYMLINK_NOFOLLOW,
        )
    }

    fn with_file<R>(
        &self,
        token: u64,
        f: impl FnOnce(&mut FileHandle) -> SysResult<R>,
    ) -> SysResult<R> {
        self.handles
            .with_file(token, f)
            .ok_or(Errno(libc::ENFILE))?
    }

    fn with_dir<R>(
        &self,
        token: u64,
        f: impl FnOnce(&mut DirHandle) -> SysResult<R>,
    ) -> SysResult<R> {
        self.handles
            .with_dir(token, f)
            .ok_or(Errno(libc::ENOTDIR))?
    }

    /// The handle's raw descriptor plus its template flag, without holding
    /// the table entry (two handles may be involved in one operation).
    fn file_fd(&self, token: u64) -> SysResult<(RawFd, bool)> {
        self.with_file(token, |fh| Ok((fh.file.as_raw_fd(), fh.is_template)))
    }

    // -----------------------------------------------------------------
    // Attributes
    // -----------------------------------------------------------------

    /// Clear write bits, and execute bits for non-directories. Template
    /// entries are presented read-only.
    fn mask_template_mode(st: &mut libc::stat) {
        let mut mask = libc::S_IWUSR | libc::S_IWGRP | libc::S_IWOTH;
        if st.st_mode & libc::S_IFMT != libc::S_IFDIR {
            mask |= libc::S_IXUSR | libc::S_IXGRP | libc::S_IXOTH;
        }
        st.st_mode &= !mask;
    }

    /// Path-addressed `getattr`: template entries are stat'ed from the
    /// template tree with their mode masked, everything else from the
    /// lower tree.
    pub fn getattr_path(&self, virt: &Path) -> SysResult<libc::stat> {
        if self.has_template(virt) {
            let mut st = sys::fstatat(
                self.templates.dir(),
                rel(virt),
                libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
            )?;
            Self::mask_template_mode(&mut st);
            Ok(st)
        } else {
            sys::fstatat(
                self.mount.dir(),
                rel(virt),
                libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
            )
        }
    }

    /// Handle-addressed `getattr`: fstat the open descriptor; a template
    /// handle reports the cached contents' length as its size.
    pub fn getattr_handle(&self, token: u64) -> SysResult<libc::stat> {
        self.with_file(token, |fh| {
            let mut st = sys::fstat(fh.file.as_raw_fd())?;
            if fh.is_template {
                Self::mask_template_mode(&mut st);
                if let Some(len) = fh.cached_len() {
                    st.st_size = len as libc::off_t;
                }
            }
            Ok(st)
        })
    }

    // -----------------------------------------------------------------
    // Open / create / read / write
    // -----------------------------------------------------------------

    /// Open a virtual path. A template hit opens the template file and
    /// synthesizes its contents before returning, so a successful open
    /// always has a fully populated cache.
    pub fn open(&self, virt: &Path, flags: i32) -> SysResult<u64> {
        let is_template = self.has_template(virt);

        if !is_template {
            debug!(path = %virt.display(), "opening pass-through file");
            let file = sys::openat(self.mount.dir(), rel(virt), flags, None)?;
            return Ok(self.handles.insert(Handle::File(FileHandle {
                path: virt.to_path_buf(),
                file,
                is_template: false,
                is_executable: false,
                contents: None,
            })));
        }

        debug!(path = %virt.display(), "opening template");
        let is_executable = self.is_executable_template(virt);
        let file = sys::openat(self.templates.dir(), rel(virt), libc::O_RDONLY, None)?;

        let contents = if is_executable {
            exec::execute_template(
                &self.templates.full_path(virt),
                &self.mount.full_path(virt),
                &self.env,
            )
            .map_err(|err| {
                warn!(path = %virt.display(), error = %err, "executable template failed");
                err.errno()
            })?
        } else {
            render::process_template(&file, &self.store_path).map_err(|err| {
                warn!(path = %virt.display(), error = %err, "template render failed");
                err.errno()
            })?
        };

        Ok(self.handles.insert(Handle::File(FileHandle {
            path: virt.to_path_buf(),
            file,
            is_template: true,
            is_executable,
            contents: Some(contents),
        })))
    }

    /// Create and open a regular file in the lower tree. Files are never
    /// created in the template hierarchy.
    pub fn create(&self, virt: &Path, flags: i32, mode: u32) -> SysResult<u64> {
        let file = sys::openat(self.mount.dir(), rel(virt), flags, Some(mode))?;
        Ok(self.handles.insert(Handle::File(FileHandle {
            path: virt.to_path_buf(),
            file,
            is_template: false,
            is_executable: false,
            contents: None,
        })))
    }

    /// Read through a handle. Template reads serve the cache; an offset at
    /// or past the cached length is end-of-file.
    pub fn read(&self, token: u64, offset: i64, size: u32) -> SysResult<Vec<u8>> {
        self.with_file(token, |fh| {
            if fh.is_template {
                let contents = fh.contents.as_deref().unwrap_or(&[]);
                let offset = offset.max(0) as usize;
                if offset >= contents.len() {
                    return Ok(Vec::new());
                }
                let end = contents.len().min(offset + size as usize);
                return Ok(contents[offset..end].to_vec());
            }

            let mut buf = vec![0u8; size as usize];
            let n = fh
                .file
                .read_at(&mut buf, offset.max(0) as u64)
                .map_err(Errno::from)?;
            buf.truncate(n);
            Ok(buf)
        })
    }

    /// Write through a handle. Templates are read-only.
    pub fn write(&self, token: u64, offset: i64, data: &[u8]) -> SysResult<u32> {
        self.with_file(token, |fh| {
            if fh.is_template {
                return Err(Errno(libc::EPERM));
            }
            let n = fh
                .file
                .write_at(data, offset.max(0) as u64)
                .map_err(Errno::from)?;
            Ok(n as u32)
        })
    }

    pub fn truncate_handle(&self, token: u64, size: i64) -> SysResult<()> {
        self.with_file(token, |fh| {
            if fh.is_template {
                return Err(Errno(libc::EPERM));
            }
            sys::ftruncate(fh.file.as_raw_fd(), size)
        })
    }

    pub fn truncate_path(&self, virt: &Path, size: i64) -> SysResult<()> {
        if self.has_template(virt) {
            return Err(Errno(libc::EPERM));
        }
        let file = sys::openat(self.mount.dir(), rel(virt), libc::O_WRONLY, None)?;
        sys::ftruncate(file.as_raw_fd(), size)
    }

    /// The dup-and-close trick: surface close-time errors without closing
    /// the handle's descriptor. Nothing to do for templates.
    pub fn flush(&self, token: u64) -> SysResult<()> {
        self.with_file(token, |fh| {
            if fh.is_template {
                return Ok(());
            }
            sys::flush_dup(fh.file.as_raw_fd())
        })
    }

    pub fn fsync(&self, token: u64, datasync: bool) -> SysResult<()> {
        self.with_file(token, |fh| sys::fsync(fh.file.as_raw_fd(), datasync))
    }

    /// Templates are not seekable through the handle.
    pub fn lseek(&self, token: u64, offset: i64, whence: i32) -> SysResult<i64> {
        self.with_file(token, |fh| {
            if fh.is_template {
                return Err(Errno(libc::ENFILE));
            }
            sys::lseek(fh.file.as_raw_fd(), offset, whence)
        })
    }

    pub fn fallocate(&self, token: u64, mode: i32, offset: i64, length: i64) -> SysResult<()> {
        if mode != 0 {
            return Err(Errno(libc::EOPNOTSUPP));
        }
        self.with_file(token, |fh| sys::fallocate(fh.file.as_raw_fd(), offset, length))
    }

    pub fn copy_file_range(
        &self,
        token_in: u64,
        offset_in: i64,
        token_out: u64,
        offset_out: i64,
        len: usize,
        flags: u32,
    ) -> SysResult<usize> {
        let (fd_in, _) = self.file_fd(token_in)?;
        let (fd_out, out_is_template) = self.file_fd(token_out)?;
        if out_is_template {
            return Err(Errno(libc::EPERM));
        }
        sys::copy_file_range(fd_in, offset_in, fd_out, offset_out, len, flags)
    }

    pub fn flock(&self, token: u64, op: i32) -> SysResult<()> {
        self.with_file(token, |fh| sys::flock(fh.file.as_raw_fd(), op))
    }

    pub fn getlk(&self, token: u64, lock: &mut libc::flock) -> SysResult<()> {
        self.with_file(token, |fh| sys::fcntl_getlk(fh.file.as_raw_fd(), lock))
    }

    pub fn setlk(&self, token: u64, wait: bool, lock: &libc::flock) -> SysResult<()> {
        self.with_file(token, |fh| sys::fcntl_setlk(fh.file.as_raw_fd(), wait, lock))
    }

    /// Release an open file: close the descriptor and discard any cached
    /// contents. Exactly one release per successful open.
    pub fn release(&self, token: u64) -> SysResult<()> {
        self.with_file(token, |_| Ok(()))?;
        self.handles.release(token);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Metadata mutation (handle- or path-addressed)
    // -----------------------------------------------------------------

    pub fn chmod(&self, virt: &Path, token: Option<u64>, mode: u32) -> SysResult<()> {
        match token {
            Some(token) => self.with_file(token, |fh| sys::fchmod(fh.file.as_raw_fd(), mode)),
            None => sys::fchmodat(self.mount.dir(), rel(virt), mode),
        }
    }

    pub fn chown(&self, virt: &Path, token: Option<u64>, uid: u32, gid: u32) -> SysResult<()> {
        match token {
            Some(token) => self.with_file(token, |fh| sys::fchown(fh.file.as_raw_fd(), uid, gid)),
            None => sys::fchownat(self.mount.dir(), rel(virt), uid, gid),
        }
    }

    pub fn utimens(
        &self,
        virt: &Path,
        token: Option<u64>,
        times: &[libc::timespec; 2],
    ) -> SysResult<()> {
        match token {
            Some(token) => self.with_file(token, |fh| sys::futimens(fh.file.as_raw_fd(), times)),
            None => sys::utimensat(self.mount.dir(), rel(virt), times),
        }
    }

    // -----------------------------------------------------------------
    // Directories
    // -----------------------------------------------------------------

    /// Open a directory and snapshot its entries. Resolution is rooted at
    /// the mount anchor's descriptor; the literal `/` duplicates the
    /// anchor descriptor itself and rewinds it.
    pub fn opendir(&self, virt: &Path) -> SysResult<u64> {
        let dir = if virt == Path::new("/") {
            sys::dup_rewind(self.mount.dir())?
        } else {
            sys::openat(
                self.mount.dir(),
                rel(virt),
                libc::O_RDONLY | libc::O_DIRECTORY,
                None,
            )?
        };

        // The stream is read through the open descriptor, so a rename of
        // the lower directory after mount cannot redirect it.
        let descriptor_path = PathBuf::from(format!("/proc/self/fd/{}", dir.as_raw_fd()));
        let dir_meta = std::fs::metadata(&descriptor_path).map_err(Errno::from)?;
        let parent_st = sys::fstatat(dir.as_fd(), Path::new(".."), 0)?;

        let mut entries = vec![
            DirEntry {
                name: OsString::from("."),
                ino: dir_meta.ino(),
                file_type: Some(dir_meta.file_type()),
            },
            DirEntry {
                name: OsString::from(".."),
                ino: parent_st.st_ino,
                file_type: Some(dir_meta.file_type()),
            },
        ];
        for entry in std::fs::read_dir(&descriptor_path).map_err(Errno::from)? {
            let entry = entry.map_err(Errno::from)?;
            entries.push(DirEntry {
                name: entry.file_name(),
                ino: entry.ino(),
                file_type: entry.file_type().ok(),
            });
        }

        Ok(self
            .handles
            .insert(Handle::Dir(DirHandle { entries, offset: 0 })))
    }

    /// Serve directory entries from the handle's cursor. When the kernel's
    /// offset diverges from the stream's, reposition first. `fill` returns
    /// true when the kernel buffer is full.
    pub fn readdir(
        &self,
        token: u64,
        offset: i64,
        mut fill: impl FnMut(&DirEntry, i64) -> bool,
    ) -> SysResult<()> {
        self.with_dir(token, |dh| {
            if offset != dh.offset {
                dh.offset = offset;
            }
            while let Some(entry) = dh.entries.get(dh.offset.max(0) as usize) {
                let next_offset = dh.offset + 1;
                if fill(entry, next_offset) {
                    break;
                }
                dh.offset = next_offset;
            }
            Ok(())
        })
    }

    pub fn releasedir(&self, token: u64) -> SysResult<()> {
        self.with_dir(token, |_| Ok(()))?;
        self.handles.release(token);
        Ok(())
    }

    // -----------------------------------------------------------------
    // Pass-through namespace operations
    // -----------------------------------------------------------------

    pub fn access(&self, virt: &Path, mask: i32) -> SysResult<()> {
        sys::faccessat_checked(
            self.mount.dir(),
            rel(virt),
            mask,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    }

    pub fn readlink(&self, virt: &Path) -> SysResult<Vec<u8>> {
        sys::readlinkat(self.mount.dir(), rel(virt))
    }

    pub fn mknod(&self, virt: &Path, mode: u32, rdev: u64) -> SysResult<()> {
        sys::mknodat(self.mount.dir(), rel(virt), mode, rdev)
    }

    pub fn mkdir(&self, virt: &Path, mode: u32) -> SysResult<()> {
        sys::mkdirat(self.mount.dir(), rel(virt), mode)
    }

    pub fn unlink(&self, virt: &Path) -> SysResult<()> {
        sys::unlinkat(self.mount.dir(), rel(virt), 0)
    }

    pub fn rmdir(&self, virt: &Path) -> SysResult<()> {
        sys::unlinkat(self.mount.dir(), rel(virt), libc::AT_REMOVEDIR)
    }

    pub fn symlink(&self, target: &Path, virt: &Path) -> SysResult<()> {
        sys::symlinkat(target, self.mount.dir(), rel(virt))
    }

    /// Rename with flags honored via `renameat2`; unsupported flag bits
    /// are rejected, never dropped.
    pub fn rename(&self, from: &Path, to: &Path, flags: u32) -> SysResult<()> {
        if flags & !SUPPORTED_RENAME_FLAGS != 0 {
            return Err(Errno(libc::EINVAL));
        }
        sys::renameat2(self.mount.dir(), rel(from), rel(to), flags)
    }

    pub fn link(&self, from: &Path, to: &Path) -> SysResult<()> {
        sys::linkat(self.mount.dir(), rel(from), rel(to))
    }

    pub fn statfs(&self, virt: &Path) -> SysResult<libc::statvfs> {
        sys::statvfs(&self.mount.full_path(virt))
    }

    // -----------------------------------------------------------------
    // Extended attributes (anchored lower path)
    // -----------------------------------------------------------------

    pub fn setxattr(&self, virt: &Path, name: &OsStr, value: &[u8], flags: i32) -> SysResult<()> {
        sys::lsetxattr(&self.mount.full_path(virt), name, value, flags)
    }

    pub fn getxattr(&self, virt: &Path, name: &OsStr, size: u32) -> SysResult<XattrReply> {
        let path = self.mount.full_path(virt);
        if size == 0 {
            return Ok(XattrReply::Size(sys::lgetxattr_size(&path, name)?));
        }
        let mut buf = vec![0u8; size as usize];
        let n = sys::lgetxattr(&path, name, &mut buf)?;
        buf.truncate(n);
        Ok(XattrReply::Data(buf))
    }

    pub fn listxattr(&self, virt: &Path, size: u32) -> SysResult<XattrReply> {
        let path = self.mount.full_path(virt);
        if size == 0 {
            return Ok(XattrReply::Size(sys::llistxattr_size(&path)?));
        }
        let mut buf = vec![0u8; size as usize];
        let n = sys::llistxattr(&path, &mut buf)?;
        buf.truncate(n);
        Ok(XattrReply::Data(buf))
    }

    pub fn removexattr(&self, virt: &Path, name: &OsStr) -> SysResult<()> {
        sys::lremovexattr(&self.mount.full_path(virt), name)
    }
}

//! FUSE glue: translates kernel callbacks into [`Overlay`] calls.
//!
//! The kernel speaks inodes and reply objects; the overlay speaks virtual
//! paths, tokens, and `Result<_, Errno>`. This layer owns the inode table
//! and nothing else. Attribute caching is disabled by replying with zero
//! TTLs everywhere, so lower-tree changes are picked up immediately and
//! hardlink removal invalidates correctly.

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyLock, ReplyLseek, ReplyOpen, ReplyStatfs,
    ReplyWrite, ReplyXattr, Request, TimeOrNow,
};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::debug;

use crate::inode::InodeTable;
use crate::ops::{Overlay, XattrReply};
use crate::sys::Errno;

/// Zero TTL: no entry, attribute, or negative caching in the kernel.
const TTL_ZERO: Duration = Duration::ZERO;

/// The kernel-facing filesystem.
pub struct TemplateFs {
    overlay: Overlay,
    inodes: InodeTable,
}

impl TemplateFs {
    pub fn new(overlay: Overlay) -> Self {
        Self {
            overlay,
            inodes: InodeTable::new(),
        }
    }

    pub fn overlay(&self) -> &Overlay {
        &self.overlay
    }

    fn path_of(&self, ino: u64) -> Result<PathBuf, Errno> {
        self.inodes.path(ino).ok_or(Errno(libc::ENOENT))
    }

    fn child_of(&self, parent: u64, name: &OsStr) -> Result<PathBuf, Errno> {
        Ok(self.path_of(parent)?.join(name))
    }

    /// Stat the path and produce an entry reply, registering the inode.
    fn entry_for(&self, virt: &Path) -> Result<(u64, FileAttr), Errno> {
        let st = self.overlay.getattr_path(virt)?;
        let ino = self.inodes.get_or_create(virt);
        Ok((ino, stat_to_attr(&st, ino)))
    }
}

fn system_time(secs: i64, nsecs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::new(secs as u64, nsecs as u32)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

/// Convert a `stat` result to a FUSE attribute record. Inode numbers come
/// from this layer, not the lower filesystem, so the kernel's view stays
/// consistent with lookup.
fn stat_to_attr(st: &libc::stat, ino: u64) -> FileAttr {
    let kind = match st.st_mode & libc::S_IFMT {
        libc::S_IFDIR => FileType::Directory,
        libc::S_IFLNK => FileType::Symlink,
        libc::S_IFIFO => FileType::NamedPipe,
        libc::S_IFCHR => FileType::CharDevice,
        libc::S_IFBLK => FileType::BlockDevice,
        libc::S_IFSOCK => FileType::Socket,
        _ => FileType::RegularFile,
    };

    FileAttr {
        ino,
        size: st.st_size as u64,
        blocks: st.st_blocks as u64,
        atime: system_time(st.st_atime, st.st_atime_nsec),
        mtime: system_time(st.st_mtime, st.st_mtime_nsec),
        ctime: system_time(st.st_ctime, st.st_ctime_nsec),
        crtime: system_time(st.st_mtime, st.st_mtime_nsec),
        kind,
        perm: (st.st_mode & 0o7777) as u16,
        nlink: st.st_nlink as u32,
        uid: st.st_uid,
        gid: st.st_gid,
        rdev: st.st_rdev as u32,
        blksize: st.st_blksize as u32,
        flags: 0,
    }
}

fn file_type(entry: &crate::handle::DirEntry) -> FileType {
    match &entry.file_type {
        Some(ft) if ft.is_dir() => FileType::Directory,
        Some(ft) if ft.is_symlink() => FileType::Symlink,
        _ => FileType::RegularFile,
    }
}

/// Build the timespec pair `utimensat` expects from the kernel's optional
/// time updates.
fn timespec_pair(atime: Option<TimeOrNow>, mtime: Option<TimeOrNow>) -> [libc::timespec; 2] {
    fn convert(time: Option<TimeOrNow>) -> libc::timespec {
        match time {
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
            Some(TimeOrNow::Now) => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_NOW,
            },
            Some(TimeOrNow::SpecificTime(at)) => {
                let since = at
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                libc::timespec {
                    tv_sec: since.as_secs() as libc::time_t,
                    tv_nsec: since.subsec_nanos() as libc::c_long,
                }
            }
        }
    }
    [convert(atime), convert(mtime)]
}

impl Filesystem for TemplateFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), libc::c_int> {
        // Entry/attr/negative timeouts are zeroed per-reply; inode numbers
        // are supplied by this layer.
        debug!("filesystem initialized");
        Ok(())
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        let result = self
            .child_of(parent, name)
            .and_then(|virt| self.entry_for(&virt));
        match result {
            Ok((_, attr)) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, fh: Option<u64>, reply: ReplyAttr) {
        let result = match fh {
            Some(token) => self.overlay.getattr_handle(token),
            None => self
                .path_of(ino)
                .and_then(|virt| self.overlay.getattr_path(&virt)),
        };
        match result {
            Ok(st) => reply.attr(&TTL_ZERO, &stat_to_attr(&st, ino)),
            Err(errno) => reply.error(errno.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        let virt = match self.path_of(ino) {
            Ok(virt) => virt,
            Err(errno) => return reply.error(errno.0),
        };

        let result = (|| -> Result<(), Errno> {
            if let Some(mode) = mode {
                self.overlay.chmod(&virt, fh, mode)?;
            }
            if uid.is_some() || gid.is_some() {
                self.overlay.chown(
                    &virt,
                    fh,
                    uid.unwrap_or(u32::MAX),
                    gid.unwrap_or(u32::MAX),
                )?;
            }
            if let Some(size) = size {
                match fh {
                    Some(token) => self.overlay.truncate_handle(token, size as i64)?,
                    None => self.overlay.truncate_path(&virt, size as i64)?,
                }
            }
            if atime.is_some() || mtime.is_some() {
                self.overlay
                    .utimens(&virt, fh, &timespec_pair(atime, mtime))?;
            }
            Ok(())
        })();

        let result = result.and_then(|()| match fh {
            Some(token) => self.overlay.getattr_handle(token),
            None => self.overlay.getattr_path(&virt),
        });
        match result {
            Ok(st) => reply.attr(&TTL_ZERO, &stat_to_attr(&st, ino)),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        let result = self
            .path_of(ino)
            .and_then(|virt| self.overlay.readlink(&virt));
        match result {
            Ok(target) => reply.data(&target),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn mknod(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        rdev: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, name).and_then(|virt| {
            self.overlay.mknod(&virt, mode, rdev as u64)?;
            self.entry_for(&virt)
        });
        match result {
            Ok((_, attr)) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn mkdir(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, name).and_then(|virt| {
            self.overlay.mkdir(&virt, mode)?;
            self.entry_for(&virt)
        });
        match result {
            Ok((_, attr)) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_of(parent, name).and_then(|virt| {
            self.overlay.unlink(&virt)?;
            self.inodes.remove(&virt);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self.child_of(parent, name).and_then(|virt| {
            self.overlay.rmdir(&virt)?;
            self.inodes.remove(&virt);
            Ok(())
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        link_name: &OsStr,
        target: &Path,
        reply: ReplyEntry,
    ) {
        let result = self.child_of(parent, link_name).and_then(|virt| {
            self.overlay.symlink(target, &virt)?;
            self.entry_for(&virt)
        });
        match result {
            Ok((_, attr)) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        let result = (|| -> Result<(), Errno> {
            let from = self.child_of(parent, name)?;
            let to = self.child_of(newparent, newname)?;
            self.overlay.rename(&from, &to, flags)?;
            self.inodes.rename(&from, &to);
            Ok(())
        })();
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        newparent: u64,
        newname: &OsStr,
        reply: ReplyEntry,
    ) {
        let result = (|| {
            let from = self.path_of(ino)?;
            let to = self.child_of(newparent, newname)?;
            self.overlay.link(&from, &to)?;
            self.entry_for(&to)
        })();
        match result {
            Ok((_, attr)) => reply.entry(&TTL_ZERO, &attr, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        let result = self
            .path_of(ino)
            .and_then(|virt| self.overlay.open(&virt, flags));
        match result {
            Ok(token) => reply.opened(token, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        match self.overlay.read(fh, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        match self.overlay.write(fh, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.overlay.flush(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        match self.overlay.release(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn fsync(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.overlay.fsync(fh, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        let result = self.path_of(ino).and_then(|virt| self.overlay.opendir(&virt));
        match result {
            Ok(token) => reply.opened(token, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        let result = self.overlay.readdir(fh, offset, |entry, next_offset| {
            reply.add(entry.ino, next_offset, file_type(entry), &entry.name)
        });
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, fh: u64, _flags: i32, reply: ReplyEmpty) {
        match self.overlay.releasedir(fh) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn statfs(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyStatfs) {
        let virt = match self.inodes.path(ino) {
            Some(virt) => virt,
            None => PathBuf::from("/"),
        };
        match self.overlay.statfs(&virt) {
            Ok(st) => reply.statfs(
                st.f_blocks,
                st.f_bfree,
                st.f_bavail,
                st.f_files,
                st.f_ffree,
                st.f_bsize as u32,
                st.f_namemax as u32,
                st.f_frsize as u32,
            ),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        value: &[u8],
        flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        let result = self
            .path_of(ino)
            .and_then(|virt| self.overlay.setxattr(&virt, name, value, flags));
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        name: &OsStr,
        size: u32,
        reply: ReplyXattr,
    ) {
        let result = self
            .path_of(ino)
            .and_then(|virt| self.overlay.getxattr(&virt, name, size));
        match result {
            Ok(XattrReply::Size(needed)) => reply.size(needed as u32),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn listxattr(&mut self, _req: &Request<'_>, ino: u64, size: u32, reply: ReplyXattr) {
        let result = self
            .path_of(ino)
            .and_then(|virt| self.overlay.listxattr(&virt, size));
        match result {
            Ok(XattrReply::Size(needed)) => reply.size(needed as u32),
            Ok(XattrReply::Data(data)) => reply.data(&data),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn removexattr(&mut self, _req: &Request<'_>, ino: u64, name: &OsStr, reply: ReplyEmpty) {
        let result = self
            .path_of(ino)
            .and_then(|virt| self.overlay.removexattr(&virt, name));
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn access(&mut self, _req: &Request<'_>, ino: u64, mask: i32, reply: ReplyEmpty) {
        let result = self
            .path_of(ino)
            .and_then(|virt| self.overlay.access(&virt, mask));
        match result {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn create(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        _umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        let result = (|| {
            let virt = self.child_of(parent, name)?;
            let token = self.overlay.create(&virt, flags, mode)?;
            let st = self.overlay.getattr_handle(token)?;
            let ino = self.inodes.get_or_create(&virt);
            Ok::<_, Errno>((token, stat_to_attr(&st, ino)))
        })();
        match result {
            Ok((token, attr)) => reply.created(&TTL_ZERO, &attr, 0, token, 0),
            Err(errno) => reply.error(errno.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn getlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        reply: ReplyLock,
    ) {
        let mut lock = libc::flock {
            l_type: typ as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: end.saturating_sub(start) as libc::off_t,
            l_pid: pid as libc::pid_t,
        };
        match self.overlay.getlk(fh, &mut lock) {
            Ok(()) => reply.locked(
                lock.l_start as u64,
                (lock.l_start + lock.l_len) as u64,
                lock.l_type as i32,
                lock.l_pid as u32,
            ),
            Err(errno) => reply.error(errno.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setlk(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        _lock_owner: u64,
        start: u64,
        end: u64,
        typ: i32,
        pid: u32,
        sleep: bool,
        reply: ReplyEmpty,
    ) {
        let lock = libc::flock {
            l_type: typ as libc::c_short,
            l_whence: libc::SEEK_SET as libc::c_short,
            l_start: start as libc::off_t,
            l_len: end.saturating_sub(start) as libc::off_t,
            l_pid: pid as libc::pid_t,
        };
        match self.overlay.setlk(fh, sleep, &lock) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn fallocate(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        length: i64,
        mode: i32,
        reply: ReplyEmpty,
    ) {
        match self.overlay.fallocate(fh, mode, offset, length) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno.0),
        }
    }

    fn lseek(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        fh: u64,
        offset: i64,
        whence: i32,
        reply: ReplyLseek,
    ) {
        match self.overlay.lseek(fh, offset, whence) {
            Ok(offset) => reply.offset(offset),
            Err(errno) => reply.error(errno.0),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn copy_file_range(
        &mut self,
        _req: &Request<'_>,
        _ino_in: u64,
        fh_in: u64,
        offset_in: i64,
        _ino_out: u64,
        fh_out: u64,
        offset_out: i64,
        len: u64,
        flags: u32,
        reply: ReplyWrite,
    ) {
        match self
            .overlay
            .copy_file_range(fh_in, offset_in, fh_out, offset_out, len as usize, flags)
        {
            Ok(copied) => reply.written(copied as u32),
            Err(errno) => reply.error(errno.0),
        }
    }
}

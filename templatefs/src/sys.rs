//! Thin wrappers around the raw system calls the overlay needs.
//!
//! Every wrapper follows the same convention: a call that fails with `-1`
//! is reported as the `errno` it left behind, wrapped in [`Errno`]. The
//! FUSE layer negates that value when replying to the kernel. Path-taking
//! wrappers are `*at`-style and resolve relative to an anchor directory
//! descriptor, so resolution is always rooted in the intended tree.

use std::ffi::{CString, OsStr};
use std::fmt;
use std::fs::File;
use std::io;
use std::mem::MaybeUninit;
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

/// A positive errno value captured from a failed system call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Errno(pub i32);

impl Errno {
    /// Capture the errno left behind by the call that just failed.
    pub fn last() -> Self {
        Errno(
            io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(libc::EIO),
        )
    }

    /// The negated form libfuse-style callers expect.
    pub fn negated(self) -> i32 {
        -self.0
    }
}

impl fmt::Display for Errno {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", io::Error::from_raw_os_error(self.0))
    }
}

impl From<io::Error> for Errno {
    fn from(err: io::Error) -> Self {
        Errno(err.raw_os_error().unwrap_or(libc::EIO))
    }
}

pub type SysResult<T> = Result<T, Errno>;

/// Substitute the captured errno when `result == -1`, otherwise pass the
/// (possibly adjusted) value back unmodified.
fn check(result: libc::c_int) -> SysResult<libc::c_int> {
    if result == -1 {
        Err(Errno::last())
    } else {
        Ok(result)
    }
}

fn check_ssize(result: libc::ssize_t) -> SysResult<usize> {
    if result == -1 {
        Err(Errno::last())
    } else {
        Ok(result as usize)
    }
}

fn check_off(result: libc::off_t) -> SysResult<i64> {
    if result == -1 {
        Err(Errno::last())
    } else {
        Ok(result)
    }
}

fn cstr(path: &Path) -> SysResult<CString> {
    CString::new(path.as_os_str().as_bytes()).map_err(|_| Errno(libc::EINVAL))
}

fn cstr_os(name: &OsStr) -> SysResult<CString> {
    CString::new(name.as_bytes()).map_err(|_| Errno(libc::EINVAL))
}

// ---------------------------------------------------------------------------
// Directory anchors and path-addressed operations
// ---------------------------------------------------------------------------

/// Open a directory for use as a `*at` resolution anchor.
pub fn open_dir(path: &Path) -> SysResult<OwnedFd> {
    let c = cstr(path)?;
    let fd = check(unsafe {
        libc::open(
            c.as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        )
    })?;
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Open a path relative to an anchor, returning an owned `File`.
pub fn openat(dirfd: BorrowedFd<'_>, rel: &Path, flags: i32, mode: Option<u32>) -> SysResult<File> {
    let c = cstr(rel)?;
    let fd = match mode {
        Some(mode) => check(unsafe {
            libc::openat(
                dirfd.as_raw_fd(),
                c.as_ptr(),
                flags | libc::O_CLOEXEC,
                mode as libc::c_uint,
            )
        })?,
        None => check(unsafe {
            libc::openat(dirfd.as_raw_fd(), c.as_ptr(), flags | libc::O_CLOEXEC)
        })?,
    };
    Ok(unsafe { File::from_raw_fd(fd) })
}

/// Probe a path relative to an anchor. A successful access returns true
/// and leaves no errno behind.
pub fn faccessat(dirfd: BorrowedFd<'_>, rel: &Path, mode: i32, flags: i32) -> bool {
    match cstr(rel) {
        Ok(c) => unsafe { libc::faccessat(dirfd.as_raw_fd(), c.as_ptr(), mode, flags) == 0 },
        Err(_) => false,
    }
}

/// Like [`faccessat`] but reporting the errno on failure, for the `access`
/// operation itself.
pub fn faccessat_checked(dirfd: BorrowedFd<'_>, rel: &Path, mode: i32, flags: i32) -> SysResult<()> {
    let c = cstr(rel)?;
    check(unsafe { libc::faccessat(dirfd.as_raw_fd(), c.as_ptr(), mode, flags) })?;
    Ok(())
}

pub fn fstatat(dirfd: BorrowedFd<'_>, rel: &Path, flags: i32) -> SysResult<libc::stat> {
    let c = cstr(rel)?;
    let mut st = MaybeUninit::<libc::stat>::uninit();
    check(unsafe { libc::fstatat(dirfd.as_raw_fd(), c.as_ptr(), st.as_mut_ptr(), flags) })?;
    Ok(unsafe { st.assume_init() })
}

pub fn fstat(fd: RawFd) -> SysResult<libc::stat> {
    let mut st = MaybeUninit::<libc::stat>::uninit();
    check(unsafe { libc::fstat(fd, st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

pub fn readlinkat(dirfd: BorrowedFd<'_>, rel: &Path) -> SysResult<Vec<u8>> {
    let c = cstr(rel)?;
    let mut buf = vec![0u8; libc::PATH_MAX as usize];
    let n = check_ssize(unsafe {
        libc::readlinkat(
            dirfd.as_raw_fd(),
            c.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_char,
            buf.len(),
        )
    })?;
    buf.truncate(n);
    Ok(buf)
}

pub fn mknodat(dirfd: BorrowedFd<'_>, rel: &Path, mode: u32, rdev: u64) -> SysResult<()> {
    let c = cstr(rel)?;
    if mode & libc::S_IFMT == libc::S_IFIFO {
        check(unsafe { libc::mkfifoat(dirfd.as_raw_fd(), c.as_ptr(), mode as libc::mode_t) })?;
    } else {
        check(unsafe {
            libc::mknodat(
                dirfd.as_raw_fd(),
                c.as_ptr(),
                mode as libc::mode_t,
                rdev as libc::dev_t,
            )
        })?;
    }
    Ok(())
}

pub fn mkdirat(dirfd: BorrowedFd<'_>, rel: &Path, mode: u32) -> SysResult<()> {
    let c = cstr(rel)?;
    check(unsafe { libc::mkdirat(dirfd.as_raw_fd(), c.as_ptr(), mode as libc::mode_t) })?;
    Ok(())
}

pub fn unlinkat(dirfd: BorrowedFd<'_>, rel: &Path, flags: i32) -> SysResult<()> {
    let c = cstr(rel)?;
    check(unsafe { libc::unlinkat(dirfd.as_raw_fd(), c.as_ptr(), flags) })?;
    Ok(())
}

pub fn symlinkat(target: &Path, dirfd: BorrowedFd<'_>, rel: &Path) -> SysResult<()> {
    let t = cstr(target)?;
    let c = cstr(rel)?;
    check(unsafe { libc::symlinkat(t.as_ptr(), dirfd.as_raw_fd(), c.as_ptr()) })?;
    Ok(())
}

pub fn renameat2(
    dirfd: BorrowedFd<'_>,
    from: &Path,
    to: &Path,
    flags: u32,
) -> SysResult<()> {
    let f = cstr(from)?;
    let t = cstr(to)?;
    check(unsafe {
        libc::renameat2(
            dirfd.as_raw_fd(),
            f.as_ptr(),
            dirfd.as_raw_fd(),
            t.as_ptr(),
            flags,
        )
    })?;
    Ok(())
}

pub fn linkat(dirfd: BorrowedFd<'_>, from: &Path, to: &Path) -> SysResult<()> {
    let f = cstr(from)?;
    let t = cstr(to)?;
    check(unsafe {
        libc::linkat(
            dirfd.as_raw_fd(),
            f.as_ptr(),
            dirfd.as_raw_fd(),
            t.as_ptr(),
            0,
        )
    })?;
    Ok(())
}

pub fn fchmodat(dirfd: BorrowedFd<'_>, rel: &Path, mode: u32) -> SysResult<()> {
    let c = cstr(rel)?;
    // AT_SYMLINK_NOFOLLOW is not implemented for fchmodat on Linux.
    check(unsafe { libc::fchmodat(dirfd.as_raw_fd(), c.as_ptr(), mode as libc::mode_t, 0) })?;
    Ok(())
}

pub fn fchmod(fd: RawFd, mode: u32) -> SysResult<()> {
    check(unsafe { libc::fchmod(fd, mode as libc::mode_t) })?;
    Ok(())
}

pub fn fchownat(dirfd: BorrowedFd<'_>, rel: &Path, uid: u32, gid: u32) -> SysResult<()> {
    let c = cstr(rel)?;
    check(unsafe {
        libc::fchownat(
            dirfd.as_raw_fd(),
            c.as_ptr(),
            uid as libc::uid_t,
            gid as libc::gid_t,
            libc::AT_EMPTY_PATH | libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(())
}

pub fn fchown(fd: RawFd, uid: u32, gid: u32) -> SysResult<()> {
    check(unsafe { libc::fchown(fd, uid as libc::uid_t, gid as libc::gid_t) })?;
    Ok(())
}

pub fn ftruncate(fd: RawFd, size: i64) -> SysResult<()> {
    check(unsafe { libc::ftruncate(fd, size as libc::off_t) })?;
    Ok(())
}

pub fn utimensat(dirfd: BorrowedFd<'_>, rel: &Path, times: &[libc::timespec; 2]) -> SysResult<()> {
    let c = cstr(rel)?;
    check(unsafe {
        libc::utimensat(
            dirfd.as_raw_fd(),
            c.as_ptr(),
            times.as_ptr(),
            libc::AT_SYMLINK_NOFOLLOW,
        )
    })?;
    Ok(())
}

pub fn futimens(fd: RawFd, times: &[libc::timespec; 2]) -> SysResult<()> {
    check(unsafe { libc::futimens(fd, times.as_ptr()) })?;
    Ok(())
}

pub fn statvfs(path: &Path) -> SysResult<libc::statvfs> {
    let c = cstr(path)?;
    let mut st = MaybeUninit::<libc::statvfs>::uninit();
    check(unsafe { libc::statvfs(c.as_ptr(), st.as_mut_ptr()) })?;
    Ok(unsafe { st.assume_init() })
}

// ---------------------------------------------------------------------------
// Descriptor-addressed operations
// ---------------------------------------------------------------------------

/// Duplicate a directory descriptor and rewind it, so the anchor itself
/// can back a directory stream without reopening it by path.
pub fn dup_rewind(fd: BorrowedFd<'_>) -> SysResult<File> {
    let dup = check(unsafe { libc::dup(fd.as_raw_fd()) })?;
    let file = unsafe { File::from_raw_fd(dup) };
    lseek(file.as_raw_fd(), 0, libc::SEEK_SET)?;
    Ok(file)
}

/// The close-on-every-flush trick: close a duplicate so the underlying
/// filesystem sees a close without invalidating the open handle.
pub fn flush_dup(fd: RawFd) -> SysResult<()> {
    let dup = check(unsafe { libc::dup(fd) })?;
    check(unsafe { libc::close(dup) })?;
    Ok(())
}

pub fn fsync(fd: RawFd, datasync: bool) -> SysResult<()> {
    if datasync {
        check(unsafe { libc::fdatasync(fd) })?;
    } else {
        check(unsafe { libc::fsync(fd) })?;
    }
    Ok(())
}

/// posix_fallocate reports its error directly instead of through errno.
pub fn fallocate(fd: RawFd, offset: i64, length: i64) -> SysResult<()> {
    let err = unsafe {
        libc::posix_fallocate(fd, offset as libc::off_t, length as libc::off_t)
    };
    if err != 0 {
        Err(Errno(err))
    } else {
        Ok(())
    }
}

pub fn copy_file_range(
    fd_in: RawFd,
    off_in: i64,
    fd_out: RawFd,
    off_out: i64,
    len: usize,
    flags: u32,
) -> SysResult<usize> {
    let mut off_in = off_in as libc::off64_t;
    let mut off_out = off_out as libc::off64_t;
    check_ssize(unsafe {
        libc::copy_file_range(
            fd_in,
            &mut off_in,
            fd_out,
            &mut off_out,
            len,
            flags as libc::c_uint,
        )
    })
}

pub fn lseek(fd: RawFd, offset: i64, whence: i32) -> SysResult<i64> {
    check_off(unsafe { libc::lseek(fd, offset as libc::off_t, whence) })
}

pub fn flock(fd: RawFd, op: i32) -> SysResult<()> {
    check(unsafe { libc::flock(fd, op) })?;
    Ok(())
}

pub fn fcntl_getlk(fd: RawFd, lock: &mut libc::flock) -> SysResult<()> {
    check(unsafe { libc::fcntl(fd, libc::F_GETLK, lock as *mut libc::flock) })?;
    Ok(())
}

pub fn fcntl_setlk(fd: RawFd, wait: bool, lock: &libc::flock) -> SysResult<()> {
    let cmd = if wait { libc::F_SETLKW } else { libc::F_SETLK };
    check(unsafe { libc::fcntl(fd, cmd, lock as *const libc::flock) })?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Extended attributes (addressed by the anchored lower path)
// ---------------------------------------------------------------------------

pub fn lsetxattr(path: &Path, name: &OsStr, value: &[u8], flags: i32) -> SysResult<()> {
    let p = cstr(path)?;
    let n = cstr_os(name)?;
    check(unsafe {
        libc::lsetxattr(
            p.as_ptr(),
            n.as_ptr(),
            value.as_ptr() as *const libc::c_void,
            value.len(),
            flags,
        )
    })?;
    Ok(())
}

pub fn lgetxattr(path: &Path, name: &OsStr, buf: &mut [u8]) -> SysResult<usize> {
    let p = cstr(path)?;
    let n = cstr_os(name)?;
    check_ssize(unsafe {
        libc::lgetxattr(
            p.as_ptr(),
            n.as_ptr(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len(),
        )
    })
}

/// Query the size of an extended attribute value without copying it out.
pub fn lgetxattr_size(path: &Path, name: &OsStr) -> SysResult<usize> {
    let p = cstr(path)?;
    let n = cstr_os(name)?;
    check_ssize(unsafe {
        libc::lgetxattr(p.as_ptr(), n.as_ptr(), std::ptr::null_mut(), 0)
    })
}

pub fn llistxattr(path: &Path, buf: &mut [u8]) -> SysResult<usize> {
    let p = cstr(path)?;
    check_ssize(unsafe {
        libc::llistxattr(p.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
    })
}

pub fn llistxattr_size(path: &Path) -> SysResult<usize> {
    let p = cstr(path)?;
    check_ssize(unsafe { libc::llistxattr(p.as_ptr(), std::ptr::null_mut(), 0) })
}

pub fn lremovexattr(path: &Path, name: &OsStr) -> SysResult<()> {
    let p = cstr(path)?;
    let n = cstr_os(name)?;
    check(unsafe { libc::lremovexattr(p.as_ptr(), n.as_ptr()) })?;
    Ok(())
}

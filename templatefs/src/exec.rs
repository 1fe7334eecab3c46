//! Executable-template driver.
//!
//! A template file carrying the executable bit is not expanded; it is run.
//! The child is invoked with the absolute template path as its program and
//! the absolute lower-tree path as its single argument, against the
//! environment captured at startup. The parent drains stdout and stderr
//! concurrently through `poll` into two elastic buffers until both streams
//! hang up, then reaps the child. Captured stdout becomes the file's
//! contents; stderr is logged as a numbered warning block.
//!
//! The 10 second poll tick is not a deadline: it only bounds the wait when
//! the child neither writes nor exits. A template that hangs holds its
//! opening request hostage for as long as it hangs.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsRawFd, RawFd};
use std::path::Path;
use std::process::{Command, Stdio};
use thiserror::Error;
use tracing::{debug, warn};

use crate::buffer::ElasticBuffer;
use crate::logging::log_text_block;
use crate::sys::Errno;

/// Initial capacity of each drain buffer.
const DRAIN_CAPACITY: usize = 16 * 1024;
/// Headroom floor kept ahead of every read.
const DRAIN_HEADROOM: usize = 2 * 1024;
/// Poll tick in milliseconds; bounds the spin, not the render.
const POLL_TICK_MS: libc::c_int = 10_000;

/// Errors from running an executable template.
#[derive(Debug, Error)]
pub enum ExecError {
    #[error("failed to spawn template process: {0}")]
    Spawn(#[source] io::Error),

    #[error("failed to drain template output: {0}")]
    Drain(Errno),

    #[error("failed to reap template process: {0}")]
    Wait(#[source] io::Error),

    /// The child ran but reported failure; the payload is its exit code.
    #[error("template process exited with code {0}")]
    Exited(i32),

    #[error("template process was terminated by a signal")]
    Signaled,
}

impl ExecError {
    /// The errno the kernel-facing layer reports for this failure. Raw
    /// exit codes are not errnos; they are preserved in the log record
    /// and in [`ExecError::Exited`] itself.
    pub fn errno(&self) -> Errno {
        match self {
            ExecError::Spawn(err) | ExecError::Wait(err) => {
                Errno(err.raw_os_error().unwrap_or(libc::EIO))
            }
            ExecError::Drain(errno) => *errno,
            ExecError::Exited(_) | ExecError::Signaled => Errno(libc::EIO),
        }
    }
}

/// One child stream being drained.
struct Stream {
    fd: RawFd,
    buf: ElasticBuffer,
    eof: bool,
}

impl Stream {
    fn new(fd: RawFd) -> Self {
        Self {
            fd,
            buf: ElasticBuffer::new(DRAIN_CAPACITY, DRAIN_HEADROOM),
            eof: false,
        }
    }

    /// Read once into the buffer, growing first so at least the headroom
    /// is writable. A zero-length read marks stream EOF.
    fn fill(&mut self) -> Result<(), Errno> {
        self.buf.reserve_headroom();
        let spare = self.buf.spare_mut();
        let n = unsafe {
            libc::read(
                self.fd,
                spare.as_mut_ptr() as *mut libc::c_void,
                spare.len(),
            )
        };
        match n {
            -1 => {
                let errno = Errno::last();
                if errno.0 == libc::EINTR || errno.0 == libc::EAGAIN {
                    Ok(())
                } else {
                    Err(errno)
                }
            }
            0 => {
                self.eof = true;
                Ok(())
            }
            n => {
                self.buf.commit(n as usize);
                Ok(())
            }
        }
    }
}

/// Wait for readability or hang-up on both streams until each reaches
/// EOF.
fn drain(streams: &mut [&mut Stream]) -> Result<(), Errno> {
    loop {
        let mut fds: Vec<libc::pollfd> = streams
            .iter()
            .filter(|s| !s.eof)
            .map(|s| libc::pollfd {
                fd: s.fd,
                events: libc::POLLIN,
                revents: 0,
            })
            .collect();
        if fds.is_empty() {
            return Ok(());
        }

        let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, POLL_TICK_MS) };
        if ready == -1 {
            let errno = Errno::last();
            if errno.0 == libc::EINTR {
                continue;
            }
            return Err(errno);
        }
        if ready == 0 {
            // Tick expired with nothing to show; keep waiting for the
            // child to write or hang up.
            continue;
        }

        for pollfd in &fds {
            let stream = match streams.iter_mut().find(|s| s.fd == pollfd.fd) {
                Some(stream) => stream,
                None => continue,
            };
            if pollfd.revents & libc::POLLIN != 0 {
                stream.fill()?;
            } else if pollfd.revents & (libc::POLLHUP | libc::POLLERR) != 0 {
                stream.eof = true;
            }
        }
    }
}

/// Run an executable template and capture its standard output.
///
/// `template_path` and `lower_path` are the absolute paths inside the
/// template tree and the lower tree; `env` is the process environment
/// captured at startup. A non-zero exit status is the operation's error.
pub fn execute_template(
    template_path: &Path,
    lower_path: &Path,
    env: &[(OsString, OsString)],
) -> Result<Vec<u8>, ExecError> {
    debug!(template = %template_path.display(), "running executable template");

    let mut child = Command::new(template_path)
        .arg(lower_path)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.clone(), v.clone())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(ExecError::Spawn)?;

    // Piped stdio is always present on a freshly spawned child.
    let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
        (Some(out), Some(err)) => (out, err),
        _ => return Err(ExecError::Drain(Errno(libc::EBADF))),
    };

    let mut out_stream = Stream::new(stdout.as_raw_fd());
    let mut err_stream = Stream::new(stderr.as_raw_fd());
    let drained = drain(&mut [&mut out_stream, &mut err_stream]);

    // Reap regardless of how the drain went.
    let status = child.wait().map_err(ExecError::Wait);
    drained.map_err(ExecError::Drain)?;
    let status = status?;

    if !err_stream.buf.is_empty() {
        log_text_block(
            &template_path.display().to_string(),
            err_stream.buf.as_slice(),
        );
    }

    match status.code() {
        Some(0) => Ok(out_stream.buf.into_contents()),
        Some(code) => {
            warn!(
                template = %template_path.display(),
                code,
                "executable template reported failure"
            );
            Err(ExecError::Exited(code))
        }
        None => Err(ExecError::Signaled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::tempdir;

    fn write_script(dir: &Path, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn env() -> Vec<(OsString, OsString)> {
        std::env::vars_os().collect()
    }

    #[test]
    fn captures_stdout_of_a_successful_child() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "t", "#!/bin/sh\nprintf 'one\\ntwo\\n'\n");
        let out = execute_template(&script, Path::new("/tmp/lower"), &env()).unwrap();
        assert_eq!(out, b"one\ntwo\n");
    }

    #[test]
    fn stderr_is_separated_from_stdout() {
        let dir = tempdir().unwrap();
        let script = write_script(
            dir.path(),
            "t",
            "#!/bin/sh\nprintf 'visible'\nprintf 'hidden\\n' >&2\n",
        );
        let out = execute_template(&script, Path::new("/tmp/lower"), &env()).unwrap();
        assert_eq!(out, b"visible");
    }

    #[test]
    fn zero_output_child_yields_empty_contents() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "t", "#!/bin/sh\nexit 0\n");
        let out = execute_template(&script, Path::new("/tmp/lower"), &env()).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn nonzero_exit_code_is_the_operations_error() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "t", "#!/bin/sh\nexit 3\n");
        let err = execute_template(&script, Path::new("/tmp/lower"), &env()).unwrap_err();
        match err {
            ExecError::Exited(code) => assert_eq!(code, 3),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn child_receives_template_and_lower_paths() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "t", "#!/bin/sh\nprintf '%s:%s' \"$0\" \"$1\"\n");
        let out = execute_template(&script, Path::new("/lower/t"), &env()).unwrap();
        let text = String::from_utf8(out).unwrap();
        let (argv0, argv1) = text.split_once(':').unwrap();
        assert!(argv0.ends_with("/t"));
        assert_eq!(argv1, "/lower/t");
    }

    #[test]
    fn child_sees_the_captured_environment() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "t", "#!/bin/sh\nprintf '%s' \"$TFS_PROBE\"\n");
        let mut env = env();
        env.push(("TFS_PROBE".into(), "captured".into()));
        let out = execute_template(&script, Path::new("/tmp/lower"), &env).unwrap();
        assert_eq!(out, b"captured");
    }

    #[test]
    fn output_larger_than_initial_capacity_grows_the_buffer() {
        let dir = tempdir().unwrap();
        // 64 KiB of 'x', four times the initial buffer capacity.
        let script = write_script(
            dir.path(),
            "t",
            "#!/bin/sh\ni=0\nwhile [ $i -lt 1024 ]; do\n  printf '%064d' 0\n  i=$((i+1))\ndone\n",
        );
        let out = execute_template(&script, Path::new("/tmp/lower"), &env()).unwrap();
        assert_eq!(out.len(), 64 * 1024);
    }

    #[test]
    fn missing_interpreter_fails_to_spawn_or_exec() {
        let dir = tempdir().unwrap();
        let script = write_script(dir.path(), "t", "#!/no/such/interp\n");
        let err = execute_template(&script, Path::new("/tmp/lower"), &env()).unwrap_err();
        // Depending on the platform this surfaces at spawn time or as a
        // non-zero exit; either way the open must fail.
        match err {
            ExecError::Spawn(_) | ExecError::Exited(_) => {}
            other => panic!("unexpected error {other:?}"),
        }
    }
}

//! Session construction and the mount event loop.

use fuser::{MountOption, Session};
use std::io;
use std::path::Path;
use thiserror::Error;
use tracing::info;

use crate::fs::TemplateFs;

/// Errors from mounting or running the FUSE session.
#[derive(Debug, Error)]
pub enum MountError {
    /// Creating the session (which performs the mount) failed.
    #[error("failed to mount at \"{mountpoint}\": {source}")]
    Mount {
        mountpoint: String,
        #[source]
        source: io::Error,
    },

    /// The event loop terminated with an error.
    #[error("FUSE event loop failed: {0}")]
    EventLoop(#[source] io::Error),
}

/// Mount the filesystem and run the event loop until unmounted.
///
/// The session loop dispatches one kernel request at a time; `-s` style
/// single-threading is therefore the native mode of this session type.
pub fn run(fs: TemplateFs, mountpoint: &Path) -> Result<(), MountError> {
    // No default_permissions: access checks go through the access
    // operation so template entries answer from the probe, not the kernel.
    let options = [
        MountOption::FSName("templatefs".to_string()),
        MountOption::AutoUnmount,
    ];

    let mut session =
        Session::new(fs, mountpoint, &options).map_err(|source| MountError::Mount {
            mountpoint: mountpoint.display().to_string(),
            source,
        })?;

    info!(mountpoint = %mountpoint.display(), "mounted");
    session.run().map_err(MountError::EventLoop)?;
    info!(mountpoint = %mountpoint.display(), "unmounted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_error_reports_the_mountpoint() {
        let err = MountError::Mount {
            mountpoint: "/mnt/overlay".to_string(),
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        assert!(err.to_string().contains("/mnt/overlay"));
    }
}

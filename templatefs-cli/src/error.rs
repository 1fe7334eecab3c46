//! CLI error handling: one place that maps failures to messages and the
//! documented exit codes.
//!
//! Exit codes: `0` success/help/version, `1` option parse failure, `2`
//! missing or invalid mountpoint/template tree, `4` mount failed, `7`
//! event loop failed, `8` template-option validation failed. Codes `3`,
//! `5` and `6` are reserved (session construction is part of mounting
//! here, the process stays in the foreground, and signal handling is the
//! mount layer's business).

use std::fmt;
use std::io;
use std::process;
use templatefs::anchor::AnchorError;
use templatefs::mount::MountError;

/// CLI-level failures, each carrying its exit code.
#[derive(Debug)]
pub enum CliError {
    /// Failed to initialize logging.
    Logging(io::Error),
    /// The mountpoint or template tree is missing or invalid.
    Anchor(AnchorError),
    /// The template-specific options did not validate.
    Options(String),
    /// Mounting or running the filesystem failed.
    Mount(MountError),
}

impl CliError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CliError::Logging(_) => 1,
            CliError::Anchor(_) => 2,
            CliError::Options(_) => 8,
            CliError::Mount(MountError::Mount { .. }) => 4,
            CliError::Mount(MountError::EventLoop(_)) => 7,
        }
    }

    /// Print the error and terminate with its exit code.
    pub fn exit(&self) -> ! {
        eprintln!("Error: {self}");

        if let CliError::Mount(MountError::Mount { .. }) = self {
            eprintln!();
            eprintln!("Common issues:");
            eprintln!("  1. FUSE not installed: install the fuse3 package");
            eprintln!("  2. Mountpoint busy: try: fusermount3 -u <mountpoint>");
        }

        process::exit(self.exit_code())
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::Logging(err) => write!(f, "failed to initialize logging: {err}"),
            CliError::Anchor(err) => write!(f, "{err}"),
            CliError::Options(msg) => write!(f, "invalid options: {msg}"),
            CliError::Mount(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for CliError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CliError::Logging(err) => Some(err),
            CliError::Anchor(err) => Some(err),
            CliError::Mount(err) => Some(err),
            CliError::Options(_) => None,
        }
    }
}

impl From<AnchorError> for CliError {
    fn from(err: AnchorError) -> Self {
        CliError::Anchor(err)
    }
}

impl From<MountError> for CliError {
    fn from(err: MountError) -> Self {
        CliError::Mount(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_match_the_documented_table() {
        let logging = CliError::Logging(io::Error::other("x"));
        assert_eq!(logging.exit_code(), 1);

        let anchor = CliError::Anchor(AnchorError::InvalidPath {
            path: "/nope".into(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        });
        assert_eq!(anchor.exit_code(), 2);

        let options = CliError::Options("bad config".into());
        assert_eq!(options.exit_code(), 8);

        let mount = CliError::Mount(MountError::Mount {
            mountpoint: "/mnt".into(),
            source: io::Error::other("x"),
        });
        assert_eq!(mount.exit_code(), 4);

        let event_loop = CliError::Mount(MountError::EventLoop(io::Error::other("x")));
        assert_eq!(event_loop.exit_code(), 7);
    }

    #[test]
    fn messages_surface_the_underlying_cause() {
        let anchor = CliError::Anchor(AnchorError::InvalidPath {
            path: "/missing/tree".into(),
            source: io::Error::from_raw_os_error(libc::ENOENT),
        });
        assert!(anchor.to_string().contains("/missing/tree"));
    }
}

//! Template rendering: expansion engine, navigation context, and the
//! top-level entry used by `open`.
//!
//! A render is self-contained: it reads the template through the open
//! descriptor, opens the configuration store fresh, pre-populates the key
//! set, expands, and tears everything down before returning. Nothing is
//! shared across concurrent renders.

mod context;
mod engine;

pub use context::{RenderContext, Section};
pub use engine::{code, render, RenderHooks};

use std::fs::File;
use std::io::Read;
use std::os::fd::AsRawFd;
use std::path::Path;
use thiserror::Error;

use crate::store::{ConfigStore, StoreError};
use crate::sys::{self, Errno};

/// Errors that abort a render and propagate as the `open` result.
#[derive(Debug, Error)]
pub enum RenderError {
    /// An underlying system call failed.
    #[error("system error while rendering: {0}")]
    Sys(Errno),

    /// The expansion engine rejected the template; the payload is one of
    /// the [`code`] constants.
    #[error("template engine error {0}")]
    Engine(i32),

    /// The configuration store could not be opened.
    #[error("configuration store unavailable: {0}")]
    StoreOpen(#[source] StoreError),

    /// The key set could not be populated from the store.
    #[error("key set unavailable: {0}")]
    KeySet(#[source] StoreError),
}

impl RenderError {
    /// The errno the kernel-facing layer reports for this failure.
    pub fn errno(&self) -> Errno {
        match self {
            RenderError::Sys(errno) => *errno,
            RenderError::Engine(_) => Errno(libc::EINVAL),
            RenderError::StoreOpen(_) => Errno(libc::EFAULT),
            RenderError::KeySet(_) => Errno(libc::EADDRNOTAVAIL),
        }
    }

    /// The engine status code passed to `stop`.
    pub fn engine_code(&self) -> i32 {
        match self {
            RenderError::Engine(code) => *code,
            _ => code::ERROR_SYSTEM,
        }
    }
}

/// Render the template behind `file` against the configuration store at
/// `store_path`, producing the bytes served for subsequent reads.
pub fn process_template(file: &File, store_path: &Path) -> Result<Vec<u8>, RenderError> {
    let st = sys::fstat(file.as_raw_fd()).map_err(RenderError::Sys)?;

    let mut raw = Vec::with_capacity(st.st_size.max(0) as usize);
    let mut reader = file;
    reader
        .read_to_end(&mut raw)
        .map_err(|err| RenderError::Sys(err.into()))?;
    let template = String::from_utf8(raw).map_err(|_| RenderError::Sys(Errno(libc::EINVAL)))?;

    let store = ConfigStore::open(store_path).map_err(RenderError::StoreOpen)?;
    let keys = store.key_set().map_err(RenderError::KeySet)?;

    let mut ctx = RenderContext::new(keys);
    let rendered = render(&template, &mut ctx)?;
    Ok(rendered.into_bytes())
}

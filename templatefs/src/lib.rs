//! templatefs - an overlay filesystem that renders templates on demand.
//!
//! The filesystem mirrors the directory tree beneath its mountpoint (the
//! lower tree). When an opened path has a corresponding entry in a
//! parallel template tree, read-side operations are intercepted and the
//! file's contents are synthesized on the fly:
//!
//! - a plain template is expanded through a logic-less template engine
//!   backed by a hierarchical configuration store;
//! - a template carrying the executable bit is run as a child process and
//!   its standard output captured.
//!
//! Everything else passes straight through to the lower tree, much like
//! an overlay without an upper layer, except the lower files stay
//! writable.
//!
//! # High-level API
//!
//! ```ignore
//! use templatefs::{mount, ops::Overlay, fs::TemplateFs};
//!
//! let overlay = Overlay::new(mountpoint, template_root, store_path)?;
//! mount::run(TemplateFs::new(overlay), mountpoint)?;
//! ```

pub mod anchor;
pub mod buffer;
pub mod exec;
pub mod fs;
pub mod handle;
pub mod inode;
pub mod logging;
pub mod mount;
pub mod ops;
pub mod render;
pub mod store;
pub mod sys;

/// Version of the templatefs library and CLI.
///
/// Synchronized across the workspace; injected from `Cargo.toml` at
/// compile time.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

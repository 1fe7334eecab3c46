//! templatefs CLI - mount an overlay that renders templates on demand.
//!
//! The binary wires together the library pieces: argument parsing,
//! logging, anchor resolution, and the FUSE session. It exits with the
//! documented code for each failure class (see [`error::CliError`]).

mod error;

use clap::error::ErrorKind;
use clap::Parser;
use error::CliError;
use std::path::PathBuf;
use std::process;
use templatefs::fs::TemplateFs;
use templatefs::logging;
use templatefs::mount;
use templatefs::ops::Overlay;
use templatefs::store::ConfigStore;
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "templatefs")]
#[command(version = templatefs::VERSION)]
#[command(about = "Overlay filesystem that renders template files on demand")]
struct Cli {
    /// Directory to mount over; also the lower tree that is mirrored
    mountpoint: PathBuf,

    /// Root of the template hierarchy
    #[arg(short, long)]
    templates: PathBuf,

    /// Configuration store backing file used while rendering
    #[arg(long, default_value = "/etc/templatefs/config.ini")]
    config: PathBuf,

    /// Stay in the foreground (the only supported mode; accepted for
    /// mount(8) compatibility)
    #[arg(short, long)]
    foreground: bool,

    /// Run the event loop single-threaded (the session's native mode;
    /// accepted for compatibility)
    #[arg(short, long)]
    single_thread: bool,

    /// Also append log records to this file
    #[arg(long)]
    log_file: Option<PathBuf>,
}

fn main() {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let code = match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => 0,
                ErrorKind::MissingRequiredArgument => 2,
                _ => 1,
            };
            // clap renders help/version and diagnostics itself.
            let _ = err.print();
            process::exit(code);
        }
    };

    if let Err(err) = run(cli) {
        err.exit();
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let _guard = logging::init_logging(cli.log_file.as_deref()).map_err(CliError::Logging)?;
    info!(version = templatefs::VERSION, "templatefs starting");

    if !cli.foreground {
        info!("running in the foreground (daemonizing is not supported)");
    }

    preflight_store(&cli.config)?;

    // Anchors must be opened before the mount shadows the lower tree.
    let overlay = Overlay::new(&cli.mountpoint, &cli.templates, &cli.config)?;
    let fs = TemplateFs::new(overlay);
    mount::run(fs, &cli.mountpoint)?;

    Ok(())
}

/// Catch configuration-store syntax errors at startup instead of on the
/// first render. A missing store only warns; it may appear later.
fn preflight_store(path: &std::path::Path) -> Result<(), CliError> {
    if !path.exists() {
        warn!(store = %path.display(), "configuration store not found; renders will fail until it exists");
        return Ok(());
    }
    let store = ConfigStore::open(path)
        .map_err(|err| CliError::Options(err.to_string()))?;
    store
        .key_set()
        .map_err(|err| CliError::Options(err.to_string()))?;
    Ok(())
}

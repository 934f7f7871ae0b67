//! barnd — the Barn daemon entry point.
//!
//! Bootstraps the base directory, acquires the scheduler lock, runs
//! recovery, and then runs the scheduler/retry/cleanup loops until
//! SIGTERM. The CLI surface, IPC wire format, and service-manager
//! registration are out of scope for this binary; it is the bootstrap
//! a supervisor (systemd/launchd/SCM) execs directly.

use tracing_subscriber::EnvFilter;

use barn::config::Config;
use barn::daemon::Daemon;
use barn::directories::{resolve_base_dir, resolve_config_dir};

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .init();

    if let Err(e) = run() {
        tracing::error!(error = %e, "barnd exiting on startup failure");
        std::process::exit(1);
    }
}

fn run() -> Result<(), barn::error::BarnError> {
    let base_dir = resolve_base_dir(None);
    let config_dir = resolve_config_dir();
    let config = Config::from_env();

    tracing::info!(base_dir = %base_dir.display(), config_dir = %config_dir.display(), "starting barnd");
    let daemon = Daemon::bootstrap(base_dir, config_dir, config)?;
    daemon.run()
}

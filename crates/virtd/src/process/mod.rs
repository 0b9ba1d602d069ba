//! Process lifecycle: bootstrap, serve, wait for a signal, tear down.

mod errors;
mod launch;
mod shutdown;

pub use self::errors::LaunchError;
pub use self::launch::{LaunchPlan, run_daemon, run_daemon_with};
pub use self::shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};

pub(crate) const PROCESS_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::process");

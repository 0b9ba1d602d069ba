//! Defines the unified error surface for daemon launch and supervision.

use std::io;

use thiserror::Error;

use crate::bootstrap::BootstrapError;
use crate::dispatch::RouteError;
use crate::events::BridgeError;
use crate::transport::ListenerError;

use super::shutdown::ShutdownError;

/// Errors surfaced while launching or supervising the daemon process.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Bootstrapping the daemon failed.
    #[error("daemon bootstrap failed: {source}")]
    Bootstrap {
        /// Underlying bootstrap error.
        #[source]
        source: BootstrapError,
    },
    /// The worker pool could not be started.
    #[error("failed to start worker pool: {source}")]
    Runtime {
        /// Underlying IO error.
        #[source]
        source: io::Error,
    },
    /// The route table could not be built.
    #[error("failed to build route table: {source}")]
    Routes {
        /// Underlying route error.
        #[source]
        source: RouteError,
    },
    /// The lifecycle bridge failed to start or stop.
    #[error("lifecycle bridge failed: {source}")]
    Bridge {
        /// Underlying bridge error.
        #[source]
        source: BridgeError,
    },
    /// Socket listener startup failed.
    #[error("daemon socket listener failed: {source}")]
    Listener {
        /// Underlying listener error.
        #[source]
        source: ListenerError,
    },
    /// Waiting for shutdown failed.
    #[error("failed to await shutdown signal: {source}")]
    Shutdown {
        /// Underlying shutdown error.
        #[source]
        source: ShutdownError,
    },
}

impl From<BootstrapError> for LaunchError {
    fn from(source: BootstrapError) -> Self {
        Self::Bootstrap { source }
    }
}

impl From<RouteError> for LaunchError {
    fn from(source: RouteError) -> Self {
        Self::Routes { source }
    }
}

impl From<BridgeError> for LaunchError {
    fn from(source: BridgeError) -> Self {
        Self::Bridge { source }
    }
}

impl From<ListenerError> for LaunchError {
    fn from(source: ListenerError) -> Self {
        Self::Listener { source }
    }
}

impl From<ShutdownError> for LaunchError {
    fn from(source: ShutdownError) -> Self {
        Self::Shutdown { source }
    }
}

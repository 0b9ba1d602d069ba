//! Lifecycle bridge failures.

use std::io;

use thiserror::Error;

use crate::hypervisor::HypervisorError;

/// Errors starting or stopping the lifecycle bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The hypervisor refused to install its event loop.
    #[error("failed to register the hypervisor event loop: {source}")]
    Register {
        #[source]
        source: HypervisorError,
    },
    /// The bridge thread could not be spawned.
    #[error("failed to spawn the lifecycle event thread: {source}")]
    Spawn {
        #[source]
        source: io::Error,
    },
    /// The bridge thread panicked.
    #[error("lifecycle event thread panicked")]
    ThreadPanic,
}

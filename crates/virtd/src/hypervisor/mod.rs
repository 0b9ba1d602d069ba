//! Hypervisor binding seam and the per-user connection cache built on it.
//!
//! Everything the daemon asks of the hypervisor goes through the three traits
//! in this module. [`memory::MemoryHypervisor`] implements them in-process;
//! the `libvirt` feature adds a binding over the libvirt client library.
//! All calls are blocking and fallible, so callers run them off the reactor
//! threads and map failures onto HTTP responses at the router boundary.

mod connection;
mod domain;
#[cfg(feature = "libvirt")]
pub mod libvirt;
pub mod memory;
mod pool;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use strum::Display;
use thiserror::Error;

pub use self::connection::HypervisorConnection;
pub use self::domain::{Domain, DomainSnapshot};
pub use self::pool::{ConnectionPool, ReconnectListener};

const POOL_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::pool");

/// Entry point into a hypervisor client library.
pub trait Hypervisor: Send + Sync {
    /// Opens a new session against `uri`.
    fn open(&self, uri: &str) -> Result<Arc<dyn Session>, HypervisorError>;

    /// Installs the library's default event loop implementation.
    ///
    /// Must be called once before any session registers event callbacks.
    fn register_event_loop(&self, poll_interval: Duration) -> Result<(), HypervisorError>;

    /// Runs one iteration of the default event loop, dispatching any pending
    /// callbacks on the calling thread.
    fn run_event_iteration(&self) -> Result<(), HypervisorError>;
}

/// Callback invoked for each domain lifecycle event.
pub type LifecycleCallback = Arc<dyn Fn(LifecycleEvent) + Send + Sync>;

/// An open session against one hypervisor URI.
pub trait Session: Send + Sync {
    /// URI the session was opened with.
    fn uri(&self) -> &str;

    /// Returns `false` once the session has been closed or the remote end has
    /// gone away.
    fn is_alive(&self) -> bool;

    /// Lists every domain, active or not.
    fn list_domains(&self) -> Result<Vec<Box<dyn DomainHandle>>, HypervisorError>;

    /// Looks up a domain by name; `Ok(None)` when no such domain exists.
    fn lookup_domain(&self, name: &str) -> Result<Option<Box<dyn DomainHandle>>, HypervisorError>;

    /// Registers a lifecycle callback for every domain on this session.
    fn register_lifecycle(&self, callback: LifecycleCallback)
    -> Result<CallbackId, HypervisorError>;

    /// Removes a callback previously returned by
    /// [`Session::register_lifecycle`].
    fn deregister(&self, id: CallbackId) -> Result<(), HypervisorError>;

    /// Closes the session. Further calls fail.
    fn close(&self) -> Result<(), HypervisorError>;
}

/// Handle to one domain within a session.
pub trait DomainHandle: Send + Sync {
    /// Runtime id; `None` while the domain is inactive.
    fn id(&self) -> Option<u32>;
    /// Domain name.
    fn name(&self) -> Result<String, HypervisorError>;
    /// Domain UUID in its canonical string form.
    fn uuid(&self) -> Result<String, HypervisorError>;
    /// Current run state.
    fn state(&self) -> Result<DomainState, HypervisorError>;
    /// Whether the domain starts with the host.
    fn autostart(&self) -> Result<bool, HypervisorError>;
    /// Enables or disables autostart.
    fn set_autostart(&self, enabled: bool) -> Result<(), HypervisorError>;
    /// Reads the description metadata; `Ok(None)` when unset.
    fn metadata(&self) -> Result<Option<String>, HypervisorError>;
    /// Replaces the description metadata.
    fn set_metadata(&self, value: &str) -> Result<(), HypervisorError>;
    /// Full XML description.
    fn xml_description(&self) -> Result<String, HypervisorError>;
    /// Size information for one block device, named by target or source path.
    fn block_info(&self, disk: &str) -> Result<BlockInfo, HypervisorError>;
    /// Boots an inactive domain.
    fn create(&self) -> Result<(), HypervisorError>;
    /// Asks the guest to shut down; returns before it has done so.
    fn shutdown(&self) -> Result<(), HypervisorError>;
}

/// Opaque identifier for a registered event callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub i32);

/// Domain run states, numbered as the libvirt client library numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum DomainState {
    NoState,
    Running,
    Blocked,
    Paused,
    Shutdown,
    Shutoff,
    Crashed,
    PmSuspended,
}

impl DomainState {
    /// Maps a raw library state code; unknown codes collapse to `NoState`.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => Self::Running,
            2 => Self::Blocked,
            3 => Self::Paused,
            4 => Self::Shutdown,
            5 => Self::Shutoff,
            6 => Self::Crashed,
            7 => Self::PmSuspended,
            _ => Self::NoState,
        }
    }

    /// True for the states a shutdown request waits for.
    #[must_use]
    pub fn is_down(self) -> bool {
        matches!(self, Self::Shutdown | Self::Shutoff)
    }
}

/// Domain lifecycle event kinds, numbered as the library numbers them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LifecycleKind {
    Defined,
    Undefined,
    Started,
    Suspended,
    Resumed,
    Stopped,
    Shutdown,
    PmSuspended,
    Crashed,
    Unknown,
}

impl LifecycleKind {
    /// Maps a raw library event code.
    #[must_use]
    pub fn from_code(code: i32) -> Self {
        match code {
            0 => Self::Defined,
            1 => Self::Undefined,
            2 => Self::Started,
            3 => Self::Suspended,
            4 => Self::Resumed,
            5 => Self::Stopped,
            6 => Self::Shutdown,
            7 => Self::PmSuspended,
            8 => Self::Crashed,
            _ => Self::Unknown,
        }
    }
}

/// A lifecycle callback invocation.
pub struct LifecycleEvent {
    /// Domain the event concerns.
    pub domain: Box<dyn DomainHandle>,
    /// What happened.
    pub kind: LifecycleKind,
    /// Kind-specific detail code.
    pub detail: i32,
}

/// Block device sizes in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BlockInfo {
    /// Logical size as seen by the guest.
    pub capacity: u64,
    /// Host storage currently allocated.
    pub allocation: u64,
    /// Host storage backing the device.
    pub physical: u64,
}

/// Failures reported by the hypervisor binding.
#[derive(Debug, Clone, Error)]
pub enum HypervisorError {
    /// A library call returned an error.
    #[error("{operation} failed: {message}")]
    Call {
        /// Library operation that failed.
        operation: &'static str,
        /// Message reported by the library.
        message: String,
    },
    /// A connection that is already live was asked to connect again.
    #[error("hypervisor connection to '{uri}' is already established")]
    AlreadyConnected {
        /// URI of the live session.
        uri: String,
    },
    /// An operation needed a session but none is open.
    #[error("no open hypervisor session for '{uri}'")]
    NotConnected {
        /// URI of the missing session.
        uri: String,
    },
    /// A domain did not reach a shutdown state within its budget.
    #[error("Shutdown operation timed out")]
    ShutdownTimeout {
        /// Budget that elapsed.
        timeout: Duration,
    },
    /// This build lacks the requested binding.
    #[error("hypervisor backend '{backend}' is not available in this build")]
    Unavailable {
        /// Backend that was requested.
        backend: String,
    },
}

impl HypervisorError {
    /// Creates a library call error.
    pub fn call(operation: &'static str, message: impl Into<String>) -> Self {
        Self::Call {
            operation,
            message: message.into(),
        }
    }
}

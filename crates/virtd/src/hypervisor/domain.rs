//! Domain handle wrapper with snapshotting and polled shutdown.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use super::{BlockInfo, DomainHandle, DomainState, HypervisorError};

/// JSON view of a domain at one instant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DomainSnapshot {
    /// Runtime id, absent while inactive.
    pub id: Option<u32>,
    /// Domain name.
    pub name: String,
    /// Canonical UUID.
    pub uuid: String,
    /// Run state.
    pub state: DomainState,
    /// Whether the domain starts with the host.
    pub autostart: bool,
}

/// One virtual machine within a hypervisor session.
pub struct Domain {
    handle: Box<dyn DomainHandle>,
}

impl Domain {
    /// Wraps a binding handle.
    #[must_use]
    pub fn new(handle: Box<dyn DomainHandle>) -> Self {
        Self { handle }
    }

    /// Runtime id.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.handle.id()
    }

    /// Domain name.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn name(&self) -> Result<String, HypervisorError> {
        self.handle.name()
    }

    /// Run state.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn state(&self) -> Result<DomainState, HypervisorError> {
        self.handle.state()
    }

    /// Captures id, name, uuid, state and autostart.
    ///
    /// # Errors
    ///
    /// Propagates the first binding failure.
    pub fn snapshot(&self) -> Result<DomainSnapshot, HypervisorError> {
        Ok(DomainSnapshot {
            id: self.handle.id(),
            name: self.handle.name()?,
            uuid: self.handle.uuid()?,
            state: self.handle.state()?,
            autostart: self.handle.autostart()?,
        })
    }

    /// Reads the description metadata.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn metadata(&self) -> Result<Option<String>, HypervisorError> {
        self.handle.metadata()
    }

    /// Replaces the description metadata.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn set_metadata(&self, value: &str) -> Result<(), HypervisorError> {
        self.handle.set_metadata(value)
    }

    /// Enables or disables autostart.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn set_autostart(&self, enabled: bool) -> Result<(), HypervisorError> {
        self.handle.set_autostart(enabled)
    }

    /// Full XML description.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn xml_description(&self) -> Result<String, HypervisorError> {
        self.handle.xml_description()
    }

    /// Block device sizes.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn block_info(&self, disk: &str) -> Result<BlockInfo, HypervisorError> {
        self.handle.block_info(disk)
    }

    /// Boots the domain.
    ///
    /// # Errors
    ///
    /// Propagates binding failures.
    pub fn start(&self) -> Result<(), HypervisorError> {
        self.handle.create()
    }

    /// Requests a guest shutdown and polls until the domain reports a
    /// shutdown or shutoff state.
    ///
    /// Blocks the calling thread for up to `timeout`; run it off the reactor.
    /// A budget too large to represent as an [`Instant`] never elapses.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::ShutdownTimeout`] when the budget elapses
    /// first, or any binding failure.
    pub fn shutdown(
        &self,
        timeout: Duration,
        poll_interval: Duration,
    ) -> Result<DomainState, HypervisorError> {
        let deadline = Instant::now().checked_add(timeout);
        self.handle.shutdown()?;
        loop {
            let state = self.handle.state()?;
            if state.is_down() {
                return Ok(state);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(HypervisorError::ShutdownTimeout { timeout });
                    }
                    poll_interval.min(deadline - now)
                }
                None => poll_interval,
            };
            thread::sleep(pause);
        }
    }
}

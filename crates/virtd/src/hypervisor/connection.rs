//! One user's hypervisor session, held open across requests.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use tracing::warn;

use crate::health::HealthReporter;

use super::{Hypervisor, HypervisorError, POOL_TARGET, Session};

/// Hypervisor session for exactly one OS user.
///
/// A connection is either live or stale. Stale covers both "never connected"
/// and "connected once, since lost". [`HypervisorConnection::connect`] refuses
/// to run against a live session; only [`HypervisorConnection::reconnect`]
/// replaces one, and the pool calls it only after observing staleness.
pub struct HypervisorConnection {
    user: String,
    uri: String,
    hypervisor: Arc<dyn Hypervisor>,
    reporter: Arc<dyn HealthReporter>,
    session: Mutex<Option<Arc<dyn Session>>>,
}

impl HypervisorConnection {
    /// Creates an unconnected entry for `user` at `uri`.
    pub fn new(
        user: impl Into<String>,
        uri: impl Into<String>,
        hypervisor: Arc<dyn Hypervisor>,
        reporter: Arc<dyn HealthReporter>,
    ) -> Self {
        Self {
            user: user.into(),
            uri: uri.into(),
            hypervisor,
            reporter,
            session: Mutex::new(None),
        }
    }

    /// User that owns the session.
    #[must_use]
    pub fn user(&self) -> &str {
        &self.user
    }

    /// URI the session connects to.
    #[must_use]
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// True while a session is open and alive.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|session| session.is_alive())
    }

    /// Returns the live session, if any.
    #[must_use]
    pub fn session(&self) -> Option<Arc<dyn Session>> {
        self.lock()
            .as_ref()
            .filter(|session| session.is_alive())
            .map(Arc::clone)
    }

    /// Opens the session.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::AlreadyConnected`] when a live session is
    /// already held; that is a caller bug, not a runtime condition. Otherwise
    /// returns whatever the binding reports for the open call.
    pub fn connect(&self) -> Result<(), HypervisorError> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|session| session.is_alive()) {
            let error = HypervisorError::AlreadyConnected {
                uri: self.uri.clone(),
            };
            warn!(
                target: POOL_TARGET,
                user = %self.user,
                uri = %self.uri,
                "refusing to connect an already connected session"
            );
            return Err(error);
        }
        self.open_into(&mut slot)
    }

    /// Drops a stale session, if one is held, and opens a fresh one.
    ///
    /// # Errors
    ///
    /// Returns the binding's error for the open call.
    pub fn reconnect(&self) -> Result<(), HypervisorError> {
        let mut slot = self.lock();
        if slot.as_ref().is_some_and(|session| session.is_alive()) {
            return Ok(());
        }
        if let Some(stale) = slot.take()
            && let Err(error) = stale.close()
        {
            warn!(
                target: POOL_TARGET,
                user = %self.user,
                uri = %self.uri,
                %error,
                "failed to close stale session"
            );
        }
        self.open_into(&mut slot)
    }

    /// Closes the session, if one is held.
    pub fn close(&self) {
        if let Some(session) = self.lock().take()
            && let Err(error) = session.close()
        {
            warn!(
                target: POOL_TARGET,
                user = %self.user,
                uri = %self.uri,
                %error,
                "failed to close session"
            );
        }
    }

    fn open_into(&self, slot: &mut Option<Arc<dyn Session>>) -> Result<(), HypervisorError> {
        self.reporter.hypervisor_connecting(&self.user, &self.uri);
        let started = Instant::now();
        match self.hypervisor.open(&self.uri) {
            Ok(session) => {
                *slot = Some(session);
                self.reporter
                    .hypervisor_connected(&self.user, &self.uri, started.elapsed());
                Ok(())
            }
            Err(error) => {
                *slot = None;
                self.reporter.hypervisor_connect_failed(
                    &self.user,
                    &self.uri,
                    started.elapsed(),
                    &error,
                );
                Err(error)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Arc<dyn Session>>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for HypervisorConnection {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("HypervisorConnection")
            .field("user", &self.user)
            .field("uri", &self.uri)
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

//! Test double for [`HealthReporter`] that records structured events for assertions.

use std::sync::Mutex;
use std::time::Duration;

use camino::Utf8Path;

use virtd_config::Config;

use crate::bootstrap::BootstrapError;
use crate::health::HealthReporter;
use crate::hypervisor::HypervisorError;

/// Structured health events tracked during scenarios.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum HealthEvent {
    /// Bootstrap started.
    BootstrapStarting,
    /// Bootstrap completed successfully.
    BootstrapSucceeded,
    /// Bootstrap failed with an error description.
    BootstrapFailed(String),
    /// The socket is accepting connections.
    ListenerReady,
    /// A session open started for the named user.
    HypervisorConnecting(String),
    /// A session opened for the named user.
    HypervisorConnected(String),
    /// A session open failed for the named user.
    HypervisorConnectFailed(String),
    /// Teardown began.
    ShutdownStarting,
}

/// Records health events for assertions.
#[derive(Debug, Default)]
pub struct RecordingHealthReporter {
    events: Mutex<Vec<HealthEvent>>,
}

impl RecordingHealthReporter {
    /// Captures a copy of the recorded events.
    #[must_use]
    pub fn events(&self) -> Vec<HealthEvent> {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .clone()
    }

    fn record(&self, event: HealthEvent) {
        self.events
            .lock()
            .expect("health reporter mutex poisoned")
            .push(event);
    }
}

impl HealthReporter for RecordingHealthReporter {
    fn bootstrap_starting(&self) {
        self.record(HealthEvent::BootstrapStarting);
    }

    fn bootstrap_succeeded(&self, _config: &Config) {
        self.record(HealthEvent::BootstrapSucceeded);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        self.record(HealthEvent::BootstrapFailed(error.to_string()));
    }

    fn listener_ready(&self, _socket: &Utf8Path) {
        self.record(HealthEvent::ListenerReady);
    }

    fn hypervisor_connecting(&self, user: &str, _uri: &str) {
        self.record(HealthEvent::HypervisorConnecting(user.to_owned()));
    }

    fn hypervisor_connected(&self, user: &str, _uri: &str, _elapsed: Duration) {
        self.record(HealthEvent::HypervisorConnected(user.to_owned()));
    }

    fn hypervisor_connect_failed(
        &self,
        user: &str,
        _uri: &str,
        _elapsed: Duration,
        _error: &HypervisorError,
    ) {
        self.record(HealthEvent::HypervisorConnectFailed(user.to_owned()));
    }

    fn shutdown_starting(&self) {
        self.record(HealthEvent::ShutdownStarting);
    }
}

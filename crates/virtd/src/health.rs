//! Structured health reporting for daemon lifecycle events.

use std::sync::Arc;
use std::time::Duration;

use camino::Utf8Path;
use tracing::{debug, error, info, warn};

use virtd_config::Config;

use crate::bootstrap::BootstrapError;
use crate::hypervisor::HypervisorError;

const HEALTH_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::health");

/// Observer trait used to surface lifecycle events to telemetry sinks.
pub trait HealthReporter: Send + Sync {
    /// Invoked before configuration loading begins.
    fn bootstrap_starting(&self);

    /// Invoked after bootstrap completes successfully.
    fn bootstrap_succeeded(&self, config: &Config);

    /// Invoked when bootstrap fails.
    fn bootstrap_failed(&self, error: &BootstrapError);

    /// Invoked once the HTTP listener accepts connections.
    fn listener_ready(&self, socket: &Utf8Path);

    /// Invoked before a hypervisor session is opened for `user`.
    fn hypervisor_connecting(&self, user: &str, uri: &str);

    /// Invoked after a hypervisor session opens.
    fn hypervisor_connected(&self, user: &str, uri: &str, elapsed: Duration);

    /// Invoked when a hypervisor session fails to open.
    fn hypervisor_connect_failed(
        &self,
        user: &str,
        uri: &str,
        elapsed: Duration,
        error: &HypervisorError,
    );

    /// Invoked when the shutdown sequence begins.
    fn shutdown_starting(&self);
}

impl<T> HealthReporter for Arc<T>
where
    T: HealthReporter,
{
    fn bootstrap_starting(&self) {
        (**self).bootstrap_starting();
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        (**self).bootstrap_succeeded(config);
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        (**self).bootstrap_failed(error);
    }

    fn listener_ready(&self, socket: &Utf8Path) {
        (**self).listener_ready(socket);
    }

    fn hypervisor_connecting(&self, user: &str, uri: &str) {
        (**self).hypervisor_connecting(user, uri);
    }

    fn hypervisor_connected(&self, user: &str, uri: &str, elapsed: Duration) {
        (**self).hypervisor_connected(user, uri, elapsed);
    }

    fn hypervisor_connect_failed(
        &self,
        user: &str,
        uri: &str,
        elapsed: Duration,
        error: &HypervisorError,
    ) {
        (**self).hypervisor_connect_failed(user, uri, elapsed, error);
    }

    fn shutdown_starting(&self) {
        (**self).shutdown_starting();
    }
}

/// Default reporter that records lifecycle events using `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StructuredHealthReporter;

impl StructuredHealthReporter {
    /// Builds a new reporter.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl HealthReporter for StructuredHealthReporter {
    fn bootstrap_starting(&self) {
        info!(
            target: HEALTH_TARGET,
            event = "bootstrap_starting",
            "starting daemon bootstrap"
        );
    }

    fn bootstrap_succeeded(&self, config: &Config) {
        info!(
            target: HEALTH_TARGET,
            event = "bootstrap_succeeded",
            socket = %config.socket_path(),
            log_filter = %config.log_filter(),
            log_format = %config.log_format(),
            backend = %config.backend,
            workers = config.workers,
            "daemon bootstrap completed"
        );
    }

    fn bootstrap_failed(&self, error: &BootstrapError) {
        error!(
            target: HEALTH_TARGET,
            event = "bootstrap_failed",
            error = %error,
            "daemon bootstrap failed"
        );
    }

    fn listener_ready(&self, socket: &Utf8Path) {
        info!(
            target: HEALTH_TARGET,
            event = "listener_ready",
            socket = %socket,
            "accepting connections"
        );
    }

    fn hypervisor_connecting(&self, user: &str, uri: &str) {
        debug!(
            target: HEALTH_TARGET,
            event = "hypervisor_connecting",
            user,
            uri,
            "connecting to hypervisor"
        );
    }

    fn hypervisor_connected(&self, user: &str, uri: &str, elapsed: Duration) {
        debug!(
            target: HEALTH_TARGET,
            event = "hypervisor_connected",
            user,
            uri,
            elapsed_ms = elapsed.as_millis(),
            "hypervisor connection established"
        );
    }

    fn hypervisor_connect_failed(
        &self,
        user: &str,
        uri: &str,
        elapsed: Duration,
        error: &HypervisorError,
    ) {
        warn!(
            target: HEALTH_TARGET,
            event = "hypervisor_connect_failed",
            user,
            uri,
            elapsed_ms = elapsed.as_millis(),
            error = %error,
            "hypervisor connection failed"
        );
    }

    fn shutdown_starting(&self) {
        info!(
            target: HEALTH_TARGET,
            event = "shutdown_starting",
            "stopping daemon"
        );
    }
}

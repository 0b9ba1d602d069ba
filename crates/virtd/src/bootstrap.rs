//! Daemon bootstrap orchestration.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use virtd_config::{Config, ConfigError, HypervisorBackend, SocketPreparationError};

use crate::health::HealthReporter;
use crate::hypervisor::memory::MemoryHypervisor;
use crate::hypervisor::{Hypervisor, HypervisorError};
use crate::telemetry::{self, TelemetryError, TelemetryHandle};

/// Trait abstracting configuration loading for testability.
pub trait ConfigLoader: Send + Sync {
    /// Loads the daemon configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the sources cannot be read or combined.
    fn load(&self) -> Result<Config, ConfigError>;
}

/// Loader that delegates to [`Config::resolve`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemConfigLoader;

impl ConfigLoader for SystemConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::resolve()
    }
}

/// Loader that hands out a configuration resolved earlier.
#[derive(Debug, Clone)]
pub struct StaticConfigLoader {
    config: Config,
}

impl StaticConfigLoader {
    /// Wraps `config`.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self { config }
    }
}

impl ConfigLoader for StaticConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config.clone())
    }
}

/// Builds the hypervisor binding named by the configuration.
pub trait HypervisorFactory: Send + Sync {
    /// Returns the binding for `backend`.
    ///
    /// # Errors
    ///
    /// Returns [`HypervisorError::Unavailable`] when this build cannot provide
    /// it.
    fn create(&self, backend: HypervisorBackend) -> Result<Arc<dyn Hypervisor>, HypervisorError>;
}

/// Factory for the bindings compiled into this build.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemHypervisorFactory;

impl HypervisorFactory for SystemHypervisorFactory {
    fn create(&self, backend: HypervisorBackend) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
        match backend {
            HypervisorBackend::Memory => Ok(Arc::new(MemoryHypervisor::new())),
            #[cfg(feature = "libvirt")]
            HypervisorBackend::Libvirt => Ok(Arc::new(
                crate::hypervisor::libvirt::LibvirtHypervisor::new(),
            )),
            #[cfg(not(feature = "libvirt"))]
            HypervisorBackend::Libvirt => Err(HypervisorError::Unavailable {
                backend: backend.to_string(),
            }),
        }
    }
}

/// Factory that returns one prepared binding whatever the configuration says.
#[derive(Clone)]
pub struct StaticHypervisorFactory {
    hypervisor: Arc<dyn Hypervisor>,
}

impl StaticHypervisorFactory {
    /// Wraps `hypervisor`.
    #[must_use]
    pub fn new(hypervisor: Arc<dyn Hypervisor>) -> Self {
        Self { hypervisor }
    }
}

impl HypervisorFactory for StaticHypervisorFactory {
    fn create(&self, _backend: HypervisorBackend) -> Result<Arc<dyn Hypervisor>, HypervisorError> {
        Ok(Arc::clone(&self.hypervisor))
    }
}

/// Errors surfaced during bootstrap.
#[derive(Debug, Error)]
pub enum BootstrapError {
    /// Configuration failed to load.
    #[error("failed to load configuration: {source}")]
    Configuration {
        /// Underlying loader error.
        #[source]
        source: ConfigError,
    },
    /// Telemetry initialisation failed.
    #[error("failed to initialise telemetry: {source}")]
    Telemetry {
        /// Underlying telemetry error.
        #[source]
        source: TelemetryError,
    },
    /// Socket preparation failed.
    #[error("failed to prepare daemon socket: {source}")]
    Socket {
        /// Filesystem error reported while preparing the socket directory.
        #[source]
        source: SocketPreparationError,
    },
    /// The configured hypervisor binding could not be created.
    #[error("failed to initialise hypervisor binding: {source}")]
    Hypervisor {
        /// Underlying binding error.
        #[source]
        source: HypervisorError,
    },
}

/// Result of a successful bootstrap invocation.
pub struct Daemon {
    config: Config,
    telemetry: TelemetryHandle,
    hypervisor: Arc<dyn Hypervisor>,
    reporter: Arc<dyn HealthReporter>,
}

impl Daemon {
    /// Accessor for the resolved configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Accessor for the telemetry handle, primarily useful for testing.
    #[must_use]
    pub fn telemetry(&self) -> TelemetryHandle {
        self.telemetry
    }

    /// The hypervisor binding selected by the configuration.
    #[must_use]
    pub fn hypervisor(&self) -> &Arc<dyn Hypervisor> {
        &self.hypervisor
    }

    /// The reporter bootstrap ran with.
    #[must_use]
    pub fn reporter(&self) -> &Arc<dyn HealthReporter> {
        &self.reporter
    }
}

impl fmt::Debug for Daemon {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Daemon")
            .field("config", &self.config)
            .field("telemetry", &self.telemetry)
            .finish_non_exhaustive()
    }
}

/// Bootstraps the daemon using the supplied collaborators: loads the
/// configuration, installs telemetry, prepares the socket directory and
/// creates the hypervisor binding.
///
/// # Errors
///
/// Returns the first stage's failure, after reporting it.
pub fn bootstrap_with(
    loader: &dyn ConfigLoader,
    reporter: Arc<dyn HealthReporter>,
    factory: &dyn HypervisorFactory,
) -> Result<Daemon, BootstrapError> {
    reporter.bootstrap_starting();

    let config = match loader.load() {
        Ok(config) => config,
        Err(source) => {
            let error = BootstrapError::Configuration { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    let telemetry = match telemetry::initialise(&config) {
        Ok(handle) => handle,
        Err(source) => {
            let error = BootstrapError::Telemetry { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    if let Err(source) = config.prepare_socket_directory() {
        let error = BootstrapError::Socket { source };
        reporter.bootstrap_failed(&error);
        return Err(error);
    }

    let hypervisor = match factory.create(config.backend) {
        Ok(hypervisor) => hypervisor,
        Err(source) => {
            let error = BootstrapError::Hypervisor { source };
            reporter.bootstrap_failed(&error);
            return Err(error);
        }
    };

    reporter.bootstrap_succeeded(&config);
    Ok(Daemon {
        config,
        telemetry,
        hypervisor,
        reporter,
    })
}

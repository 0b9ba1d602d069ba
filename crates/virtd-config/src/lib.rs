//! Shared configuration for the virtd daemon.
//!
//! Values are layered by `ortho_config`, lowest precedence first: built-in
//! defaults, an optional TOML file named with `--config-path`, `VIRTD_*`
//! environment variables, and command-line flags. The resulting [`Config`] is immutable and handed to the daemon at
//! bootstrap; nothing reads configuration from global state afterwards.

mod defaults;
mod logging;
mod socket;

use std::ffi::OsString;
use std::sync::Arc;
use std::time::Duration;

use camino::{Utf8Path, Utf8PathBuf};
use ortho_config::{OrthoConfig, OrthoError};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use defaults::{
    DEFAULT_EVENT_POLL_MS, DEFAULT_IDLE_TIMEOUT_MS, DEFAULT_LOG_FILTER, DEFAULT_RETRIES,
    DEFAULT_ROOT_USER, DEFAULT_SESSION_URI, DEFAULT_SHUTDOWN_POLL_MS,
    DEFAULT_SHUTDOWN_TIMEOUT_SECS, DEFAULT_SYSTEM_URI, DEFAULT_WORKERS, default_log_filter,
    default_socket_path,
};
pub use logging::{EnumParseError, HypervisorBackend, LogFormat};
pub use socket::{SocketPreparationError, prepare_socket_directory};

/// Resolved daemon configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, OrthoConfig)]
#[ortho_config(prefix = "VIRTD")]
#[serde(default)]
pub struct Config {
    /// Filesystem path of the listening Unix socket.
    pub socket_path: Utf8PathBuf,
    /// `tracing` filter expression.
    pub log_filter: String,
    /// Log output format.
    #[ortho_config(cli_short = 'f')]
    pub log_format: LogFormat,
    /// Worker threads driving the shared reactor.
    pub workers: usize,
    /// Retry budget for transient handler failures.
    pub retries: usize,
    /// Idle deadline for HTTP connections, in milliseconds.
    pub idle_timeout_ms: u64,
    /// Domain shutdown budget, in seconds.
    #[ortho_config(cli_short = 't')]
    pub shutdown_timeout_secs: u64,
    /// Domain shutdown polling interval, in milliseconds.
    #[ortho_config(cli_short = 'p')]
    pub shutdown_poll_ms: u64,
    /// Hypervisor event loop poll interval, in milliseconds.
    pub event_poll_ms: u64,
    /// Hypervisor binding.
    pub backend: HypervisorBackend,
    /// Account mapped onto [`Config::system_uri`].
    #[ortho_config(cli_short = 'u')]
    pub root_user: String,
    /// Privileged local hypervisor URI.
    #[ortho_config(cli_short = 'y')]
    pub system_uri: String,
    /// Per-user hypervisor URI template; `{user}` is substituted.
    #[ortho_config(cli_short = 'n')]
    pub session_uri: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            log_filter: default_log_filter(),
            log_format: LogFormat::default(),
            workers: defaults::default_workers(),
            retries: defaults::default_retries(),
            idle_timeout_ms: defaults::default_idle_timeout_ms(),
            shutdown_timeout_secs: defaults::default_shutdown_timeout_secs(),
            shutdown_poll_ms: defaults::default_shutdown_poll_ms(),
            event_poll_ms: defaults::default_event_poll_ms(),
            backend: HypervisorBackend::default(),
            root_user: defaults::default_root_user(),
            system_uri: defaults::default_system_uri(),
            session_uri: defaults::default_session_uri(),
        }
    }
}

/// Errors raised while assembling the configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A layer could not be read or merged, or a flag was rejected.
    #[error("{0}")]
    Load(#[from] Arc<OrthoError>),
    /// A value is syntactically valid but unusable.
    #[error("invalid configuration: {message}")]
    Invalid {
        /// Description of the offending value.
        message: String,
    },
}

impl Config {
    /// Resolves the configuration from the process arguments and environment.
    ///
    /// # Errors
    ///
    /// See [`Config::resolve_from_iter`].
    pub fn resolve() -> Result<Self, ConfigError> {
        Self::resolve_from_iter(std::env::args_os())
    }

    /// Resolves the configuration from an explicit argument list.
    ///
    /// The first item is the program name, as with [`std::env::args_os`].
    /// The file named by `--config-path` (or `VIRTD_CONFIG_PATH`) and the
    /// `VIRTD_*` environment are layered beneath the flags.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Load`] when a layer is rejected and
    /// [`ConfigError::Invalid`] when a resolved value is unusable.
    pub fn resolve_from_iter<I, T>(args: I) -> Result<Self, ConfigError>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let config = Self::load_from_iter(args)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.shutdown_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                message: String::from("shutdown_poll_ms must be greater than zero"),
            });
        }
        if self.idle_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                message: String::from("idle_timeout_ms must be greater than zero"),
            });
        }
        if self.shutdown_timeout_secs == 0 {
            return Err(ConfigError::Invalid {
                message: String::from("shutdown_timeout_secs must be greater than zero"),
            });
        }
        if self.event_poll_ms == 0 {
            return Err(ConfigError::Invalid {
                message: String::from("event_poll_ms must be greater than zero"),
            });
        }
        if self.socket_path.as_str().is_empty() {
            return Err(ConfigError::Invalid {
                message: String::from("socket_path must not be empty"),
            });
        }
        Ok(())
    }

    /// Path of the listening Unix socket.
    #[must_use]
    pub fn socket_path(&self) -> &Utf8Path {
        self.socket_path.as_path()
    }

    /// `tracing` filter expression.
    #[must_use]
    pub fn log_filter(&self) -> &str {
        self.log_filter.as_str()
    }

    /// Log output format.
    #[must_use]
    pub fn log_format(&self) -> LogFormat {
        self.log_format
    }

    /// Idle deadline for HTTP connections.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    /// Domain shutdown budget.
    #[must_use]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }

    /// Domain shutdown polling interval.
    #[must_use]
    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_millis(self.shutdown_poll_ms)
    }

    /// Hypervisor event loop poll interval.
    #[must_use]
    pub fn event_poll(&self) -> Duration {
        Duration::from_millis(self.event_poll_ms)
    }

    /// Creates the socket's parent directory.
    ///
    /// # Errors
    ///
    /// See [`prepare_socket_directory`].
    pub fn prepare_socket_directory(&self) -> Result<(), SocketPreparationError> {
        prepare_socket_directory(self.socket_path())
    }
}

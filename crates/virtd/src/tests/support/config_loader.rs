//! Test configuration loaders for scenarios covering success and failure paths.

use std::ffi::OsString;

use camino::{Utf8Path, Utf8PathBuf};
use tempfile::TempDir;

use virtd_config::{Config, ConfigError, HypervisorBackend};

use crate::bootstrap::ConfigLoader;

/// Loader that places the socket under a temporary directory and selects the
/// in-memory hypervisor with `test:///` URIs.
pub struct TestConfigLoader {
    _dir: TempDir,
    socket_path: Utf8PathBuf,
}

impl TestConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        let dir = TempDir::new().expect("failed to create temporary directory for socket");
        let socket_path = Utf8PathBuf::from_path_buf(dir.path().join("run").join("virtd.sock"))
            .expect("temporary socket path was not valid UTF-8");
        Self {
            _dir: dir,
            socket_path,
        }
    }

    pub fn socket_path(&self) -> &Utf8Path {
        &self.socket_path
    }

    /// Configuration this loader hands out.
    #[must_use]
    pub fn config(&self) -> Config {
        Config {
            socket_path: self.socket_path.clone(),
            workers: 2,
            idle_timeout_ms: 2_000,
            shutdown_timeout_secs: 1,
            shutdown_poll_ms: 10,
            event_poll_ms: 5,
            backend: HypervisorBackend::Memory,
            system_uri: "test:///system".to_owned(),
            session_uri: "test:///{user}".to_owned(),
            ..Config::default()
        }
    }
}

impl ConfigLoader for TestConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Ok(self.config())
    }
}

/// Loader that intentionally fails by passing an unknown backend.
pub struct FailingConfigLoader;

impl ConfigLoader for FailingConfigLoader {
    fn load(&self) -> Result<Config, ConfigError> {
        Config::resolve_from_iter([
            OsString::from("virtd"),
            OsString::from("--backend"),
            OsString::from("hyperv"),
        ])
    }
}

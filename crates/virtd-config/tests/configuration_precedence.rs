use std::ffi::OsString;
use std::fs;
use std::sync::{Mutex, MutexGuard, PoisonError};

use once_cell::sync::Lazy;
use rstest::{fixture, rstest};
use tempfile::TempDir;

use virtd_config::{Config, ConfigError, HypervisorBackend, LogFormat};

// Every load reads the process environment, so tests touching it serialise.
static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

struct Harness {
    temp_dir: TempDir,
    args: Vec<OsString>,
    env_overrides: Vec<(&'static str, Option<OsString>)>,
    _guard: MutexGuard<'static, ()>,
}

impl Harness {
    fn write_config(&mut self, contents: &str) {
        let path = self.temp_dir.path().join("virtd.toml");
        fs::write(&path, contents).expect("write configuration");
        self.args.push(OsString::from("--config-path"));
        self.args.push(path.into_os_string());
    }

    fn set_env(&mut self, key: &'static str, value: &str) {
        let previous = std::env::var_os(key);
        // Environment mutation is `unsafe` on newer toolchains; `Drop`
        // restores the previous value.
        unsafe { std::env::set_var(key, value) };
        self.env_overrides.push((key, previous));
    }

    fn push(&mut self, arg: &str) {
        self.args.push(OsString::from(arg));
    }

    fn load(&self) -> Result<Config, ConfigError> {
        Config::resolve_from_iter(self.args.clone())
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        while let Some((key, value)) = self.env_overrides.pop() {
            match value {
                Some(value) => unsafe { std::env::set_var(key, value) },
                None => unsafe { std::env::remove_var(key) },
            }
        }
    }
}

#[fixture]
fn harness() -> Harness {
    Harness {
        temp_dir: TempDir::new().expect("temp dir"),
        args: vec![OsString::from("virtd")],
        env_overrides: Vec::new(),
        _guard: ENV_MUTEX.lock().unwrap_or_else(PoisonError::into_inner),
    }
}

#[rstest]
fn defaults_apply_without_sources(harness: Harness) {
    let config = harness.load().expect("load defaults");
    assert_eq!(config, Config::default());
}

#[rstest]
fn file_values_override_defaults(mut harness: Harness) {
    harness.write_config(
        "socket_path = \"/run/virtd/api.sock\"\nretries = 2\nbackend = \"memory\"\n",
    );

    let config = harness.load().expect("load file");

    assert_eq!(config.socket_path().as_str(), "/run/virtd/api.sock");
    assert_eq!(config.retries, 2);
    assert_eq!(config.backend, HypervisorBackend::Memory);
    assert_eq!(config.workers, virtd_config::DEFAULT_WORKERS);
}

#[rstest]
fn environment_overrides_file(mut harness: Harness) {
    harness.write_config("socket_path = \"/run/virtd/file.sock\"\nworkers = 8\n");
    harness.set_env("VIRTD_SOCKET_PATH", "/run/virtd/env.sock");

    let config = harness.load().expect("load layered");

    assert_eq!(config.socket_path().as_str(), "/run/virtd/env.sock");
    assert_eq!(config.workers, 8);
}

#[rstest]
fn command_line_overrides_environment_and_file(mut harness: Harness) {
    harness.write_config("workers = 8\nlog_format = \"json\"\n");
    harness.set_env("VIRTD_WORKERS", "6");
    harness.push("--workers");
    harness.push("2");
    harness.push("--log-format");
    harness.push("compact");

    let config = harness.load().expect("load layered");

    assert_eq!(config.workers, 2);
    assert_eq!(config.log_format(), LogFormat::Compact);
}

#[rstest]
fn environment_names_the_configuration_file(mut harness: Harness) {
    let path = harness.temp_dir.path().join("from-env.toml");
    fs::write(&path, "retries = 3\n").expect("write configuration");
    let path = path.to_str().expect("utf-8 temp path").to_owned();
    harness.set_env("VIRTD_CONFIG_PATH", &path);

    let config = harness.load().expect("load env file");

    assert_eq!(config.retries, 3);
}

#[rstest]
fn malformed_file_is_reported(mut harness: Harness) {
    harness.write_config("workers = \"many\"\n");
    assert!(matches!(harness.load(), Err(ConfigError::Load(_))));
}

#[rstest]
fn invalid_backend_flag_is_rejected(mut harness: Harness) {
    harness.push("--backend");
    harness.push("xen");
    assert!(matches!(harness.load(), Err(ConfigError::Load(_))));
}

#[rstest]
fn zero_idle_timeout_from_environment_is_rejected(mut harness: Harness) {
    harness.set_env("VIRTD_IDLE_TIMEOUT_MS", "0");
    assert!(matches!(harness.load(), Err(ConfigError::Invalid { .. })));
}

use camino::Utf8PathBuf;
use std::env;

#[cfg(unix)]
use libc::geteuid;

#[cfg(unix)]
use dirs::runtime_dir;

/// Default log filter expression used by the daemon.
pub const DEFAULT_LOG_FILTER: &str = "info";

/// Worker threads driving the shared reactor, not counting the main thread.
pub const DEFAULT_WORKERS: usize = 4;

/// Retries granted to a handler that keeps failing transiently.
pub const DEFAULT_RETRIES: usize = 5;

/// Idle deadline applied to every HTTP connection.
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 60_000;

/// Budget for a domain to reach the shutdown or shutoff state.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 60;

/// Interval between domain state polls during shutdown.
pub const DEFAULT_SHUTDOWN_POLL_MS: u64 = 500;

/// Upper bound on one iteration of the hypervisor event loop.
pub const DEFAULT_EVENT_POLL_MS: u64 = 20;

/// Account that connects to the privileged system hypervisor.
pub const DEFAULT_ROOT_USER: &str = "root";

/// Hypervisor URI used for the root account.
pub const DEFAULT_SYSTEM_URI: &str = "qemu:///system";

/// Hypervisor URI template used for every other account.
pub const DEFAULT_SESSION_URI: &str = "qemu+ssh://{user}@localhost/session";

/// Owned log filter value used where allocation is required (e.g. serde).
pub fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_owned()
}

pub(crate) fn default_workers() -> usize {
    DEFAULT_WORKERS
}

pub(crate) fn default_retries() -> usize {
    DEFAULT_RETRIES
}

pub(crate) fn default_idle_timeout_ms() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

pub(crate) fn default_shutdown_timeout_secs() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_SECS
}

pub(crate) fn default_shutdown_poll_ms() -> u64 {
    DEFAULT_SHUTDOWN_POLL_MS
}

pub(crate) fn default_event_poll_ms() -> u64 {
    DEFAULT_EVENT_POLL_MS
}

pub(crate) fn default_root_user() -> String {
    DEFAULT_ROOT_USER.to_owned()
}

pub(crate) fn default_system_uri() -> String {
    DEFAULT_SYSTEM_URI.to_owned()
}

pub(crate) fn default_session_uri() -> String {
    DEFAULT_SESSION_URI.to_owned()
}

/// Computes the default socket path for the daemon.
pub fn default_socket_path() -> Utf8PathBuf {
    let (mut base, apply_namespace) = match runtime_base_directory() {
        Some(dir) => (dir, false),
        None => (fallback_base_directory(), true),
    };

    base.push("virtd");
    if apply_namespace {
        base.push(user_namespace());
    }

    base.join("virtd.sock")
}

#[cfg(unix)]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    runtime_dir().and_then(|path| Utf8PathBuf::from_path_buf(path).ok())
}

#[cfg(not(unix))]
fn runtime_base_directory() -> Option<Utf8PathBuf> {
    None
}

fn fallback_base_directory() -> Utf8PathBuf {
    let candidate = env::temp_dir();
    Utf8PathBuf::from_path_buf(candidate).unwrap_or_else(|_| Utf8PathBuf::from("/tmp"))
}

#[cfg(unix)]
fn user_namespace() -> String {
    let uid = unsafe { geteuid() };
    format!("uid-{uid}")
}

#[cfg(not(unix))]
fn user_namespace() -> String {
    String::from("uid-unknown")
}

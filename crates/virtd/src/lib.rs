//! Per-user hypervisor management daemon.
//!
//! `virtd` listens on a Unix socket and serves a small HTTP API over the
//! virtual machines of whichever OS user a request names. Each user gets one
//! lazily opened hypervisor session, cached for the life of the process and
//! reopened in place whenever it goes stale. Clients that upgrade the events
//! route to a WebSocket receive a JSON frame for every domain lifecycle change
//! on their user's hypervisor.
//!
//! The process runs one shared Tokio reactor on a fixed pool of worker
//! threads, plus one dedicated thread that drives the hypervisor's own event
//! loop. Hypervisor calls are blocking; request handlers run on Tokio's
//! blocking pool so they never stall the reactor.
//!
//! The hypervisor is reached only through the [`hypervisor::Hypervisor`]
//! trait. The in-memory binding is always available; the libvirt binding is
//! compiled in with the `libvirt` feature.

mod app;
mod bootstrap;
pub mod dispatch;
pub mod events;
mod health;
pub mod hypervisor;
mod process;
mod telemetry;
pub mod transport;
mod users;
pub mod websocket;
mod worker;

pub use app::{Application, Collaborators};
pub use bootstrap::{
    BootstrapError, ConfigLoader, Daemon, HypervisorFactory, StaticConfigLoader,
    StaticHypervisorFactory, SystemConfigLoader, SystemHypervisorFactory, bootstrap_with,
};
pub use health::{HealthReporter, StructuredHealthReporter};
pub use process::{
    LaunchError, LaunchPlan, ShutdownError, ShutdownSignal, SystemShutdownSignal, run_daemon,
    run_daemon_with,
};
pub use telemetry::{TelemetryError, TelemetryHandle};
pub use users::{StaticUserResolver, SystemUserResolver, UriRule, UserAccount, UserResolver};
pub use worker::WorkerPool;

#[cfg(test)]
mod tests;

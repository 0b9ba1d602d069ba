//! Test suites for the daemon.

mod bootstrap_behaviour;
mod daemon_behaviour;
pub(crate) mod support;

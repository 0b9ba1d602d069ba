//! Supervises daemon launch sequencing and runtime orchestration.

use std::sync::Arc;
use std::time::Duration;

use tokio::task;
use tracing::{info, warn};

use crate::app::{Application, Collaborators};
use crate::bootstrap::{
    ConfigLoader, HypervisorFactory, SystemConfigLoader, SystemHypervisorFactory, bootstrap_with,
};
use crate::health::{HealthReporter, StructuredHealthReporter};
use crate::transport::{ConnectionObserver, LoggingObserver, SocketListener};
use crate::users::{SystemUserResolver, UserResolver};
use crate::worker::WorkerPool;

use super::PROCESS_TARGET;
use super::errors::LaunchError;
use super::shutdown::{ShutdownError, ShutdownSignal, SystemShutdownSignal};

const WORKER_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Collaborators required to launch the daemon runtime.
pub struct LaunchPlan<L, S> {
    /// Configuration source.
    pub loader: L,
    /// Blocks until the daemon should stop.
    pub shutdown: S,
    /// Lifecycle event sink.
    pub reporter: Arc<dyn HealthReporter>,
    /// Hypervisor binding selection.
    pub factory: Arc<dyn HypervisorFactory>,
    /// OS account lookup.
    pub users: Arc<dyn UserResolver>,
    /// Per-connection terminal event sink.
    pub observer: Arc<dyn ConnectionObserver>,
}

/// Runs the daemon using the production collaborators.
///
/// # Errors
///
/// Returns [`LaunchError`] when any launch stage fails.
pub fn run_daemon() -> Result<(), LaunchError> {
    run_daemon_with(LaunchPlan {
        loader: SystemConfigLoader,
        shutdown: SystemShutdownSignal,
        reporter: Arc::new(StructuredHealthReporter::new()),
        factory: Arc::new(SystemHypervisorFactory),
        users: Arc::new(SystemUserResolver),
        observer: Arc::new(LoggingObserver),
    })
}

/// Runs the daemon with injected collaborators.
///
/// Bootstraps, starts the workers and the lifecycle bridge, binds the socket
/// and serves until `shutdown` returns. Teardown then stops accepting,
/// releases every event subscription, stops the bridge, closes every
/// hypervisor session, removes the socket file and joins the workers.
///
/// # Errors
///
/// Returns [`LaunchError`] when any launch stage fails.
pub fn run_daemon_with<L, S>(plan: LaunchPlan<L, S>) -> Result<(), LaunchError>
where
    L: ConfigLoader,
    S: ShutdownSignal + 'static,
{
    let LaunchPlan {
        loader,
        shutdown,
        reporter,
        factory,
        users,
        observer,
    } = plan;

    info!(target: PROCESS_TARGET, "starting daemon runtime");
    let daemon = bootstrap_with(&loader, Arc::clone(&reporter), factory.as_ref())?;
    let config = daemon.config().clone();
    let workers =
        WorkerPool::start(config.workers).map_err(|source| LaunchError::Runtime { source })?;
    let app = Application::new(
        config.clone(),
        Collaborators {
            hypervisor: Arc::clone(daemon.hypervisor()),
            users,
            reporter: Arc::clone(&reporter),
            observer,
        },
    )?;
    let bridge = app.start_bridge()?;
    let listener = {
        let _runtime = workers.handle().enter();
        SocketListener::bind(config.socket_path())?
    };
    reporter.listener_ready(listener.path());

    let waited = workers.block_on(async {
        let waiter = task::spawn_blocking(move || shutdown.wait());
        tokio::select! {
            () = app.serve(&listener) => Ok(()),
            waited = waiter => waited
                .map_err(|source| ShutdownError::Listener { source })
                .and_then(|result| result),
        }
    });

    reporter.shutdown_starting();
    let torn_down = app.teardown(bridge);
    drop(listener);
    workers.join(WORKER_JOIN_TIMEOUT);
    if let Err(error) = &torn_down {
        warn!(target: PROCESS_TARGET, %error, "teardown incomplete");
    }
    waited?;
    torn_down?;
    info!(target: PROCESS_TARGET, "shutdown sequence completed");
    Ok(())
}

//! Dedicated thread driving the hypervisor's event loop.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::hypervisor::Hypervisor;

use super::{BridgeError, EVENTS_TARGET};

const THREAD_NAME: &str = "virtd-events";

/// Runs the hypervisor's default event loop on its own OS thread.
///
/// Lifecycle callbacks registered through any session fire on this thread.
/// Each iteration returns within the poll interval, which bounds how long
/// [`LifecycleBridge::stop`] waits.
#[derive(Debug)]
pub struct LifecycleBridge {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl LifecycleBridge {
    /// Installs the event loop implementation and starts the thread.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::Register`] when the hypervisor rejects the event
    /// loop, or [`BridgeError::Spawn`] when the thread cannot be created.
    pub fn start(
        hypervisor: Arc<dyn Hypervisor>,
        poll_interval: Duration,
    ) -> Result<Self, BridgeError> {
        hypervisor
            .register_event_loop(poll_interval)
            .map_err(|source| BridgeError::Register { source })?;
        let stop = Arc::new(AtomicBool::new(false));
        let thread = thread::Builder::new()
            .name(THREAD_NAME.to_owned())
            .spawn({
                let stop = Arc::clone(&stop);
                move || run_loop(hypervisor.as_ref(), &stop, poll_interval)
            })
            .map_err(|source| BridgeError::Spawn { source })?;
        info!(
            target: EVENTS_TARGET,
            poll_ms = poll_interval.as_millis(),
            "lifecycle bridge started"
        );
        Ok(Self {
            stop,
            thread: Some(thread),
        })
    }

    /// True until the thread exits.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .is_some_and(|thread| !thread.is_finished())
    }

    /// Signals the thread and waits for its current iteration to finish.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::ThreadPanic`] when the thread panicked.
    pub fn stop(mut self) -> Result<(), BridgeError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), BridgeError> {
        self.stop.store(true, Ordering::Release);
        let Some(thread) = self.thread.take() else {
            return Ok(());
        };
        thread.join().map_err(|_| BridgeError::ThreadPanic)?;
        info!(target: EVENTS_TARGET, "lifecycle bridge stopped");
        Ok(())
    }
}

impl Drop for LifecycleBridge {
    fn drop(&mut self) {
        if let Err(error) = self.shutdown() {
            warn!(target: EVENTS_TARGET, %error, "lifecycle bridge did not stop cleanly");
        }
    }
}

fn run_loop(hypervisor: &dyn Hypervisor, stop: &AtomicBool, poll_interval: Duration) {
    let mut failing = false;
    while !stop.load(Ordering::Acquire) {
        match hypervisor.run_event_iteration() {
            Ok(()) if failing => {
                failing = false;
                info!(target: EVENTS_TARGET, "event loop iteration recovered");
            }
            Ok(()) => {}
            Err(error) => {
                if failing {
                    debug!(target: EVENTS_TARGET, %error, "event loop iteration failed");
                } else {
                    failing = true;
                    warn!(target: EVENTS_TARGET, %error, "event loop iteration failed");
                }
                thread::sleep(poll_interval);
            }
        }
    }
}

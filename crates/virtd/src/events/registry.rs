//! Per-user set of registered hypervisor event callbacks.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strum::Display;
use tracing::{debug, warn};

use crate::hypervisor::{CallbackId, HypervisorError, LifecycleCallback, Session};

use super::EVENTS_TARGET;

/// Hypervisor event families a user can subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum EventKind {
    Lifecycle,
}

/// A callback registered with one session.
///
/// Dropping the event deregisters the callback. A deregistration failure is
/// logged and otherwise ignored, since the session may already be gone.
pub struct Event {
    kind: EventKind,
    user: String,
    session: Arc<dyn Session>,
    callback: CallbackId,
}

impl Event {
    /// Registers `callback` for every domain lifecycle change on `session`.
    ///
    /// # Errors
    ///
    /// Propagates the binding's registration failure.
    pub fn lifecycle(
        user: &str,
        session: Arc<dyn Session>,
        callback: LifecycleCallback,
    ) -> Result<Self, HypervisorError> {
        let id = session.register_lifecycle(callback)?;
        debug!(
            target: EVENTS_TARGET,
            user,
            uri = session.uri(),
            callback = id.0,
            "lifecycle callback registered"
        );
        Ok(Self {
            kind: EventKind::Lifecycle,
            user: user.to_owned(),
            session,
            callback: id,
        })
    }

    /// Event family.
    #[must_use]
    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// True while the session the callback lives on is still open.
    #[must_use]
    pub fn is_live(&self) -> bool {
        self.session.is_alive()
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        match self.session.deregister(self.callback) {
            Ok(()) => debug!(
                target: EVENTS_TARGET,
                user = %self.user,
                kind = %self.kind,
                callback = self.callback.0,
                "event callback deregistered"
            ),
            Err(error) => warn!(
                target: EVENTS_TARGET,
                user = %self.user,
                kind = %self.kind,
                callback = self.callback.0,
                %error,
                "failed to deregister event callback"
            ),
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("Event")
            .field("kind", &self.kind)
            .field("user", &self.user)
            .field("callback", &self.callback)
            .finish_non_exhaustive()
    }
}

/// One user's registered events, at most one per [`EventKind`].
///
/// Events leaving the registry are dropped after the lock is released, so the
/// hypervisor call made by deregistration never runs under it.
#[derive(Debug, Default)]
pub struct EventsRegistry {
    events: Mutex<HashMap<EventKind, Event>>,
}

impl EventsRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True when an event of `kind` is held and its session is still open.
    #[must_use]
    pub fn is_live(&self, kind: EventKind) -> bool {
        self.lock().get(&kind).is_some_and(Event::is_live)
    }

    /// Stores `event` unless a live event of the same kind is already held.
    /// Returns `false`, and deregisters `event`, when it was redundant.
    pub fn insert(&self, event: Event) -> bool {
        let kind = event.kind();
        let (inserted, dropped) = {
            let mut events = self.lock();
            if events.get(&kind).is_some_and(Event::is_live) {
                (false, Some(event))
            } else {
                (true, events.insert(kind, event))
            }
        };
        drop(dropped);
        inserted
    }

    /// Removes and deregisters the event of `kind`, if any.
    pub fn remove(&self, kind: EventKind) -> bool {
        let removed = self.lock().remove(&kind);
        removed.is_some()
    }

    /// Removes and deregisters every event.
    pub fn clear(&self) {
        let drained: Vec<Event> = self.lock().drain().map(|(_, event)| event).collect();
        drop(drained);
    }

    /// Number of events held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// True when no events are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<EventKind, Event>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::{fixture, rstest};

    use crate::hypervisor::memory::MemoryHypervisor;
    use crate::hypervisor::{Hypervisor, LifecycleEvent};

    use super::*;

    const URI: &str = "test:///alice";

    fn ignore() -> LifecycleCallback {
        Arc::new(|_: LifecycleEvent| {})
    }

    #[fixture]
    fn hypervisor() -> MemoryHypervisor {
        let hypervisor = MemoryHypervisor::new();
        hypervisor
            .register_event_loop(Duration::from_millis(1))
            .expect("event loop");
        hypervisor
    }

    fn lifecycle(hypervisor: &MemoryHypervisor) -> Event {
        let session = hypervisor.open(URI).expect("open");
        Event::lifecycle("alice", session, ignore()).expect("register")
    }

    #[rstest]
    fn dropping_an_event_deregisters_it(hypervisor: MemoryHypervisor) {
        let event = lifecycle(&hypervisor);
        assert_eq!(hypervisor.callback_count(URI), 1);

        drop(event);

        assert_eq!(hypervisor.callback_count(URI), 0);
    }

    #[rstest]
    fn keeps_the_first_live_event(hypervisor: MemoryHypervisor) {
        let registry = EventsRegistry::new();

        assert!(registry.insert(lifecycle(&hypervisor)));
        assert!(!registry.insert(lifecycle(&hypervisor)));

        assert_eq!(registry.len(), 1);
        assert_eq!(hypervisor.callback_count(URI), 1);
    }

    #[rstest]
    fn replaces_events_on_dead_sessions(hypervisor: MemoryHypervisor) {
        let registry = EventsRegistry::new();
        registry.insert(lifecycle(&hypervisor));
        hypervisor.drop_sessions(URI);
        assert!(!registry.is_live(EventKind::Lifecycle));

        assert!(registry.insert(lifecycle(&hypervisor)));

        assert!(registry.is_live(EventKind::Lifecycle));
        assert_eq!(hypervisor.callback_count(URI), 1);
    }

    #[rstest]
    fn clear_deregisters_everything(hypervisor: MemoryHypervisor) {
        let registry = EventsRegistry::new();
        registry.insert(lifecycle(&hypervisor));

        registry.clear();

        assert!(registry.is_empty());
        assert_eq!(hypervisor.callback_count(URI), 0);
    }

    #[rstest]
    fn deregistration_failure_is_not_fatal(hypervisor: MemoryHypervisor) {
        let registry = EventsRegistry::new();
        registry.insert(lifecycle(&hypervisor));
        hypervisor.drop_sessions(URI);

        assert!(registry.remove(EventKind::Lifecycle));
        assert!(registry.is_empty());
    }
}

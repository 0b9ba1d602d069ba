//! Per-user cache of hypervisor connections.
//!
//! Entries are created the first time a user is seen and are never evicted.
//! A stale entry is reconnected in place on the next lookup, so a user whose
//! hypervisor was unreachable gets a fresh connect attempt on every request
//! rather than a cached failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use once_cell::sync::OnceCell;
use tracing::debug;

use crate::health::HealthReporter;
use crate::users::UriRule;

use super::{Hypervisor, HypervisorConnection, POOL_TARGET};

/// Told when a stale pool entry has been reconnected to a fresh session.
///
/// State bound to the old session, such as event callbacks, is gone by then
/// and must be re-established on the new one.
pub trait ReconnectListener: Send + Sync {
    /// `username`'s entry now holds a new live session.
    fn reconnected(&self, username: &str);
}

/// Mapping from username to that user's [`HypervisorConnection`].
pub struct ConnectionPool {
    hypervisor: Arc<dyn Hypervisor>,
    reporter: Arc<dyn HealthReporter>,
    uris: UriRule,
    connections: Mutex<HashMap<String, Arc<HypervisorConnection>>>,
    listener: OnceCell<Weak<dyn ReconnectListener>>,
}

impl ConnectionPool {
    /// Creates an empty pool.
    pub fn new(
        hypervisor: Arc<dyn Hypervisor>,
        reporter: Arc<dyn HealthReporter>,
        uris: UriRule,
    ) -> Self {
        Self {
            hypervisor,
            reporter,
            uris,
            connections: Mutex::new(HashMap::new()),
            listener: OnceCell::new(),
        }
    }

    /// Installs the listener told about reconnects. Only the first call
    /// takes effect; later calls return `false`.
    ///
    /// The pool holds the listener weakly, since listeners usually own the
    /// pool.
    pub fn set_reconnect_listener(&self, listener: Weak<dyn ReconnectListener>) -> bool {
        self.listener.set(listener).is_ok()
    }

    /// Returns `username`'s connection, connecting it first when it is new or
    /// stale.
    ///
    /// The map lock covers only the lookup-or-insert; the connect itself runs
    /// under the entry's own lock, so a slow hypervisor for one user does not
    /// stall lookups for another. The returned connection may still be stale
    /// when the connect attempt failed; callers check
    /// [`HypervisorConnection::is_connected`].
    pub fn get(&self, username: &str) -> Arc<HypervisorConnection> {
        let (connection, created) = {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match connections.get(username) {
                Some(existing) => (Arc::clone(existing), false),
                None => {
                    let connection = Arc::new(HypervisorConnection::new(
                        username,
                        self.uris.uri_for(username),
                        Arc::clone(&self.hypervisor),
                        Arc::clone(&self.reporter),
                    ));
                    connections.insert(username.to_owned(), Arc::clone(&connection));
                    (connection, true)
                }
            }
        };

        if created {
            debug!(target: POOL_TARGET, user = username, uri = connection.uri(), "new pool entry");
            // Fresh entries are never live; a concurrent reconnect may still
            // get there first, in which case the guard reports it.
            if let Err(error) = connection.connect() {
                debug!(target: POOL_TARGET, user = username, %error, "pool entry left stale");
            }
        } else if !connection.is_connected() {
            debug!(target: POOL_TARGET, user = username, "reconnecting stale pool entry");
            match connection.reconnect() {
                Ok(()) => self.notify_reconnected(username),
                Err(error) => {
                    debug!(target: POOL_TARGET, user = username, %error, "pool entry left stale");
                }
            }
        }
        connection
    }

    fn notify_reconnected(&self, username: &str) {
        if let Some(listener) = self.listener.get().and_then(Weak::upgrade) {
            listener.reconnected(username);
        }
    }

    /// Returns `username`'s entry without connecting it.
    #[must_use]
    pub fn peek(&self, username: &str) -> Option<Arc<HypervisorConnection>> {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .map(Arc::clone)
    }

    /// Number of users with an entry.
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// True when no user has an entry yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes every session. Entries stay in place and reconnect on demand.
    pub fn close_all(&self) {
        let connections: Vec<_> = self
            .connections
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Arc::clone)
            .collect();
        for connection in connections {
            connection.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use crate::hypervisor::memory::MemoryHypervisor;
    use crate::tests::support::{HealthEvent, RecordingHealthReporter};

    use super::*;

    const ALICE_URI: &str = "qemu+ssh://alice@localhost/session";

    struct PoolHarness {
        hypervisor: Arc<MemoryHypervisor>,
        reporter: Arc<RecordingHealthReporter>,
        pool: ConnectionPool,
    }

    #[fixture]
    fn harness() -> PoolHarness {
        let hypervisor = Arc::new(MemoryHypervisor::new());
        let reporter = Arc::new(RecordingHealthReporter::default());
        let pool = ConnectionPool::new(
            Arc::clone(&hypervisor) as Arc<dyn Hypervisor>,
            Arc::clone(&reporter) as Arc<dyn HealthReporter>,
            UriRule::default(),
        );
        PoolHarness {
            hypervisor,
            reporter,
            pool,
        }
    }

    #[rstest]
    fn connects_lazily_on_first_get(harness: PoolHarness) {
        assert!(harness.pool.is_empty());

        let connection = harness.pool.get("alice");

        assert!(connection.is_connected());
        assert_eq!(connection.uri(), ALICE_URI);
        assert_eq!(harness.hypervisor.open_count(ALICE_URI), 1);
    }

    #[rstest]
    fn reuses_live_connection(harness: PoolHarness) {
        let first = harness.pool.get("alice");
        let second = harness.pool.get("alice");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(harness.hypervisor.open_count(ALICE_URI), 1);
    }

    #[rstest]
    fn failed_connect_is_retried_on_next_get(harness: PoolHarness) {
        harness.hypervisor.fail_connect(ALICE_URI);
        let first = harness.pool.get("alice");
        assert!(!first.is_connected());

        harness.hypervisor.allow_connect(ALICE_URI);
        let second = harness.pool.get("alice");

        assert!(Arc::ptr_eq(&first, &second), "entry is replaced in place");
        assert!(second.is_connected());
        assert_eq!(harness.hypervisor.open_count(ALICE_URI), 2);
        assert_eq!(harness.pool.len(), 1);
    }

    #[rstest]
    fn unreachable_user_retries_every_time(harness: PoolHarness) {
        harness.hypervisor.fail_connect(ALICE_URI);

        for _ in 0..3 {
            assert!(!harness.pool.get("alice").is_connected());
        }

        assert_eq!(harness.hypervisor.open_count(ALICE_URI), 3);
    }

    #[rstest]
    fn root_maps_to_system_uri(harness: PoolHarness) {
        let connection = harness.pool.get("root");
        assert_eq!(connection.uri(), "qemu:///system");
    }

    #[rstest]
    fn connect_attempts_are_reported(harness: PoolHarness) {
        harness.hypervisor.fail_connect(ALICE_URI);
        harness.pool.get("alice");

        let events = harness.reporter.events();
        assert!(events.contains(&HealthEvent::HypervisorConnecting("alice".to_owned())));
        assert!(events.contains(&HealthEvent::HypervisorConnectFailed("alice".to_owned())));
    }

    #[derive(Default)]
    struct RecordingListener {
        users: Mutex<Vec<String>>,
    }

    impl ReconnectListener for RecordingListener {
        fn reconnected(&self, username: &str) {
            self.users
                .lock()
                .expect("listener lock")
                .push(username.to_owned());
        }
    }

    #[rstest]
    fn listener_hears_only_successful_reconnects(harness: PoolHarness) {
        let listener = Arc::new(RecordingListener::default());
        let weak = Arc::downgrade(&listener);
        assert!(harness.pool.set_reconnect_listener(weak));

        harness.pool.get("alice");
        harness.hypervisor.drop_sessions(ALICE_URI);
        harness.hypervisor.fail_connect(ALICE_URI);
        assert!(!harness.pool.get("alice").is_connected());
        assert!(listener.users.lock().expect("listener lock").is_empty());

        harness.hypervisor.allow_connect(ALICE_URI);
        assert!(harness.pool.get("alice").is_connected());

        assert_eq!(
            *listener.users.lock().expect("listener lock"),
            vec!["alice".to_owned()]
        );
    }

    #[rstest]
    fn dropped_listener_is_ignored(harness: PoolHarness) {
        let listener: Arc<dyn ReconnectListener> = Arc::new(RecordingListener::default());
        harness.pool.set_reconnect_listener(Arc::downgrade(&listener));
        drop(listener);

        harness.pool.get("alice");
        harness.pool.close_all();

        assert!(harness.pool.get("alice").is_connected());
    }

    #[rstest]
    fn close_all_leaves_entries_for_reconnect(harness: PoolHarness) {
        harness.pool.get("alice");
        harness.pool.close_all();

        let entry = harness.pool.peek("alice").expect("entry kept");
        assert!(!entry.is_connected());
        assert!(harness.pool.get("alice").is_connected());
        assert_eq!(harness.hypervisor.open_count(ALICE_URI), 2);
    }
}

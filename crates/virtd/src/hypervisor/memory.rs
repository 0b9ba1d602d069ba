//! In-process hypervisor.
//!
//! Keeps every host's domains in memory, keyed by URI. Lifecycle events raised
//! by `create`, `shutdown` or [`MemoryHypervisor::emit_lifecycle`] are queued
//! and only delivered from [`Hypervisor::run_event_iteration`], matching the
//! threading contract of the real default event loop. Connect failures and
//! session loss can be injected per URI.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use super::{
    BlockInfo, CallbackId, DomainHandle, DomainState, Hypervisor, HypervisorError,
    LifecycleCallback, LifecycleEvent, LifecycleKind, Session,
};

/// Domain definition used to seed a [`MemoryHypervisor`] host.
#[derive(Debug, Clone)]
pub struct MemoryDomain {
    name: String,
    state: DomainState,
    autostart: bool,
    metadata: Option<String>,
    ignores_shutdown: bool,
    disks: HashMap<String, BlockInfo>,
}

impl MemoryDomain {
    /// A running domain.
    #[must_use]
    pub fn running(name: &str) -> Self {
        Self::with_state(name, DomainState::Running)
    }

    /// A defined but inactive domain.
    #[must_use]
    pub fn shutoff(name: &str) -> Self {
        Self::with_state(name, DomainState::Shutoff)
    }

    fn with_state(name: &str, state: DomainState) -> Self {
        Self {
            name: name.to_owned(),
            state,
            autostart: false,
            metadata: None,
            ignores_shutdown: false,
            disks: HashMap::new(),
        }
    }

    /// Makes the guest ignore shutdown requests.
    #[must_use]
    pub fn ignoring_shutdown(mut self) -> Self {
        self.ignores_shutdown = true;
        self
    }

    /// Attaches a block device.
    #[must_use]
    pub fn with_disk(mut self, target: &str, info: BlockInfo) -> Self {
        self.disks.insert(target.to_owned(), info);
        self
    }
}

struct DomainRecord {
    definition: MemoryDomain,
    id: Option<u32>,
    uuid: String,
}

#[derive(Default)]
struct Host {
    domains: BTreeMap<String, DomainRecord>,
}

struct Registration {
    id: CallbackId,
    session: u64,
    uri: String,
    callback: LifecycleCallback,
}

struct PendingEvent {
    uri: String,
    domain: String,
    kind: LifecycleKind,
    detail: i32,
}

#[derive(Default)]
struct Inner {
    hosts: HashMap<String, Host>,
    failing: HashSet<String>,
    opens: HashMap<String, usize>,
    live: HashMap<u64, String>,
    registrations: Vec<Registration>,
    pending: VecDeque<PendingEvent>,
    poll_interval: Option<Duration>,
    next_session: u64,
    next_callback: i32,
    next_domain: u32,
}

impl Inner {
    fn record(&mut self, uri: &str, name: &str) -> Result<&mut DomainRecord, HypervisorError> {
        self.hosts
            .get_mut(uri)
            .and_then(|host| host.domains.get_mut(name))
            .ok_or_else(|| HypervisorError::call("virDomainLookupByName", "domain not found"))
    }

    fn allocate_id(&mut self) -> u32 {
        self.next_domain += 1;
        self.next_domain
    }

    fn queue(&mut self, uri: &str, domain: &str, kind: LifecycleKind, detail: i32) {
        self.pending.push_back(PendingEvent {
            uri: uri.to_owned(),
            domain: domain.to_owned(),
            kind,
            detail,
        });
    }
}

type Shared = Arc<Mutex<Inner>>;

fn lock(shared: &Shared) -> MutexGuard<'_, Inner> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

/// In-memory [`Hypervisor`] implementation.
#[derive(Clone, Default)]
pub struct MemoryHypervisor {
    shared: Shared,
}

impl MemoryHypervisor {
    /// Creates a hypervisor with no hosts. Any URI can be opened.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Defines a domain on the host behind `uri`.
    pub fn define(&self, uri: &str, domain: MemoryDomain) {
        let mut inner = lock(&self.shared);
        let id = if domain.state == DomainState::Running {
            Some(inner.allocate_id())
        } else {
            None
        };
        let serial = inner.allocate_id();
        let record = DomainRecord {
            uuid: format!("00000000-0000-4000-8000-{serial:012x}"),
            id,
            definition: domain,
        };
        inner
            .hosts
            .entry(uri.to_owned())
            .or_default()
            .domains
            .insert(record.definition.name.clone(), record);
    }

    /// Makes every subsequent open of `uri` fail.
    pub fn fail_connect(&self, uri: &str) {
        lock(&self.shared).failing.insert(uri.to_owned());
    }

    /// Undoes [`MemoryHypervisor::fail_connect`].
    pub fn allow_connect(&self, uri: &str) {
        lock(&self.shared).failing.remove(uri);
    }

    /// Kills every open session to `uri`, as if the remote end went away.
    pub fn drop_sessions(&self, uri: &str) {
        let mut inner = lock(&self.shared);
        inner.live.retain(|_, live_uri| live_uri != uri);
        let live: HashSet<u64> = inner.live.keys().copied().collect();
        inner
            .registrations
            .retain(|registration| live.contains(&registration.session));
    }

    /// Number of open attempts made against `uri`, failed ones included.
    #[must_use]
    pub fn open_count(&self, uri: &str) -> usize {
        lock(&self.shared).opens.get(uri).copied().unwrap_or(0)
    }

    /// Number of lifecycle callbacks registered against `uri`.
    #[must_use]
    pub fn callback_count(&self, uri: &str) -> usize {
        lock(&self.shared)
            .registrations
            .iter()
            .filter(|registration| registration.uri == uri)
            .count()
    }

    /// Current state of a domain, if it exists.
    #[must_use]
    pub fn domain_state(&self, uri: &str, name: &str) -> Option<DomainState> {
        lock(&self.shared)
            .record(uri, name)
            .ok()
            .map(|record| record.definition.state)
    }

    /// Queues a lifecycle event for delivery on the next event loop iteration.
    pub fn emit_lifecycle(&self, uri: &str, domain: &str, kind: LifecycleKind, detail: i32) {
        lock(&self.shared).queue(uri, domain, kind, detail);
    }
}

impl Hypervisor for MemoryHypervisor {
    fn open(&self, uri: &str) -> Result<Arc<dyn Session>, HypervisorError> {
        let mut inner = lock(&self.shared);
        *inner.opens.entry(uri.to_owned()).or_default() += 1;
        if inner.failing.contains(uri) {
            return Err(HypervisorError::call(
                "virConnectOpen",
                format!("failed to connect to the hypervisor at '{uri}'"),
            ));
        }
        inner.next_session += 1;
        let id = inner.next_session;
        inner.live.insert(id, uri.to_owned());
        inner.hosts.entry(uri.to_owned()).or_default();
        Ok(Arc::new(MemorySession {
            id,
            uri: uri.to_owned(),
            shared: Arc::clone(&self.shared),
        }))
    }

    fn register_event_loop(&self, poll_interval: Duration) -> Result<(), HypervisorError> {
        lock(&self.shared).poll_interval = Some(poll_interval);
        Ok(())
    }

    fn run_event_iteration(&self) -> Result<(), HypervisorError> {
        let (deliveries, idle) = {
            let mut inner = lock(&self.shared);
            let Some(poll_interval) = inner.poll_interval else {
                return Err(HypervisorError::call(
                    "virEventRunDefaultImpl",
                    "event loop implementation not registered",
                ));
            };
            let pending: Vec<PendingEvent> = inner.pending.drain(..).collect();
            let mut deliveries = Vec::new();
            for event in pending {
                for registration in inner
                    .registrations
                    .iter()
                    .filter(|registration| registration.uri == event.uri)
                {
                    deliveries.push((
                        Arc::clone(&registration.callback),
                        registration.session,
                        event.uri.clone(),
                        event.domain.clone(),
                        event.kind,
                        event.detail,
                    ));
                }
            }
            let idle = deliveries.is_empty().then_some(poll_interval);
            (deliveries, idle)
        };

        if let Some(poll_interval) = idle {
            thread::sleep(poll_interval);
            return Ok(());
        }

        for (callback, session, uri, domain, kind, detail) in deliveries {
            callback(LifecycleEvent {
                domain: Box::new(MemoryDomainHandle {
                    session,
                    uri,
                    name: domain,
                    shared: Arc::clone(&self.shared),
                }),
                kind,
                detail,
            });
        }
        Ok(())
    }
}

struct MemorySession {
    id: u64,
    uri: String,
    shared: Shared,
}

impl MemorySession {
    fn ensure_alive(&self, operation: &'static str) -> Result<(), HypervisorError> {
        if lock(&self.shared).live.contains_key(&self.id) {
            Ok(())
        } else {
            Err(HypervisorError::call(operation, "session is closed"))
        }
    }

    fn handle(&self, name: &str) -> Box<dyn DomainHandle> {
        Box::new(MemoryDomainHandle {
            session: self.id,
            uri: self.uri.clone(),
            name: name.to_owned(),
            shared: Arc::clone(&self.shared),
        })
    }
}

impl Session for MemorySession {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_alive(&self) -> bool {
        lock(&self.shared).live.contains_key(&self.id)
    }

    fn list_domains(&self) -> Result<Vec<Box<dyn DomainHandle>>, HypervisorError> {
        self.ensure_alive("virConnectListAllDomains")?;
        let names: Vec<String> = lock(&self.shared)
            .hosts
            .get(&self.uri)
            .map(|host| host.domains.keys().cloned().collect())
            .unwrap_or_default();
        Ok(names.iter().map(|name| self.handle(name)).collect())
    }

    fn lookup_domain(&self, name: &str) -> Result<Option<Box<dyn DomainHandle>>, HypervisorError> {
        self.ensure_alive("virDomainLookupByName")?;
        let exists = lock(&self.shared).record(&self.uri, name).is_ok();
        Ok(exists.then(|| self.handle(name)))
    }

    fn register_lifecycle(
        &self,
        callback: LifecycleCallback,
    ) -> Result<CallbackId, HypervisorError> {
        self.ensure_alive("virConnectDomainEventRegisterAny")?;
        let mut inner = lock(&self.shared);
        if inner.poll_interval.is_none() {
            return Err(HypervisorError::call(
                "virConnectDomainEventRegisterAny",
                "event loop implementation not registered",
            ));
        }
        inner.next_callback += 1;
        let id = CallbackId(inner.next_callback);
        inner.registrations.push(Registration {
            id,
            session: self.id,
            uri: self.uri.clone(),
            callback,
        });
        Ok(id)
    }

    fn deregister(&self, id: CallbackId) -> Result<(), HypervisorError> {
        let mut inner = lock(&self.shared);
        let before = inner.registrations.len();
        inner
            .registrations
            .retain(|registration| !(registration.id == id && registration.session == self.id));
        if inner.registrations.len() == before {
            return Err(HypervisorError::call(
                "virConnectDomainEventDeregisterAny",
                format!("no callback registered with id {}", id.0),
            ));
        }
        Ok(())
    }

    fn close(&self) -> Result<(), HypervisorError> {
        let mut inner = lock(&self.shared);
        inner.live.remove(&self.id);
        inner
            .registrations
            .retain(|registration| registration.session != self.id);
        Ok(())
    }
}

struct MemoryDomainHandle {
    session: u64,
    uri: String,
    name: String,
    shared: Shared,
}

impl MemoryDomainHandle {
    fn with_record<T>(
        &self,
        operation: &'static str,
        action: impl FnOnce(&mut Inner, &str, &str) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let mut inner = lock(&self.shared);
        if !inner.live.contains_key(&self.session) {
            return Err(HypervisorError::call(operation, "session is closed"));
        }
        action(&mut inner, &self.uri, &self.name)
    }
}

impl DomainHandle for MemoryDomainHandle {
    fn id(&self) -> Option<u32> {
        lock(&self.shared)
            .record(&self.uri, &self.name)
            .ok()
            .and_then(|record| record.id)
    }

    fn name(&self) -> Result<String, HypervisorError> {
        Ok(self.name.clone())
    }

    fn uuid(&self) -> Result<String, HypervisorError> {
        self.with_record("virDomainGetUUIDString", |inner, uri, name| {
            Ok(inner.record(uri, name)?.uuid.clone())
        })
    }

    fn state(&self) -> Result<DomainState, HypervisorError> {
        self.with_record("virDomainGetState", |inner, uri, name| {
            Ok(inner.record(uri, name)?.definition.state)
        })
    }

    fn autostart(&self) -> Result<bool, HypervisorError> {
        self.with_record("virDomainGetAutostart", |inner, uri, name| {
            Ok(inner.record(uri, name)?.definition.autostart)
        })
    }

    fn set_autostart(&self, enabled: bool) -> Result<(), HypervisorError> {
        self.with_record("virDomainSetAutostart", |inner, uri, name| {
            inner.record(uri, name)?.definition.autostart = enabled;
            Ok(())
        })
    }

    fn metadata(&self) -> Result<Option<String>, HypervisorError> {
        self.with_record("virDomainGetMetadata", |inner, uri, name| {
            Ok(inner.record(uri, name)?.definition.metadata.clone())
        })
    }

    fn set_metadata(&self, value: &str) -> Result<(), HypervisorError> {
        self.with_record("virDomainSetMetadata", |inner, uri, name| {
            inner.record(uri, name)?.definition.metadata = Some(value.to_owned());
            Ok(())
        })
    }

    fn xml_description(&self) -> Result<String, HypervisorError> {
        self.with_record("virDomainGetXMLDesc", |inner, uri, name| {
            let record = inner.record(uri, name)?;
            let disks: String = record
                .definition
                .disks
                .keys()
                .map(|target| format!("<disk type='file'><target dev='{target}'/></disk>"))
                .collect();
            Ok(format!(
                "<domain type='test'><name>{name}</name><uuid>{}</uuid><devices>{disks}</devices></domain>",
                record.uuid
            ))
        })
    }

    fn block_info(&self, disk: &str) -> Result<BlockInfo, HypervisorError> {
        self.with_record("virDomainGetBlockInfo", |inner, uri, name| {
            inner
                .record(uri, name)?
                .definition
                .disks
                .get(disk)
                .copied()
                .ok_or_else(|| {
                    HypervisorError::call(
                        "virDomainGetBlockInfo",
                        format!("invalid path {disk} not assigned to domain"),
                    )
                })
        })
    }

    fn create(&self) -> Result<(), HypervisorError> {
        self.with_record("virDomainCreate", |inner, uri, name| {
            if inner.record(uri, name)?.definition.state == DomainState::Running {
                return Err(HypervisorError::call(
                    "virDomainCreate",
                    "domain is already running",
                ));
            }
            let id = inner.allocate_id();
            let record = inner.record(uri, name)?;
            record.definition.state = DomainState::Running;
            record.id = Some(id);
            inner.queue(uri, name, LifecycleKind::Started, 0);
            Ok(())
        })
    }

    fn shutdown(&self) -> Result<(), HypervisorError> {
        self.with_record("virDomainShutdown", |inner, uri, name| {
            let record = inner.record(uri, name)?;
            if record.definition.state != DomainState::Running {
                return Err(HypervisorError::call(
                    "virDomainShutdown",
                    "domain is not running",
                ));
            }
            if record.definition.ignores_shutdown {
                return Ok(());
            }
            record.definition.state = DomainState::Shutoff;
            record.id = None;
            inner.queue(uri, name, LifecycleKind::Stopped, 0);
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    const URI: &str = "test:///default";

    #[test]
    fn callbacks_fire_only_inside_event_iterations() {
        let hypervisor = MemoryHypervisor::new();
        hypervisor.define(URI, MemoryDomain::shutoff("db"));
        hypervisor
            .register_event_loop(Duration::from_millis(1))
            .expect("register loop");
        let session = hypervisor.open(URI).expect("open");
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        session
            .register_lifecycle(Arc::new(move |event: LifecycleEvent| {
                assert_eq!(event.kind, LifecycleKind::Started);
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .expect("register callback");

        let domain = session.lookup_domain("db").expect("lookup").expect("exists");
        domain.create().expect("create");
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        hypervisor.run_event_iteration().expect("iterate");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn registering_without_event_loop_fails() {
        let hypervisor = MemoryHypervisor::new();
        let session = hypervisor.open(URI).expect("open");
        assert!(session.register_lifecycle(Arc::new(|_: LifecycleEvent| {})).is_err());
    }

    #[test]
    fn closed_sessions_reject_calls() {
        let hypervisor = MemoryHypervisor::new();
        let session = hypervisor.open(URI).expect("open");
        session.close().expect("close");
        assert!(!session.is_alive());
        assert!(session.list_domains().is_err());
    }

    #[test]
    fn deregistering_unknown_callback_fails() {
        let hypervisor = MemoryHypervisor::new();
        let session = hypervisor.open(URI).expect("open");
        assert!(session.deregister(CallbackId(99)).is_err());
    }
}

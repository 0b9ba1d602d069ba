//! Hypervisor binding over the libvirt client library.
//!
//! Connection and domain calls go through the `virt` crate. Event loop and
//! lifecycle callback registration use its raw `sys` bindings, because the
//! callback has to carry a boxed Rust closure through libvirt's opaque
//! pointer.

use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};
use std::ptr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use virt::connect::Connect;
use virt::domain::Domain;
use virt::error::{Error as VirtError, ErrorNumber};
use virt::sys;

use super::{
    BlockInfo, CallbackId, DomainHandle, DomainState, Hypervisor, HypervisorError,
    LifecycleCallback, LifecycleEvent, LifecycleKind, Session,
};

type GenericCallback = unsafe extern "C" fn(sys::virConnectPtr, sys::virDomainPtr, *mut c_void);
type LifecycleTrampoline = unsafe extern "C" fn(
    sys::virConnectPtr,
    sys::virDomainPtr,
    c_int,
    c_int,
    *mut c_void,
) -> c_int;

fn call(operation: &'static str) -> impl FnOnce(VirtError) -> HypervisorError {
    move |error| HypervisorError::call(operation, error.to_string())
}

/// Stateless entry point; every session owns its own `virConnectPtr`.
#[derive(Debug, Default, Clone, Copy)]
pub struct LibvirtHypervisor;

impl LibvirtHypervisor {
    /// Creates the binding.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Hypervisor for LibvirtHypervisor {
    fn open(&self, uri: &str) -> Result<Arc<dyn Session>, HypervisorError> {
        let connect = Connect::open(Some(uri)).map_err(call("virConnectOpen"))?;
        Ok(Arc::new(LibvirtSession {
            uri: uri.to_owned(),
            connect: Mutex::new(Some(SharedConnect(connect))),
        }))
    }

    fn register_event_loop(&self, poll_interval: Duration) -> Result<(), HypervisorError> {
        // SAFETY: plain libvirt calls with no Rust-owned pointers.
        if unsafe { sys::virEventRegisterDefaultImpl() } < 0 {
            return Err(HypervisorError::call(
                "virEventRegisterDefaultImpl",
                "libvirt refused the default event loop",
            ));
        }
        let timeout = c_int::try_from(poll_interval.as_millis()).unwrap_or(c_int::MAX);
        // A periodic no-op timer bounds each iteration of the default loop.
        // SAFETY: the callback ignores its opaque pointer, which is null.
        if unsafe { sys::virEventAddTimeout(timeout, Some(wake), ptr::null_mut(), None) } < 0 {
            return Err(HypervisorError::call(
                "virEventAddTimeout",
                "libvirt refused the event loop timer",
            ));
        }
        Ok(())
    }

    fn run_event_iteration(&self) -> Result<(), HypervisorError> {
        // SAFETY: plain libvirt call.
        if unsafe { sys::virEventRunDefaultImpl() } < 0 {
            return Err(HypervisorError::call(
                "virEventRunDefaultImpl",
                "event loop iteration failed",
            ));
        }
        Ok(())
    }
}

unsafe extern "C" fn wake(_timer: c_int, _opaque: *mut c_void) {}

/// libvirt connection objects are safe to share between threads.
struct SharedConnect(Connect);

// SAFETY: libvirt serialises access to a connection internally.
unsafe impl Send for SharedConnect {}
// SAFETY: as above.
unsafe impl Sync for SharedConnect {}

struct LibvirtSession {
    uri: String,
    connect: Mutex<Option<SharedConnect>>,
}

impl LibvirtSession {
    fn lock(&self) -> MutexGuard<'_, Option<SharedConnect>> {
        self.connect.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn with_connect<T>(
        &self,
        action: impl FnOnce(&Connect) -> Result<T, HypervisorError>,
    ) -> Result<T, HypervisorError> {
        let guard = self.lock();
        let Some(SharedConnect(connect)) = guard.as_ref() else {
            return Err(HypervisorError::NotConnected {
                uri: self.uri.clone(),
            });
        };
        action(connect)
    }
}

impl Session for LibvirtSession {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn is_alive(&self) -> bool {
        self.lock()
            .as_ref()
            .is_some_and(|SharedConnect(connect)| connect.is_alive().unwrap_or(false))
    }

    fn list_domains(&self) -> Result<Vec<Box<dyn DomainHandle>>, HypervisorError> {
        self.with_connect(|connect| {
            let domains = connect
                .list_all_domains(0)
                .map_err(call("virConnectListAllDomains"))?;
            Ok(domains
                .into_iter()
                .map(|domain| Box::new(LibvirtDomain(domain)) as Box<dyn DomainHandle>)
                .collect())
        })
    }

    fn lookup_domain(&self, name: &str) -> Result<Option<Box<dyn DomainHandle>>, HypervisorError> {
        self.with_connect(|connect| match Domain::lookup_by_name(connect, name) {
            Ok(domain) => Ok(Some(Box::new(LibvirtDomain(domain)) as Box<dyn DomainHandle>)),
            Err(error) if error.code() == ErrorNumber::NoDomain => Ok(None),
            Err(error) => Err(call("virDomainLookupByName")(error)),
        })
    }

    fn register_lifecycle(
        &self,
        callback: LifecycleCallback,
    ) -> Result<CallbackId, HypervisorError> {
        self.with_connect(|connect| {
            let opaque = Box::into_raw(Box::new(callback)).cast::<c_void>();
            // SAFETY: libvirt invokes the generic callback slot with the
            // lifecycle signature when the event id is LIFECYCLE.
            let generic = unsafe {
                std::mem::transmute::<LifecycleTrampoline, GenericCallback>(lifecycle_trampoline)
            };
            // SAFETY: `opaque` is a leaked `Box<LifecycleCallback>` released
            // by `free_callback` once libvirt drops the registration.
            let id = unsafe {
                sys::virConnectDomainEventRegisterAny(
                    connect.as_ptr(),
                    ptr::null_mut(),
                    sys::VIR_DOMAIN_EVENT_ID_LIFECYCLE as c_int,
                    Some(generic),
                    opaque,
                    Some(free_callback),
                )
            };
            if id < 0 {
                // SAFETY: libvirt did not take ownership on failure.
                drop(unsafe { Box::from_raw(opaque.cast::<LifecycleCallback>()) });
                return Err(HypervisorError::call(
                    "virConnectDomainEventRegisterAny",
                    "lifecycle callback registration failed",
                ));
            }
            Ok(CallbackId(id))
        })
    }

    fn deregister(&self, id: CallbackId) -> Result<(), HypervisorError> {
        self.with_connect(|connect| {
            // SAFETY: plain libvirt call on a live connection.
            if unsafe { sys::virConnectDomainEventDeregisterAny(connect.as_ptr(), id.0) } < 0 {
                return Err(HypervisorError::call(
                    "virConnectDomainEventDeregisterAny",
                    format!("callback {} is not registered", id.0),
                ));
            }
            Ok(())
        })
    }

    fn close(&self) -> Result<(), HypervisorError> {
        let Some(SharedConnect(mut connect)) = self.lock().take() else {
            return Ok(());
        };
        connect
            .close()
            .map(|_| ())
            .map_err(call("virConnectClose"))
    }
}

unsafe extern "C" fn lifecycle_trampoline(
    _connect: sys::virConnectPtr,
    domain: sys::virDomainPtr,
    event: c_int,
    detail: c_int,
    opaque: *mut c_void,
) -> c_int {
    // SAFETY: `opaque` was produced by `register_lifecycle` and stays valid
    // until `free_callback` runs.
    let callback = unsafe { &*opaque.cast::<LifecycleCallback>() };
    // The domain pointer is borrowed for the call; take our own reference
    // before wrapping it in an owning handle.
    // SAFETY: `domain` is valid for the duration of the callback.
    if unsafe { sys::virDomainRef(domain) } < 0 {
        return 0;
    }
    // SAFETY: the reference taken above is released when the handle drops.
    let domain = unsafe { Domain::from_ptr(domain) };
    let event = LifecycleEvent {
        domain: Box::new(LibvirtDomain(domain)),
        kind: LifecycleKind::from_code(event),
        detail,
    };
    let _ = panic::catch_unwind(AssertUnwindSafe(|| callback(event)));
    0
}

unsafe extern "C" fn free_callback(opaque: *mut c_void) {
    // SAFETY: `opaque` is the box leaked in `register_lifecycle`.
    drop(unsafe { Box::from_raw(opaque.cast::<LifecycleCallback>()) });
}

struct LibvirtDomain(Domain);

// SAFETY: libvirt domain objects are reference counted and thread safe.
unsafe impl Send for LibvirtDomain {}
// SAFETY: as above.
unsafe impl Sync for LibvirtDomain {}

impl DomainHandle for LibvirtDomain {
    fn id(&self) -> Option<u32> {
        self.0.get_id()
    }

    fn name(&self) -> Result<String, HypervisorError> {
        self.0.get_name().map_err(call("virDomainGetName"))
    }

    fn uuid(&self) -> Result<String, HypervisorError> {
        self.0.get_uuid_string().map_err(call("virDomainGetUUIDString"))
    }

    fn state(&self) -> Result<DomainState, HypervisorError> {
        let (state, _reason) = self.0.get_state().map_err(call("virDomainGetState"))?;
        Ok(DomainState::from_code(i32::try_from(state).unwrap_or(0)))
    }

    fn autostart(&self) -> Result<bool, HypervisorError> {
        self.0.get_autostart().map_err(call("virDomainGetAutostart"))
    }

    fn set_autostart(&self, enabled: bool) -> Result<(), HypervisorError> {
        self.0
            .set_autostart(enabled)
            .map(|_| ())
            .map_err(call("virDomainSetAutostart"))
    }

    fn metadata(&self) -> Result<Option<String>, HypervisorError> {
        match self
            .0
            .get_metadata(sys::VIR_DOMAIN_METADATA_DESCRIPTION as i32, None, 0)
        {
            Ok(value) => Ok(Some(value)),
            Err(error) if error.code() == ErrorNumber::NoDomainMetadata => Ok(None),
            Err(error) => Err(call("virDomainGetMetadata")(error)),
        }
    }

    fn set_metadata(&self, value: &str) -> Result<(), HypervisorError> {
        self.0
            .set_metadata(
                sys::VIR_DOMAIN_METADATA_DESCRIPTION as i32,
                Some(value),
                None,
                None,
                0,
            )
            .map(|_| ())
            .map_err(call("virDomainSetMetadata"))
    }

    fn xml_description(&self) -> Result<String, HypervisorError> {
        self.0.get_xml_desc(0).map_err(call("virDomainGetXMLDesc"))
    }

    fn block_info(&self, disk: &str) -> Result<BlockInfo, HypervisorError> {
        let info = self
            .0
            .get_block_info(disk, 0)
            .map_err(call("virDomainGetBlockInfo"))?;
        Ok(BlockInfo {
            capacity: info.capacity,
            allocation: info.allocation,
            physical: info.physical,
        })
    }

    fn create(&self) -> Result<(), HypervisorError> {
        self.0.create().map(|_| ()).map_err(call("virDomainCreate"))
    }

    fn shutdown(&self) -> Result<(), HypervisorError> {
        self.0.shutdown().map(|_| ()).map_err(call("virDomainShutdown"))
    }
}

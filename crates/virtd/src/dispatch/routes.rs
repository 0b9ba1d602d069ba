//! The daemon's HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use hyper::{Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;

use virtd_config::Config;

use crate::hypervisor::{Domain, DomainSnapshot};

use super::errors::{HandlerError, RouteError};
use super::middleware::{Middleware, with_methods};
use super::request::{Request, RouteMatch, parse_json};
use super::response::{EventSubscription, Response, write_error, write_json};
use super::router::Router;

/// Capture group holding the disk target on the disks route.
const DISK_GROUP: usize = 3;

/// Tunables the route handlers need.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteSettings {
    /// Re-runs granted to transient handler failures.
    pub retries: usize,
    /// Budget for a domain to reach a shutdown state.
    pub shutdown_timeout: Duration,
    /// Interval between domain state polls while shutting down.
    pub shutdown_poll: Duration,
}

impl RouteSettings {
    /// Settings derived from the daemon configuration.
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            retries: config.retries,
            shutdown_timeout: config.shutdown_timeout(),
            shutdown_poll: config.shutdown_poll(),
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct MetadataBody {
    metadata: Option<String>,
}

/// Builds the route table.
///
/// # Errors
///
/// Returns [`RouteError`] if a built-in pattern fails to compile.
pub fn build_router(middleware: &Middleware, settings: RouteSettings) -> Result<Router, RouteError> {
    let mut router = Router::new(settings.retries);

    router.register(
        r"^/health/$",
        with_methods(
            &[Method::GET],
            Arc::new(|_: &RouteMatch, _: &Request, response: &mut Response| {
                write_json(response, StatusCode::OK, &json!({ "status": "ok" }))
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/events/$",
        with_methods(
            &[Method::GET],
            middleware.with_libvirt(|_, request, response, context| {
                if !hyper_tungstenite::is_upgrade_request(request) {
                    write_error(response, StatusCode::BAD_REQUEST, "WebSocket upgrade required");
                    return Ok(());
                }
                response.extensions_mut().insert(EventSubscription {
                    user: context.user.clone(),
                });
                Ok(())
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/$",
        with_methods(
            &[Method::GET],
            middleware.with_libvirt(|_, _, response, context| {
                let snapshots = context
                    .session
                    .list_domains()?
                    .into_iter()
                    .map(|handle| Domain::new(handle).snapshot())
                    .collect::<Result<Vec<DomainSnapshot>, _>>()?;
                write_json(response, StatusCode::OK, &snapshots)
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/([^/]+)/$",
        with_methods(
            &[Method::GET],
            middleware.with_libvirt_domain(|_, _, response, _, domain| {
                write_snapshot(response, domain)
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/([^/]+)/start/$",
        with_methods(
            &[Method::POST],
            middleware.with_libvirt_domain(|_, _, response, _, domain| {
                domain.start()?;
                write_snapshot(response, domain)
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/([^/]+)/shutdown/$",
        with_methods(
            &[Method::POST],
            middleware.with_libvirt_domain(move |_, _, response, _, domain| {
                domain.shutdown(settings.shutdown_timeout, settings.shutdown_poll)?;
                write_snapshot(response, domain)
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/([^/]+)/autostart/$",
        with_methods(
            &[Method::POST, Method::DELETE],
            middleware.with_libvirt_domain(|_, request, response, _, domain| {
                domain.set_autostart(request.method() == Method::POST)?;
                write_snapshot(response, domain)
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/([^/]+)/metadata/$",
        with_methods(
            &[Method::GET, Method::POST],
            middleware.with_libvirt_domain(|_, request, response, _, domain| {
                if request.method() == Method::POST {
                    let body: MetadataBody = parse_json(request)?;
                    let Some(metadata) = body.metadata else {
                        return Err(HandlerError::bad_request("metadata must be a string"));
                    };
                    domain.set_metadata(&metadata)?;
                }
                let metadata = domain.metadata()?;
                write_json(response, StatusCode::OK, &MetadataBody { metadata })
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/([^/]+)/xml/$",
        with_methods(
            &[Method::GET],
            middleware.with_libvirt_domain(|_, _, response, _, domain| {
                let xml = domain.xml_description()?;
                write_json(response, StatusCode::OK, &json!({ "xml": xml }))
            }),
        ),
    )?;

    router.register(
        r"^/users/([^/]+)/domains/([^/]+)/disks/([^/]+)/$",
        with_methods(
            &[Method::GET],
            middleware.with_libvirt_domain(|route_match, _, response, _, domain| {
                let disk = route_match
                    .get(DISK_GROUP)
                    .ok_or_else(|| HandlerError::bad_request("missing disk name"))?;
                let info = domain.block_info(disk)?;
                write_json(response, StatusCode::OK, &info)
            }),
        ),
    )?;

    Ok(router)
}

fn write_snapshot(response: &mut Response, domain: &Domain) -> Result<(), HandlerError> {
    let snapshot = domain.snapshot()?;
    write_json(response, StatusCode::OK, &snapshot)
}

//! Composable route decorators.
//!
//! Each decorator wraps a handler and returns a [`Handler`]. The intended
//! nesting is `with_methods` outermost, then one of the user, hypervisor, or
//! domain decorators; each inner layer runs only when the outer one let the
//! request through.

use std::sync::Arc;

use hyper::header::{self, HeaderValue};
use hyper::{Method, StatusCode};

use crate::hypervisor::{ConnectionPool, Domain, HypervisorConnection, Session};
use crate::users::{UserAccount, UserResolver};

use super::errors::HandlerError;
use super::request::{Request, RouteMatch};
use super::response::{Response, write_error};
use super::router::Handler;

/// Capture group holding the username.
const USER_GROUP: usize = 1;
/// Capture group holding the domain name.
const DOMAIN_GROUP: usize = 2;

/// Restricts `handler` to `allowed` methods.
///
/// Every response carries an `Allow` header listing `allowed` plus `OPTIONS`.
/// `OPTIONS` requests return immediately with an empty body; other methods
/// outside the list get 405 without reaching `handler`.
pub fn with_methods(allowed: &[Method], handler: Handler) -> Handler {
    let allowed: Vec<Method> = allowed.to_vec();
    let allow = allowed
        .iter()
        .map(Method::as_str)
        .chain(std::iter::once(Method::OPTIONS.as_str()))
        .collect::<Vec<_>>()
        .join(", ");
    Arc::new(move |route_match: &RouteMatch, request: &Request, response: &mut Response| {
        if let Ok(value) = HeaderValue::from_str(&allow) {
            response.headers_mut().insert(header::ALLOW, value);
        }
        if request.method() == Method::OPTIONS {
            return Ok(());
        }
        if !allowed.contains(request.method()) {
            write_error(response, StatusCode::METHOD_NOT_ALLOWED, "Method not allowed");
            return Ok(());
        }
        handler(route_match, request, response)
    })
}

/// A user's live hypervisor session, handed to handlers wrapped by
/// [`Middleware::with_libvirt`].
pub struct LibvirtContext<'a> {
    /// Resolved account.
    pub user: &'a UserAccount,
    /// Pool entry for the account.
    pub connection: Arc<HypervisorConnection>,
    /// Session held by the entry.
    pub session: Arc<dyn Session>,
}

/// Decorators that need the account resolver or the connection pool.
#[derive(Clone)]
pub struct Middleware {
    users: Arc<dyn UserResolver>,
    pool: Arc<ConnectionPool>,
}

impl Middleware {
    /// Builds decorators over the given collaborators.
    pub fn new(users: Arc<dyn UserResolver>, pool: Arc<ConnectionPool>) -> Self {
        Self { users, pool }
    }

    /// Resolves the username in capture group 1. Unknown users get 404.
    pub fn with_user<F>(&self, handler: F) -> Handler
    where
        F: Fn(&RouteMatch, &Request, &mut Response, &UserAccount) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let users = Arc::clone(&self.users);
        Arc::new(move |route_match: &RouteMatch, request: &Request, response: &mut Response| {
            let account = route_match
                .get(USER_GROUP)
                .and_then(|name| users.resolve(name));
            match account {
                Some(account) => handler(route_match, request, response, &account),
                None => {
                    write_error(response, StatusCode::NOT_FOUND, "Unable to locate user");
                    Ok(())
                }
            }
        })
    }

    /// Resolves the user, then fetches their hypervisor session from the
    /// pool, connecting it when needed. Connect failures get 500.
    pub fn with_libvirt<F>(&self, handler: F) -> Handler
    where
        F: Fn(&RouteMatch, &Request, &mut Response, &LibvirtContext<'_>) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        let pool = Arc::clone(&self.pool);
        self.with_user(move |route_match, request, response, user| {
            let connection = pool.get(&user.name);
            let Some(session) = connection.session() else {
                write_error(
                    response,
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Unable to connect to libvirt",
                );
                return Ok(());
            };
            let context = LibvirtContext {
                user,
                connection,
                session,
            };
            handler(route_match, request, response, &context)
        })
    }

    /// Resolves user and session, then looks up the domain named in capture
    /// group 2. Unknown domains get 404.
    pub fn with_libvirt_domain<F>(&self, handler: F) -> Handler
    where
        F: Fn(
                &RouteMatch,
                &Request,
                &mut Response,
                &LibvirtContext<'_>,
                &Domain,
            ) -> Result<(), HandlerError>
            + Send
            + Sync
            + 'static,
    {
        self.with_libvirt(move |route_match, request, response, context| {
            let found = match route_match.get(DOMAIN_GROUP) {
                Some(name) => context.session.lookup_domain(name)?,
                None => None,
            };
            match found {
                Some(handle) => handler(route_match, request, response, context, &Domain::new(handle)),
                None => {
                    write_error(response, StatusCode::NOT_FOUND, "Domain not found");
                    Ok(())
                }
            }
        })
    }
}

//! Regex route table with retrying, logged dispatch.
//!
//! Routes are tried in registration order and the first pattern that matches
//! the request path wins. A matched handler runs inside the retry executor
//! with a fresh default response per attempt; panics are caught and reported
//! as fatal errors so a handler bug never takes a reactor thread down.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use hyper::{Method, StatusCode};
use regex::Regex;
use tracing::{error, info};

use super::errors::{HandlerError, RouteError};
use super::request::{Request, RouteMatch};
use super::response::{Response, default_response, empty_response, error_response, redirect};
use super::retry;

/// Tracing target for routing and access logs.
pub(crate) const ROUTER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::router");

/// A route handler.
///
/// Handlers mutate the response they are given; returning an error discards
/// that response in favour of one derived from the error.
pub type Handler =
    Arc<dyn Fn(&RouteMatch, &Request, &mut Response) -> Result<(), HandlerError> + Send + Sync>;

struct Route {
    pattern: Regex,
    handler: Handler,
}

/// Ordered route table.
pub struct Router {
    routes: Vec<Route>,
    retries: usize,
}

impl Router {
    /// Creates an empty table that grants each handler `retries` re-runs.
    #[must_use]
    pub fn new(retries: usize) -> Self {
        Self {
            routes: Vec::new(),
            retries,
        }
    }

    /// Appends a route.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::Pattern`] when `pattern` does not compile.
    pub fn register(&mut self, pattern: &str, handler: Handler) -> Result<(), RouteError> {
        let compiled = Regex::new(pattern).map_err(|source| RouteError::Pattern {
            pattern: pattern.to_owned(),
            source: Box::new(source),
        })?;
        self.routes.push(Route {
            pattern: compiled,
            handler,
        });
        Ok(())
    }

    /// Number of registered routes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// True when no route has been registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Produces the response for `request`. Blocks for as long as the matched
    /// handler does.
    pub fn dispatch(&self, request: &Request) -> Response {
        let started = Instant::now();
        let path = request.uri().path();
        let matched = self.routes.iter().find_map(|route| {
            route
                .pattern
                .captures(path)
                .map(|captures| (route, RouteMatch::from_captures(&captures)))
        });
        let response = match matched {
            Some((route, route_match)) => self.run(route, &route_match, request),
            None => unmatched(request),
        };
        log_access(request, &response, started.elapsed());
        response
    }

    fn run(&self, route: &Route, route_match: &RouteMatch, request: &Request) -> Response {
        let outcome = retry::execute(self.retries, || {
            let mut response = default_response();
            invoke(&route.handler, route_match, request, &mut response).map(|()| response)
        });
        outcome.unwrap_or_else(|error| error_response(error.status(), &error.to_string()))
    }
}

fn invoke(
    handler: &Handler,
    route_match: &RouteMatch,
    request: &Request,
    response: &mut Response,
) -> Result<(), HandlerError> {
    panic::catch_unwind(AssertUnwindSafe(|| handler(route_match, request, response)))
        .unwrap_or_else(|payload| Err(HandlerError::fatal(panic_message(payload.as_ref()))))
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "handler panicked".to_owned()
    }
}

fn unmatched(request: &Request) -> Response {
    if request.method() == Method::OPTIONS {
        return empty_response(StatusCode::NOT_FOUND);
    }
    let path = request.uri().path();
    if path.ends_with('/') {
        return error_response(StatusCode::NOT_FOUND, "Not found");
    }
    let location = match request.uri().query() {
        Some(query) => format!("{path}/?{query}"),
        None => format!("{path}/"),
    };
    redirect(&location)
}

fn log_access(request: &Request, response: &Response, elapsed: Duration) {
    let status = response.status().as_u16();
    let bytes = response.body().len();
    let elapsed_ms = elapsed.as_millis();
    let method = request.method().as_str();
    let path = request.uri().path();
    let version = request.version();
    if status < 400 {
        info!(target: ROUTER_TARGET, method, path, ?version, status, bytes, elapsed_ms, "request served");
    } else {
        error!(target: ROUTER_TARGET, method, path, ?version, status, bytes, elapsed_ms, "request failed");
    }
}

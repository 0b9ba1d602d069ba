//! HTTP request dispatch.
//!
//! The transport hands each buffered request to [`Router::dispatch`] on a
//! blocking thread. The router picks the first route whose pattern matches the
//! path and runs its handler under the retry executor. Handlers are built by
//! nesting the middleware decorators around a closure, so method checks
//! run before account lookup, account lookup before the pool is touched, and
//! the pool before any domain lookup.
//!
//! ```text
//! with_methods([GET])            405, or OPTIONS with no body
//!   └─ user lookup               404 "Unable to locate user"
//!        └─ pool lookup          500 "Unable to connect to libvirt"
//!             └─ domain lookup   404 "Domain not found"
//!                  └─ handler
//! ```

mod errors;
mod middleware;
mod request;
mod response;
mod retry;
mod router;
mod routes;

pub use self::errors::{HandlerError, RouteError};
pub use self::middleware::{LibvirtContext, Middleware, with_methods};
pub use self::request::{Request, RouteMatch, parse_json};
pub use self::response::{
    EventSubscription, Response, default_response, error_response, write_error, write_json,
};
pub use self::retry::execute as retry;
pub use self::router::{Handler, Router};
pub use self::routes::{RouteSettings, build_router};

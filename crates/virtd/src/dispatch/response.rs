//! Response construction helpers.
//!
//! Every response body the daemon produces itself is JSON. Errors carry a
//! single `detail` field holding a human-readable message.

use bytes::Bytes;
use hyper::header::{self, HeaderValue};
use hyper::StatusCode;
use serde::Serialize;
use serde_json::json;

use crate::users::UserAccount;

use super::errors::HandlerError;

/// A fully buffered HTTP response.
pub type Response = hyper::Response<Bytes>;

fn json_content_type() -> HeaderValue {
    HeaderValue::from_static("application/json")
}

/// Marker placed in a response's extensions by the events route once the
/// requesting user has been resolved and connected.
///
/// The transport upgrades a WebSocket handshake only when the router's
/// response is successful and carries this marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventSubscription {
    /// Account the socket subscribes for.
    pub user: UserAccount,
}

/// 200 response with a JSON content type and no body.
#[must_use]
pub fn default_response() -> Response {
    let mut response = Response::new(Bytes::new());
    response.headers_mut().insert(header::CONTENT_TYPE, json_content_type());
    response
}

/// Serialises `value` into the body and sets `status`.
///
/// # Errors
///
/// Returns [`HandlerError::Fatal`] when `value` cannot be serialised.
pub fn write_json<T: Serialize + ?Sized>(
    response: &mut Response,
    status: StatusCode,
    value: &T,
) -> Result<(), HandlerError> {
    let body = serde_json::to_vec(value)
        .map_err(|error| HandlerError::fatal(format!("failed to encode response: {error}")))?;
    *response.status_mut() = status;
    response.headers_mut().insert(header::CONTENT_TYPE, json_content_type());
    *response.body_mut() = Bytes::from(body);
    Ok(())
}

/// Sets `status` and a `{"detail": ...}` body.
pub fn write_error(response: &mut Response, status: StatusCode, detail: &str) {
    *response.status_mut() = status;
    response.headers_mut().insert(header::CONTENT_TYPE, json_content_type());
    *response.body_mut() = Bytes::from(json!({ "detail": detail }).to_string());
}

/// Fresh response carrying `status` and a `{"detail": ...}` body.
#[must_use]
pub fn error_response(status: StatusCode, detail: &str) -> Response {
    let mut response = default_response();
    write_error(&mut response, status, detail);
    response
}

/// Empty response with no content type.
#[must_use]
pub fn empty_response(status: StatusCode) -> Response {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = status;
    response
}

/// 307 pointing at `location`.
#[must_use]
pub fn redirect(location: &str) -> Response {
    let mut response = empty_response(StatusCode::TEMPORARY_REDIRECT);
    if let Ok(value) = HeaderValue::from_str(location) {
        response.headers_mut().insert(header::LOCATION, value);
    }
    response
}

//! Request-side types shared by the router, middleware, and handlers.

use bytes::Bytes;
use regex::Captures;
use serde::de::DeserializeOwned;

use super::errors::HandlerError;

/// A fully buffered HTTP request.
pub type Request = hyper::Request<Bytes>;

/// Capture groups produced by a route pattern.
///
/// Index 0 is the whole matched path; numbered groups follow.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RouteMatch {
    groups: Vec<Option<String>>,
}

impl RouteMatch {
    /// Builds a match from explicit groups.
    #[must_use]
    pub fn new(groups: Vec<Option<String>>) -> Self {
        Self { groups }
    }

    pub(crate) fn from_captures(captures: &Captures<'_>) -> Self {
        Self {
            groups: captures
                .iter()
                .map(|group| group.map(|value| value.as_str().to_owned()))
                .collect(),
        }
    }

    /// Capture group `index`, when it participated in the match.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<&str> {
        self.groups.get(index).and_then(Option::as_deref)
    }
}

/// Parses the request body as JSON.
///
/// # Errors
///
/// Returns [`HandlerError::BadRequest`] when the body is not valid JSON for `T`.
pub fn parse_json<T: DeserializeOwned>(request: &Request) -> Result<T, HandlerError> {
    serde_json::from_slice(request.body())
        .map_err(|error| HandlerError::bad_request(format!("malformed request body: {error}")))
}

#[cfg(test)]
mod tests {
    use regex::Regex;
    use serde::Deserialize;

    use super::*;

    #[derive(Debug, Deserialize)]
    struct Body {
        metadata: String,
    }

    #[test]
    fn exposes_capture_groups() {
        let pattern = Regex::new(r"^/users/([^/]+)/domains/([^/]+)?/?$").expect("pattern");
        let captures = pattern.captures("/users/alice/domains/").expect("matches");
        let matched = RouteMatch::from_captures(&captures);

        assert_eq!(matched.get(0), Some("/users/alice/domains/"));
        assert_eq!(matched.get(1), Some("alice"));
        assert_eq!(matched.get(2), None);
        assert_eq!(matched.get(9), None);
    }

    #[test]
    fn parses_json_bodies() {
        let request = hyper::Request::new(Bytes::from_static(br#"{"metadata":"db"}"#));
        let body: Body = parse_json(&request).expect("valid body");
        assert_eq!(body.metadata, "db");
    }

    #[test]
    fn malformed_bodies_are_client_errors() {
        let request = hyper::Request::new(Bytes::from_static(b"{"));
        let error = parse_json::<Body>(&request).expect_err("invalid body");
        assert!(matches!(error, HandlerError::BadRequest { .. }));
    }
}

//! Cross-origin headers for the polling endpoint.
//!
//! Browsers poll from pages served by other origins, with credentials, so
//! the request's `Origin` is reflected back rather than answered with `*`.

use http::{
    HeaderMap, HeaderValue,
    header::{
        ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
        ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_EXPOSE_HEADERS,
        ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, VARY,
    },
};

use crate::SESSION_ID_HEADER;

/// Add the cross-origin headers for a request carrying `request` headers.
///
/// Requests without an `Origin` get nothing.
pub fn apply(request: &HeaderMap, response: &mut HeaderMap) {
    let Some(origin) = request.get(ORIGIN) else {
        return;
    };

    response.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin.clone());
    response.insert(
        ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    response.append(VARY, HeaderValue::from_static("Origin"));
    response.insert(
        ACCESS_CONTROL_EXPOSE_HEADERS,
        HeaderValue::from_static(SESSION_ID_HEADER),
    );
}

/// Add the preflight-only headers on top of [`apply`].
pub fn apply_preflight(request: &HeaderMap, response: &mut HeaderMap) {
    apply(request, response);
    if !response.contains_key(ACCESS_CONTROL_ALLOW_ORIGIN) {
        return;
    }

    response.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, OPTIONS"),
    );
    let allowed = request
        .get(ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("content-type"));
    response.insert(ACCESS_CONTROL_ALLOW_HEADERS, allowed);
}

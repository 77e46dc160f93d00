use bytes::Bytes;
use hyper::header::{
    HeaderValue, ACCESS_CONTROL_ALLOW_CREDENTIALS, ACCESS_CONTROL_ALLOW_HEADERS,
    ACCESS_CONTROL_ALLOW_METHODS, ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE,
    ACCESS_CONTROL_REQUEST_HEADERS, ORIGIN, VARY,
};
use hyper::{HeaderMap, Response, StatusCode};

use crate::config::CorsConfig;

const MAX_AGE_SECS: &str = "86400";

/// Empty 204 answer to a browser preflight.
pub fn preflight_response(policy: &CorsConfig, request_headers: &HeaderMap) -> Response<Bytes> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::NO_CONTENT;
    if policy.enabled {
        add_cors_headers(policy, request_headers, response.headers_mut());
    }
    response
}

pub fn add_cors_headers(policy: &CorsConfig, request_headers: &HeaderMap, headers: &mut HeaderMap) {
    // A disallowed origin just gets no allow-origin header; the browser enforces the rest.
    if let Some(origin) = allowed_origin(policy, request_headers) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        headers.append(VARY, HeaderValue::from_static("Origin"));
    }

    if let Ok(methods) = HeaderValue::from_str(&policy.methods.join(", ")) {
        headers.insert(ACCESS_CONTROL_ALLOW_METHODS, methods);
    }

    let allow_headers = merged_headers(policy, request_headers);
    if !allow_headers.is_empty() {
        if let Ok(value) = HeaderValue::from_str(&allow_headers.join(", ")) {
            headers.insert(ACCESS_CONTROL_ALLOW_HEADERS, value);
        }
    }

    if policy.credentials {
        headers.insert(ACCESS_CONTROL_ALLOW_CREDENTIALS, HeaderValue::from_static("true"));
    }

    headers.insert(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static(MAX_AGE_SECS));
}

fn allowed_origin(policy: &CorsConfig, request_headers: &HeaderMap) -> Option<HeaderValue> {
    let origin = request_headers.get(ORIGIN)?;
    let origin_str = origin.to_str().ok()?;
    policy
        .origins
        .iter()
        .any(|o| o == "*" || o == origin_str)
        .then(|| origin.clone())
}

/// Configured headers followed by whatever the browser asked for, without repeats.
fn merged_headers(policy: &CorsConfig, request_headers: &HeaderMap) -> Vec<String> {
    let requested = request_headers
        .get_all(ACCESS_CONTROL_REQUEST_HEADERS)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .filter(|h| !h.is_empty())
        .map(str::to_string);

    let mut merged: Vec<String> = Vec::new();
    for header in policy.allowed_headers.iter().cloned().chain(requested) {
        if !merged.iter().any(|h| h.eq_ignore_ascii_case(&header)) {
            merged.push(header);
        }
    }
    merged
}

use std::convert::Infallible;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::BoxFuture;
use hyper::client::HttpConnector;
use hyper::header::{HeaderName, HeaderValue, HOST};
use hyper::{Body, Client, HeaderMap, Method, Request, Response, StatusCode, Uri};
use tokio::time::timeout;
use tracing::{debug, error};
use warp::Reply;

use crate::config::{BACKEND_BASE, REQUEST_TIMEOUT_SECS, STRIP_PATH_PREFIX};
use crate::errors::GatewayError;
use crate::middleware::ApiMiddleware;
use crate::versioning::ApiRequest;


pub type HandlerFuture = BoxFuture<'static, Result<Response<Bytes>, GatewayError>>;

/// Business logic behind the middleware. `api` is only present for
/// requests under the API prefix while versioning is enabled.
pub trait Handler: Send + Sync + 'static {
    fn call(&self, req: Request<Bytes>, api: Option<ApiRequest>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Bytes>, Option<ApiRequest>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Response<Bytes>, GatewayError>> + Send + 'static,
{
    fn call(&self, req: Request<Bytes>, api: Option<ApiRequest>) -> HandlerFuture {
        Box::pin(self(req, api))
    }
}

/// Forwards requests to the planner backend.
#[derive(Clone)]
pub struct ProxyHandler {
    client: Client<HttpConnector>,
    backend: String,
    timeout: Duration,
    version_header: String,
}

impl ProxyHandler {
    pub fn new(version_header: &str) -> Self {
        Self {
            client: Client::new(),
            backend: BACKEND_BASE.to_string(),
            timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            version_header: version_header.to_string(),
        }
    }

    pub fn with_backend(mut self, backend: impl Into<String>) -> Self {
        self.backend = backend.into();
        self
    }

    async fn forward(
        self,
        req: Request<Bytes>,
        api: Option<ApiRequest>,
    ) -> Result<Response<Bytes>, GatewayError> {
        let (parts, body) = req.into_parts();
        let path = api
            .as_ref()
            .map(|a| a.normalized_path.as_str())
            .unwrap_or_else(|| parts.uri.path());
        let uri = upstream_uri(&self.backend, path, parts.uri.query())?;

        // Upstream sees the negotiated version even when it came from the URL.
        let version = api.as_ref().and_then(|a| {
            let name = HeaderName::from_bytes(self.version_header.as_bytes()).ok()?;
            let value = HeaderValue::from_str(&a.requested_version).ok()?;
            Some((name, value))
        });

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        for (name, value) in parts.headers.iter() {
            let replaced = version.as_ref().map_or(false, |(v, _)| v == name);
            if *name != HOST && !replaced {
                builder = builder.header(name, value);
            }
        }
        if let Some((name, value)) = version {
            builder = builder.header(name, value);
        }
        let upstream_req = builder.body(Body::from(body))?;

        let response = match timeout(self.timeout, self.client.request(upstream_req)).await {
            Ok(result) => result.map_err(|e| {
                error!(error = %e, "error forwarding request");
                GatewayError::from(e)
            })?,
            Err(_) => return Err(GatewayError::Timeout),
        };

        let (parts, body) = response.into_parts();
        let body_bytes = hyper::body::to_bytes(body).await?;
        Ok(Response::from_parts(parts, body_bytes))
    }
}

impl Handler for ProxyHandler {
    fn call(&self, req: Request<Bytes>, api: Option<ApiRequest>) -> HandlerFuture {
        Box::pin(self.clone().forward(req, api))
    }
}

pub fn upstream_uri(backend: &str, path: &str, query: Option<&str>) -> Result<Uri, GatewayError> {
    let path = path.strip_prefix(STRIP_PATH_PREFIX).unwrap_or(path);
    let mut uri_str = format!("{}{}", backend, path);
    if let Some(query) = query.filter(|q| !q.is_empty()) {
        uri_str.push('?');
        uri_str.push_str(query);
    }

    uri_str.parse().map_err(|e: hyper::http::uri::InvalidUri| {
        error!(uri = %uri_str, error = %e, "failed to parse upstream URI");
        GatewayError::InvalidUri(e.to_string())
    })
}

pub async fn stats_reply(middleware: Arc<ApiMiddleware>) -> Result<impl Reply, Infallible> {
    Ok(warp::reply::json(&middleware.get_stats().await))
}

/// Rebuilds the request warp took apart so the middleware can own it.
/// A path and query that do not form a valid URI is the client's fault.
pub fn inbound_request(
    method: Method,
    headers: HeaderMap,
    path: &str,
    query: &str,
    body: Bytes,
) -> Result<Request<Bytes>, GatewayError> {
    let mut uri = path.to_string();
    if !query.is_empty() {
        uri.push('?');
        uri.push_str(query);
    }

    let mut req = Request::builder()
        .method(method)
        .uri(uri.as_str())
        .body(body)
        .map_err(|e| GatewayError::InvalidUri(e.to_string()))?;
    *req.headers_mut() = headers;
    Ok(req)
}

/// Handler failures never get here; the middleware answers those itself.
pub async fn handle_rejection(err: warp::Rejection) -> Result<impl Reply, Infallible> {
    let (code, message) = if err.is_not_found() {
        (StatusCode::NOT_FOUND, "Not Found")
    } else if let Some(GatewayError::InvalidUri(reason)) = err.find::<GatewayError>() {
        debug!(reason = %reason, "rejected malformed request");
        (StatusCode::BAD_REQUEST, "Bad request")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
    };

    Ok(warp::reply::with_status(message.to_string(), code))
}

//! The request pipeline: preflight, rate limit, logging, version
//! negotiation, handler dispatch, CORS stamping and metrics, in that order.

pub mod cors;

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use chrono::Utc;
use futures::FutureExt;
use hyper::header::{HeaderName, HeaderValue, RETRY_AFTER, USER_AGENT};
use hyper::{Method, Request, Response};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{LoggingConfig, MiddlewareConfig, API_PREFIX};
use crate::errors::GatewayError;
use crate::handlers::Handler;
use crate::models::{ErrorBody, PathStats};
use crate::services::{client_ip, client_key, MetricsCollector, RateLimitDecision, RateLimiter};
use crate::versioning::{ApiEndpoint, ApiRequest, VersionManager};


pub struct ApiMiddleware {
    config: MiddlewareConfig,
    versions: VersionManager,
    rate_limiter: Arc<RateLimiter>,
    metrics: MetricsCollector,
    handler: Box<dyn Handler>,
}

impl ApiMiddleware {
    pub fn new(config: MiddlewareConfig, handler: impl Handler) -> Self {
        Self {
            versions: VersionManager::new(config.versioning.clone()),
            rate_limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            metrics: MetricsCollector::new(),
            handler: Box::new(handler),
            config,
        }
    }

    /// Endpoint constraints are registered before the middleware is shared.
    pub fn register_endpoint(&mut self, path: impl Into<String>, endpoint: ApiEndpoint) {
        self.versions.register_endpoint(path, endpoint);
    }

    pub async fn handle(&self, req: Request<Bytes>) -> Response<Bytes> {
        let started = Instant::now();

        if req.method() == Method::OPTIONS {
            return cors::preflight_response(&self.config.cors, req.headers());
        }

        if self.config.rate_limit.enabled {
            let key = client_key(req.headers());
            let decision = self.rate_limiter.check(&key).await;
            if !decision.allowed {
                warn!(
                    client = %key,
                    path = %req.uri().path(),
                    limit = decision.limit,
                    "rate limit exceeded"
                );
                return rate_limited_response(&decision);
            }
        }

        if self.config.logging.enabled {
            self.log_request(&req);
        }

        let method = req.method().clone();
        let path = req.uri().path().to_string();
        let request_headers = req.headers().clone();

        let mut response = match self.dispatch(req).await {
            Ok(response) => response,
            Err(e) => {
                error!(method = %method, path = %path, error = %e, "request handler failed");
                ErrorBody::MiddlewareError {
                    message: "Internal server error".to_string(),
                    timestamp: Utc::now().to_rfc3339(),
                }
                .into_response()
            }
        };

        if self.config.cors.enabled {
            cors::add_cors_headers(&self.config.cors, &request_headers, response.headers_mut());
        }

        let status = response.status().as_u16();
        if self.config.metrics_enabled {
            self.metrics.collect(&path, started, status).await;
        }

        if self.config.logging.enabled && self.config.logging.log_responses {
            info!(
                method = %method,
                path = %path,
                status,
                duration_ms = started.elapsed().as_millis() as u64,
                "request completed"
            );
        }

        response
    }

    async fn dispatch(&self, req: Request<Bytes>) -> Result<Response<Bytes>, GatewayError> {
        if !self.config.versioning.enabled || !is_api_path(req.uri().path()) {
            return self.invoke(req, None).await;
        }

        let api = self.versions.parse_request(&req);
        let validation = self.versions.validate_version(&api);
        for warning in &validation.warnings {
            warn!(
                path = %api.original_path,
                version = %api.requested_version,
                warning = %warning,
                "api version warning"
            );
        }
        if !validation.valid {
            return Ok(self.versions.create_error_response(
                &api,
                validation.errors,
                validation.warnings,
            ));
        }

        let response = self.invoke(req, Some(api.clone())).await?;
        Ok(self.versions.process_response(&api, response))
    }

    /// Runs the handler, turning a panic into an error like any other failure.
    async fn invoke(
        &self,
        req: Request<Bytes>,
        api: Option<ApiRequest>,
    ) -> Result<Response<Bytes>, GatewayError> {
        let handler = &self.handler;
        let call = async move { handler.call(req, api).await };
        match AssertUnwindSafe(call).catch_unwind().await {
            Ok(result) => result,
            Err(panic) => Err(GatewayError::Handler(panic_message(panic))),
        }
    }

    fn log_request(&self, req: &Request<Bytes>) {
        let (headers, body) = captured_request_parts(&self.config.logging, req);
        let user_agent = req
            .headers()
            .get(USER_AGENT)
            .and_then(|h| h.to_str().ok())
            .unwrap_or("");

        info!(
            method = %req.method(),
            path = %req.uri().path(),
            query = req.uri().query().unwrap_or(""),
            client_ip = %client_ip(req.headers()),
            user_agent,
            headers = headers.as_deref(),
            body = body.as_deref(),
            "incoming request"
        );
    }

    pub async fn get_stats(&self) -> HashMap<String, PathStats> {
        self.metrics.snapshot().await
    }

    /// Clears both the per-path stats and the rate limit store.
    pub async fn reset_stats(&self) {
        self.metrics.reset().await;
        self.rate_limiter.clear().await;
    }

    pub async fn rate_limit_entries(&self) -> usize {
        self.rate_limiter.len().await
    }

    pub fn spawn_rate_limit_sweeper(&self) -> Option<JoinHandle<()>> {
        let config = &self.config.rate_limit;
        config
            .enabled
            .then(|| Arc::clone(&self.rate_limiter).spawn_sweeper(config.sweep_interval))
    }
}

fn is_api_path(path: &str) -> bool {
    path.strip_prefix(API_PREFIX)
        .map_or(false, |rest| rest.is_empty() || rest.starts_with('/'))
}

/// Headers and body text for the request log, each only when configured.
/// Absent parts are left out of the event rather than logged as empty.
fn captured_request_parts(
    logging: &LoggingConfig,
    req: &Request<Bytes>,
) -> (Option<String>, Option<String>) {
    let headers = logging.log_headers.then(|| format!("{:?}", req.headers()));
    let body = logging
        .log_body
        .then(|| String::from_utf8_lossy(req.body()).into_owned());
    (headers, body)
}

fn rate_limited_response(decision: &RateLimitDecision) -> Response<Bytes> {
    let mut response = ErrorBody::RateLimitExceeded {
        message: "Too many requests, please try again later.".to_string(),
        retry_after: decision.retry_after_secs,
    }
    .into_response();

    let headers = response.headers_mut();
    headers.insert(
        HeaderName::from_static("x-ratelimit-limit"),
        HeaderValue::from(decision.limit),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-remaining"),
        HeaderValue::from(0u32),
    );
    headers.insert(
        HeaderName::from_static("x-ratelimit-reset"),
        HeaderValue::from(decision.reset_unix_secs()),
    );
    headers.insert(RETRY_AFTER, HeaderValue::from(decision.retry_after_secs));
    response
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::Value;

use planner_gateway::config::{CorsConfig, MiddlewareConfig, RateLimitConfig};
use planner_gateway::versioning::VersionSource;
use planner_gateway::{ApiEndpoint, ApiMiddleware, ApiRequest, GatewayError};

async fn ok_handler(
    _req: Request<Bytes>,
    _api: Option<ApiRequest>,
) -> Result<Response<Bytes>, GatewayError> {
    Ok(Response::new(Bytes::from_static(b"ok")))
}

async fn not_found_handler(
    _req: Request<Bytes>,
    _api: Option<ApiRequest>,
) -> Result<Response<Bytes>, GatewayError> {
    let mut response = Response::new(Bytes::new());
    *response.status_mut() = StatusCode::NOT_FOUND;
    Ok(response)
}

async fn failing_handler(
    _req: Request<Bytes>,
    _api: Option<ApiRequest>,
) -> Result<Response<Bytes>, GatewayError> {
    Err(GatewayError::Handler("database unavailable".to_string()))
}

async fn panicking_handler(
    _req: Request<Bytes>,
    _api: Option<ApiRequest>,
) -> Result<Response<Bytes>, GatewayError> {
    panic!("task store exploded")
}

fn request(method: Method, uri: &str) -> Request<Bytes> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header("x-forwarded-for", "198.51.100.4")
        .header("user-agent", "planner-tests")
        .body(Bytes::new())
        .unwrap()
}

fn json(response: &Response<Bytes>) -> Value {
    serde_json::from_slice(response.body()).unwrap()
}

#[tokio::test]
async fn test_handler_receives_resolved_version() {
    let seen: Arc<Mutex<Option<ApiRequest>>> = Arc::new(Mutex::new(None));
    let captured = Arc::clone(&seen);
    let handler = move |_req: Request<Bytes>, api: Option<ApiRequest>| {
        *captured.lock().unwrap() = api;
        async { Ok::<_, GatewayError>(Response::new(Bytes::from_static(b"ok"))) }
    };
    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), handler);

    let mut req = request(Method::GET, "/api/v1.0/users");
    req.headers_mut().insert("api-version", "2.0".parse().unwrap());
    let response = middleware.handle(req).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-api-version").unwrap(), "1.0");
    assert_eq!(response.headers().get("x-api-version-source").unwrap(), "url");
    assert_eq!(response.headers().get("x-api-current-version").unwrap(), "1.0");

    let api = seen.lock().unwrap().clone().unwrap();
    assert_eq!(api.version_source, VersionSource::Url);
    assert_eq!(api.normalized_path, "/api/users");
}

#[tokio::test]
async fn test_non_api_path_skips_versioning() {
    let seen = Arc::new(Mutex::new(true));
    let captured = Arc::clone(&seen);
    let handler = move |_req: Request<Bytes>, api: Option<ApiRequest>| {
        *captured.lock().unwrap() = api.is_some();
        async { Ok::<_, GatewayError>(Response::new(Bytes::new())) }
    };
    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), handler);

    let response = middleware.handle(request(Method::GET, "/health")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("x-api-version").is_none());
    assert!(!*seen.lock().unwrap());
}

#[tokio::test]
async fn test_endpoint_constraint_rejects_version() {
    let mut middleware = ApiMiddleware::new(MiddlewareConfig::default(), ok_handler);
    middleware.register_endpoint("/api/users", ApiEndpoint::new(["1.0"]));

    let response = middleware.handle(request(Method::GET, "/api/v2/users")).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let body = json(&response);
    assert_eq!(body["error"], "API_VERSION_ERROR");
    assert_eq!(body["details"]["requestedVersion"], "2");
    assert!(body["details"]["errors"][0]
        .as_str()
        .unwrap()
        .contains("/api/users"));

    // Version errors still count against the path and carry CORS headers
    assert!(response
        .headers()
        .get("access-control-max-age")
        .is_some());
    let stats = middleware.get_stats().await;
    assert_eq!(stats["/api/v2/users"].error_count, 1);
}

#[tokio::test]
async fn test_preflight_short_circuits() {
    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), panicking_handler);

    let mut req = request(Method::OPTIONS, "/api/users");
    req.headers_mut()
        .insert("origin", "http://example.com".parse().unwrap());
    let response = middleware.handle(req).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "http://example.com"
    );
    assert!(middleware.get_stats().await.is_empty());
}

#[tokio::test]
async fn test_preflight_with_restricted_origins() {
    let config = MiddlewareConfig {
        cors: CorsConfig {
            origins: vec!["http://other.com".to_string()],
            ..CorsConfig::default()
        },
        ..MiddlewareConfig::default()
    };
    let middleware = ApiMiddleware::new(config, ok_handler);

    let mut req = request(Method::OPTIONS, "/api/users");
    req.headers_mut()
        .insert("origin", "http://example.com".parse().unwrap());
    let response = middleware.handle(req).await;

    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert!(response
        .headers()
        .get("access-control-allow-origin")
        .is_none());
}

#[tokio::test]
async fn test_rate_limit_rejects_third_request() {
    let config = MiddlewareConfig {
        rate_limit: RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
            ..RateLimitConfig::default()
        },
        ..MiddlewareConfig::default()
    };
    let middleware = ApiMiddleware::new(config, ok_handler);

    for _ in 0..2 {
        let response = middleware.handle(request(Method::GET, "/api/plans")).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = middleware.handle(request(Method::GET, "/api/plans")).await;
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(response.headers().get("x-ratelimit-remaining").unwrap(), "0");
    assert_eq!(response.headers().get("x-ratelimit-limit").unwrap(), "2");
    assert!(response.headers().get("retry-after").is_some());
    assert_eq!(json(&response)["error"], "RATE_LIMIT_EXCEEDED");

    // Another client is unaffected
    let mut other = request(Method::GET, "/api/plans");
    other
        .headers_mut()
        .insert("x-forwarded-for", "203.0.113.9".parse().unwrap());
    assert_eq!(middleware.handle(other).await.status(), StatusCode::OK);

    // Rejected requests are not recorded as completed
    let stats = middleware.get_stats().await;
    assert_eq!(stats["/api/plans"].request_count, 3);
}

#[tokio::test]
async fn test_metrics_count_requests_and_errors() {
    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), ok_handler);
    middleware.handle(request(Method::GET, "/api/tags")).await;
    middleware.handle(request(Method::GET, "/api/tags")).await;

    let stats = middleware.get_stats().await;
    assert_eq!(stats["/api/tags"].request_count, 2);
    assert_eq!(stats["/api/tags"].error_count, 0);

    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), not_found_handler);
    let response = middleware.handle(request(Method::GET, "/api/tags/9")).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(middleware.get_stats().await["/api/tags/9"].error_count, 1);
}

#[tokio::test]
async fn test_handler_error_becomes_500() {
    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), failing_handler);
    let response = middleware.handle(request(Method::POST, "/api/tasks")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let body = json(&response);
    assert_eq!(body["error"], "MIDDLEWARE_ERROR");
    assert!(body["timestamp"].is_string());
    assert!(!body["message"]
        .as_str()
        .unwrap()
        .contains("database unavailable"));

    let stats = middleware.get_stats().await;
    assert_eq!(stats["/api/tasks"].error_count, 1);
}

#[tokio::test]
async fn test_handler_panic_becomes_500() {
    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), panicking_handler);
    let response = middleware.handle(request(Method::GET, "/api/templates")).await;

    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(json(&response)["error"], "MIDDLEWARE_ERROR");
    assert_eq!(middleware.get_stats().await["/api/templates"].error_count, 1);
}

#[tokio::test]
async fn test_reset_stats_clears_everything() {
    let middleware = ApiMiddleware::new(MiddlewareConfig::default(), ok_handler);
    middleware.handle(request(Method::GET, "/api/users")).await;
    assert_eq!(middleware.get_stats().await.len(), 1);
    assert_eq!(middleware.rate_limit_entries().await, 1);

    middleware.reset_stats().await;
    assert!(middleware.get_stats().await.is_empty());
    assert_eq!(middleware.rate_limit_entries().await, 0);
}

#[tokio::test]
async fn test_strict_mode_rejects_unknown_version() {
    let mut config = MiddlewareConfig::default();
    config.versioning.strict = true;
    let middleware = ApiMiddleware::new(config, ok_handler);

    let mut req = request(Method::GET, "/api/plans");
    req.headers_mut().insert("api-version", "9.9".parse().unwrap());
    let response = middleware.handle(req).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let mut config = MiddlewareConfig::default();
    config.versioning.strict = false;
    let middleware = ApiMiddleware::new(config, ok_handler);
    let mut req = request(Method::GET, "/api/plans");
    req.headers_mut().insert("api-version", "9.9".parse().unwrap());
    let response = middleware.handle(req).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers().get("x-api-version-source").unwrap(), "header");
}

#[tokio::test]
async fn test_versioning_disabled_passes_api_paths_through() {
    let seen = Arc::new(Mutex::new(true));
    let captured = Arc::clone(&seen);
    let handler = move |_req: Request<Bytes>, api: Option<ApiRequest>| {
        *captured.lock().unwrap() = api.is_some();
        async { Ok::<_, GatewayError>(Response::new(Bytes::new())) }
    };
    let mut config = MiddlewareConfig::default();
    config.versioning.enabled = false;
    config.versioning.strict = true;
    let mut middleware = ApiMiddleware::new(config, handler);
    middleware.register_endpoint("/api/users", ApiEndpoint::new(["1.0"]));

    let response = middleware.handle(request(Method::GET, "/api/v9/users")).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(!*seen.lock().unwrap());
    assert!(response
        .headers()
        .keys()
        .all(|name| !name.as_str().starts_with("x-api-")));
}

#[tokio::test]
async fn test_cors_disabled_adds_no_headers() {
    let mut config = MiddlewareConfig::default();
    config.cors.enabled = false;
    let middleware = ApiMiddleware::new(config, ok_handler);

    let mut req = request(Method::GET, "/api/plans");
    req.headers_mut()
        .insert("origin", "http://example.com".parse().unwrap());
    let response = middleware.handle(req).await;

    assert_eq!(response.status(), StatusCode::OK);
    assert!(response
        .headers()
        .keys()
        .all(|name| !name.as_str().starts_with("access-control-")));
    assert!(response.headers().get("vary").is_none());
}

#[tokio::test]
async fn test_rate_limit_disabled_never_rejects() {
    let config = MiddlewareConfig {
        rate_limit: RateLimitConfig {
            enabled: false,
            max_requests: 1,
            ..RateLimitConfig::default()
        },
        ..MiddlewareConfig::default()
    };
    let middleware = ApiMiddleware::new(config, ok_handler);

    for _ in 0..5 {
        let response = middleware.handle(request(Method::GET, "/api/plans")).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }
    assert_eq!(middleware.rate_limit_entries().await, 0);
    assert!(middleware.spawn_rate_limit_sweeper().is_none());
}

#[tokio::test]
async fn test_metrics_disabled_records_nothing() {
    let config = MiddlewareConfig {
        metrics_enabled: false,
        ..MiddlewareConfig::default()
    };
    let middleware = ApiMiddleware::new(config, failing_handler);

    let response = middleware.handle(request(Method::GET, "/api/tags")).await;
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    assert!(middleware.get_stats().await.is_empty());
}

#[tokio::test]
async fn test_sweeper_with_zero_interval_keeps_running() {
    let config = MiddlewareConfig {
        rate_limit: RateLimitConfig {
            sweep_interval: Duration::ZERO,
            ..RateLimitConfig::default()
        },
        ..MiddlewareConfig::default()
    };
    let middleware = ApiMiddleware::new(config, ok_handler);

    let handle = middleware.spawn_rate_limit_sweeper().unwrap();
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert!(!handle.is_finished());
    handle.abort();
}

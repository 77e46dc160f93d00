use bytes::Bytes;
use hyper::{Body, HeaderMap, Method};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use warp::Filter;
use planner_gateway::{
    config::LISTEN_ADDR,
    handlers::{handle_rejection, inbound_request, stats_reply},
    ApiEndpoint,
    ApiMiddleware,
    MiddlewareConfig,
    ProxyHandler,
};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = MiddlewareConfig::from_env();
    let mut proxy = ProxyHandler::new(&config.versioning.header_name);
    if let Ok(backend) = std::env::var("GATEWAY_BACKEND") {
        proxy = proxy.with_backend(backend);
    }
    let mut middleware = ApiMiddleware::new(config, proxy);
    register_endpoints(&mut middleware);

    let middleware = Arc::new(middleware);
    let _sweeper = middleware.spawn_rate_limit_sweeper();

    let stats_state = middleware.clone();
    let middleware_filter = warp::any().map(move || middleware.clone());

    let health_check = warp::path("health")
        .and(warp::path::end())
        .and(warp::get())
        .map(|| "OK");

    let stats = warp::path("_stats")
        .and(warp::path::end())
        .and(warp::get())
        .and(warp::any().map(move || stats_state.clone()))
        .and_then(stats_reply);

    let gateway = warp::any()
        .and(warp::method())
        .and(warp::header::headers_cloned())
        .and(warp::path::full())
        .and(warp::query::raw().or_else(|_| async { Ok::<(String,), Infallible>((String::new(),)) }))
        .and(warp::body::bytes())
        .and(middleware_filter)
        .and_then(|method: Method,
                   headers: HeaderMap,
                   full_path: warp::path::FullPath,
                   query: String,
                   body: Bytes,
                   middleware: Arc<ApiMiddleware>| async move {
            let req = inbound_request(method, headers, full_path.as_str(), &query, body)
                .map_err(warp::reject::custom)?;
            let response = middleware.handle(req).await;
            Ok::<_, warp::Rejection>(response.map(Body::from))
        });

    let routes = health_check
        .or(stats)
        .or(gateway)
        .recover(handle_rejection);

    info!(addr = ?LISTEN_ADDR, "planner gateway listening");
    warp::serve(routes).run(LISTEN_ADDR).await;
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Routes whose handlers only understand some versions.
fn register_endpoints(middleware: &mut ApiMiddleware) {
    middleware.register_endpoint(
        "/api/plans",
        ApiEndpoint::new(["1.0"]).with_change("1.0: initial plan schema"),
    );
    middleware.register_endpoint(
        "/api/trash",
        ApiEndpoint::new(["1.0"]).with_change("1.0: soft-deleted items listed with restore deadline"),
    );
}

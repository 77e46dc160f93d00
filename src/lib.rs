pub mod config;
pub mod errors;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod versioning;

pub use config::MiddlewareConfig;
pub use errors::GatewayError;
pub use handlers::{Handler, ProxyHandler};
pub use middleware::ApiMiddleware;
pub use models::{ErrorBody, PathStats, RateLimitEntry};
pub use versioning::{ApiEndpoint, ApiRequest, ApiVersion, VersionManager};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    #[error("HTTP Error: {0}")]
    Http(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Handler failed: {0}")]
    Handler(String),
}

impl From<http::Error> for GatewayError {
    fn from(e: http::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl From<hyper::Error> for GatewayError {
    fn from(e: hyper::Error) -> Self {
        Self::Http(e.to_string())
    }
}

impl warp::reject::Reject for GatewayError {}

use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::{Deserialize, Serialize};

/// Diagnostic detail attached to a rejected version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionErrorDetails {
    pub requested_version: String,
    pub supported_versions: Vec<String>,
    pub current_version: String,
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

/// Every error body the middleware can produce, tagged by its `error` code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "error")]
pub enum ErrorBody {
    #[serde(rename = "API_VERSION_ERROR")]
    ApiVersionError {
        message: String,
        details: VersionErrorDetails,
    },
    #[serde(rename = "RATE_LIMIT_EXCEEDED")]
    RateLimitExceeded {
        message: String,
        #[serde(rename = "retryAfter")]
        retry_after: u64,
    },
    #[serde(rename = "MIDDLEWARE_ERROR")]
    MiddlewareError { message: String, timestamp: String },
}

impl ErrorBody {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::ApiVersionError { .. } => StatusCode::BAD_REQUEST,
            Self::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::MiddlewareError { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn into_response(self) -> Response<Bytes> {
        let status = self.status();
        json_response(status, &self)
    }
}

pub fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Bytes> {
    // Serializing these plain structs cannot fail.
    let body = serde_json::to_vec(value).unwrap_or_default();
    let mut response = Response::new(Bytes::from(body));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
    response
}

pub struct RateLimitEntry {
    pub count: u32,
    pub reset_time: SystemTime,
}

/// Running totals for one route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PathStats {
    pub request_count: u64,
    pub error_count: u64,
    /// Milliseconds, cumulative moving average.
    pub average_response_time: u64,
    pub last_request: DateTime<Utc>,
}

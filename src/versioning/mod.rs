//! API version negotiation.
//!
//! A request names its version in the URL (`/api/v2/...`), in a header, or
//! not at all, in which case the configured default applies. The resolved
//! version is classified against the known-version registry and, when the
//! route has one, against a per-endpoint constraint.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;

use bytes::Bytes;
use chrono::NaiveDate;
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request, Response};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;
use tracing::warn;

use crate::config::{VersionEntry, VersioningConfig};
use crate::models::{ErrorBody, VersionErrorDetails};


lazy_static! {
    static ref VERSIONED_PATH: Regex =
        Regex::new(r"^/api/v(\d+(\.\d+)?)/(.*)$").expect("version path pattern");
}

const HEADER_VERSION: &str = "x-api-version";
const HEADER_VERSION_SOURCE: &str = "x-api-version-source";
const HEADER_CURRENT_VERSION: &str = "x-api-current-version";
const HEADER_DEPRECATION_WARNING: &str = "x-api-deprecation-warning";
const HEADER_END_OF_LIFE: &str = "x-api-end-of-life";

/// Numeric form of an API version, ordered by major then minor. Requests,
/// the registry and endpoint constraints are all matched through this type.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct Version {
    pub major: u32,
    pub minor: u32,
}

impl Version {
    /// `"2"` and `"2.0"` both give `2.0`. A third component (`"1.0.5"`) or
    /// anything non-numeric is `None`, matching the `/api/v<major>.<minor>/`
    /// URL form.
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.trim().split('.');
        let major = parts.next()?.parse().ok()?;
        let minor = match parts.next() {
            Some(p) => p.parse().ok()?,
            None => 0,
        };
        if parts.next().is_some() {
            return None;
        }
        Some(Self { major, minor })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Compares dotted version strings of any length component-wise, padding
/// the shorter with zeros, so `"1" == "1.0" == "1.0.0"`. Non-numeric
/// components count as 0. For two-component strings this agrees with the
/// ordering of [`Version`].
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |s: &str| -> Vec<u64> {
        s.trim()
            .split('.')
            .map(|part| part.parse().unwrap_or(0))
            .collect()
    };
    let (left, right) = (parse(a), parse(b));
    let len = left.len().max(right.len());

    (0..len)
        .map(|i| {
            let l = left.get(i).copied().unwrap_or(0);
            let r = right.get(i).copied().unwrap_or(0);
            l.cmp(&r)
        })
        .find(|o| *o != Ordering::Equal)
        .unwrap_or(Ordering::Equal)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionStatus {
    Supported,
    Deprecated,
    Unsupported,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VersionSource {
    Url,
    Header,
    Default,
}

impl VersionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::Header => "header",
            Self::Default => "default",
        }
    }
}

/// Classification of one version identifier against the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiVersion {
    pub version: String,
    pub major: u32,
    pub minor: u32,
    pub status: VersionStatus,
    pub deprecation_date: Option<NaiveDate>,
    pub end_of_life_date: Option<NaiveDate>,
    #[serde(skip)]
    number: Option<Version>,
}

impl ApiVersion {
    /// `None` when the identifier did not parse; such a version matches nothing.
    pub fn number(&self) -> Option<Version> {
        self.number
    }
}

/// Version constraints for a single normalized path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApiEndpoint {
    pub supported_versions: Vec<String>,
    pub deprecated_versions: Vec<String>,
    pub changes: Vec<String>,
}

impl ApiEndpoint {
    pub fn new<I, S>(supported: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            supported_versions: supported.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn deprecating<I, S>(mut self, deprecated: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.deprecated_versions = deprecated.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_change(mut self, change: impl Into<String>) -> Self {
        self.changes.push(change.into());
        self
    }
}

/// An endpoint with its version lists parsed at registration.
struct RegisteredEndpoint {
    endpoint: ApiEndpoint,
    supported: Vec<Version>,
    deprecated: Vec<Version>,
}

impl RegisteredEndpoint {
    fn new(endpoint: ApiEndpoint) -> Self {
        Self {
            supported: parse_all(&endpoint.supported_versions),
            deprecated: parse_all(&endpoint.deprecated_versions),
            endpoint,
        }
    }

    fn supports(&self, version: Option<Version>) -> bool {
        version.map_or(false, |v| self.supported.contains(&v))
    }

    fn deprecates(&self, version: Option<Version>) -> bool {
        version.map_or(false, |v| self.deprecated.contains(&v))
    }
}

fn parse_all(versions: &[String]) -> Vec<Version> {
    versions
        .iter()
        .filter_map(|raw| {
            let parsed = Version::parse(raw);
            if parsed.is_none() {
                warn!(version = %raw, "ignoring malformed API version");
            }
            parsed
        })
        .collect()
}

/// Version information resolved for one inbound request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequest {
    pub requested_version: String,
    pub version_source: VersionSource,
    pub original_path: String,
    pub normalized_path: String,
    pub version: ApiVersion,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionValidation {
    pub valid: bool,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
}

pub struct VersionManager {
    config: VersioningConfig,
    registry: Vec<(Version, VersionEntry)>,
    endpoints: HashMap<String, RegisteredEndpoint>,
}

impl VersionManager {
    pub fn new(config: VersioningConfig) -> Self {
        let registry = config
            .versions
            .iter()
            .filter_map(|entry| match Version::parse(&entry.version) {
                Some(number) => Some((number, entry.clone())),
                None => {
                    warn!(version = %entry.version, "ignoring malformed registry version");
                    None
                }
            })
            .collect();

        Self {
            config,
            registry,
            endpoints: HashMap::new(),
        }
    }

    /// Every version in the registry, deprecated ones included.
    pub fn supported_versions(&self) -> Vec<String> {
        self.registry
            .iter()
            .map(|(_, e)| e.version.clone())
            .collect()
    }

    /// Adds constraints for a normalized path such as `/api/users`.
    /// Meant to be called during startup, before traffic arrives.
    pub fn register_endpoint(&mut self, path: impl Into<String>, endpoint: ApiEndpoint) {
        self.endpoints
            .insert(path.into(), RegisteredEndpoint::new(endpoint));
    }

    pub fn endpoint(&self, path: &str) -> Option<&ApiEndpoint> {
        self.endpoints.get(path).map(|r| &r.endpoint)
    }

    pub fn parse_request<B>(&self, req: &Request<B>) -> ApiRequest {
        self.parse_parts(req.uri().path(), req.headers())
    }

    pub fn parse_parts(&self, path: &str, headers: &HeaderMap) -> ApiRequest {
        let (requested_version, version_source, normalized_path) =
            if let Some(caps) = VERSIONED_PATH.captures(path) {
                (
                    caps[1].to_string(),
                    VersionSource::Url,
                    format!("/api/{}", &caps[3]),
                )
            } else if let Some(version) = self.header_version(headers) {
                (version, VersionSource::Header, path.to_string())
            } else {
                (
                    self.config.default_version.clone(),
                    VersionSource::Default,
                    path.to_string(),
                )
            };

        ApiRequest {
            version: self.get_version_info(&requested_version),
            requested_version,
            version_source,
            original_path: path.to_string(),
            normalized_path,
        }
    }

    fn header_version(&self, headers: &HeaderMap) -> Option<String> {
        headers
            .get(self.config.header_name.as_str())
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
    }

    /// Never fails: unknown or malformed versions come back `Unsupported`.
    pub fn get_version_info(&self, version: &str) -> ApiVersion {
        let number = Version::parse(version);
        let entry = number.and_then(|n| {
            self.registry
                .iter()
                .find(|(registered, _)| *registered == n)
                .map(|(_, e)| e)
        });

        let (status, deprecation_date, end_of_life_date) = match entry {
            Some(e) if e.deprecated => (
                VersionStatus::Deprecated,
                e.deprecation_date,
                e.end_of_life_date,
            ),
            Some(_) => (VersionStatus::Supported, None, None),
            None => (VersionStatus::Unsupported, None, None),
        };

        ApiVersion {
            version: version.to_string(),
            major: number.unwrap_or_default().major,
            minor: number.unwrap_or_default().minor,
            status,
            deprecation_date,
            end_of_life_date,
            number,
        }
    }

    pub fn validate_version(&self, api: &ApiRequest) -> VersionValidation {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();
        let requested = &api.requested_version;

        match api.version.status {
            VersionStatus::Unsupported => {
                let message = format!(
                    "API version {} is not supported. Supported versions: {}",
                    requested,
                    self.supported_versions().join(", ")
                );
                if self.config.strict {
                    errors.push(message);
                } else {
                    warnings.push(message);
                }
            }
            VersionStatus::Deprecated if self.config.deprecation_warnings => {
                let mut message = format!("API version {} is deprecated", requested);
                if let Some(eol) = api.version.end_of_life_date {
                    message.push_str(&format!(" and will be removed on {}", eol));
                }
                warnings.push(message);
            }
            _ => {}
        }

        if let Some(registered) = self.endpoints.get(&api.normalized_path) {
            let number = api.version.number();
            if !registered.supports(number) {
                errors.push(format!(
                    "Endpoint {} does not support API version {}. Supported versions: {}",
                    api.normalized_path,
                    requested,
                    registered.endpoint.supported_versions.join(", ")
                ));
            }
            if registered.deprecates(number) {
                warnings.push(format!(
                    "API version {} is deprecated for endpoint {}",
                    requested, api.normalized_path
                ));
            }
        }

        VersionValidation {
            valid: errors.is_empty(),
            warnings,
            errors,
        }
    }

    /// Stamps the negotiated version onto an outgoing response.
    pub fn process_response<B>(&self, api: &ApiRequest, mut response: Response<B>) -> Response<B> {
        if !self.config.include_headers {
            return response;
        }

        let headers = response.headers_mut();
        insert_header(headers, HEADER_VERSION, &api.requested_version);
        insert_header(headers, HEADER_VERSION_SOURCE, api.version_source.as_str());
        insert_header(headers, HEADER_CURRENT_VERSION, &self.config.default_version);

        if api.version.status == VersionStatus::Deprecated {
            insert_header(headers, HEADER_DEPRECATION_WARNING, "true");
            if let Some(eol) = api.version.end_of_life_date {
                insert_header(headers, HEADER_END_OF_LIFE, &eol.to_string());
            }
        }

        response
    }

    pub fn create_error_response(
        &self,
        api: &ApiRequest,
        errors: Vec<String>,
        warnings: Vec<String>,
    ) -> Response<Bytes> {
        ErrorBody::ApiVersionError {
            message: "API version validation failed".to_string(),
            details: VersionErrorDetails {
                requested_version: api.requested_version.clone(),
                supported_versions: self.supported_versions(),
                current_version: self.config.default_version.clone(),
                errors,
                warnings,
            },
        }
        .into_response()
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(HeaderName::from_static(name), value);
    }
}

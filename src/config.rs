use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDate;
use tracing::warn;


pub const BACKEND_BASE: &str = "http://localhost:8081";
pub const LISTEN_ADDR: ([u8; 4], u16) = ([127, 0, 0, 1], 3030);
pub const RATE_LIMIT_REQUESTS: u32 = 100; // requests per window
pub const RATE_LIMIT_WINDOW_SECS: u64 = 60; // window size in seconds
pub const RATE_LIMIT_SWEEP_SECS: u64 = 300;
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
pub const STRIP_PATH_PREFIX: &str = "/api"; // Strip this prefix before forwarding
pub const API_PREFIX: &str = "/api";
pub const VERSION_HEADER: &str = "API-Version";
pub const CURRENT_API_VERSION: &str = "1.0";
/// How much of the user agent goes into a rate limit key.
pub const USER_AGENT_KEY_LEN: usize = 50;

/// One entry of the known-version registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    pub version: String,
    pub deprecated: bool,
    pub deprecation_date: Option<NaiveDate>,
    pub end_of_life_date: Option<NaiveDate>,
}

impl VersionEntry {
    pub fn supported(version: &str) -> Self {
        Self {
            version: version.to_string(),
            deprecated: false,
            deprecation_date: None,
            end_of_life_date: None,
        }
    }

    pub fn deprecated(version: &str, end_of_life_date: Option<NaiveDate>) -> Self {
        Self {
            version: version.to_string(),
            deprecated: true,
            deprecation_date: None,
            end_of_life_date,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VersioningConfig {
    pub enabled: bool,
    pub default_version: String,
    pub header_name: String,
    /// Reject versions missing from the registry instead of warning.
    pub strict: bool,
    pub deprecation_warnings: bool,
    pub include_headers: bool,
    pub versions: Vec<VersionEntry>,
}

impl Default for VersioningConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            default_version: CURRENT_API_VERSION.to_string(),
            header_name: VERSION_HEADER.to_string(),
            strict: false,
            deprecation_warnings: true,
            include_headers: true,
            versions: vec![VersionEntry::supported(CURRENT_API_VERSION)],
        }
    }
}

#[derive(Debug, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub origins: Vec<String>,
    pub methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub credentials: bool,
}

impl Default for CorsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            origins: vec!["*".to_string()],
            methods: ["GET", "POST", "PUT", "DELETE", "PATCH", "OPTIONS"]
                .iter()
                .map(|m| m.to_string())
                .collect(),
            allowed_headers: ["Content-Type", "Authorization", VERSION_HEADER]
                .iter()
                .map(|h| h.to_string())
                .collect(),
            credentials: false,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max_requests: u32,
    pub window: Duration,
    pub sweep_interval: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_requests: RATE_LIMIT_REQUESTS,
            window: Duration::from_secs(RATE_LIMIT_WINDOW_SECS),
            sweep_interval: Duration::from_secs(RATE_LIMIT_SWEEP_SECS),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub enabled: bool,
    pub log_headers: bool,
    pub log_body: bool,
    pub log_responses: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            log_headers: false,
            log_body: false,
            log_responses: true,
        }
    }
}

#[derive(Debug, Clone)]
pub struct MiddlewareConfig {
    pub versioning: VersioningConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
    pub metrics_enabled: bool,
}

impl Default for MiddlewareConfig {
    fn default() -> Self {
        Self {
            versioning: VersioningConfig::default(),
            cors: CorsConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
            metrics_enabled: true,
        }
    }
}

impl MiddlewareConfig {
    /// Defaults overlaid with any `GATEWAY_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        let v = &mut config.versioning;
        override_parsed(&lookup, "GATEWAY_VERSIONING_ENABLED", &mut v.enabled);
        override_parsed(&lookup, "GATEWAY_VERSIONING_STRICT", &mut v.strict);
        override_parsed(&lookup, "GATEWAY_DEPRECATION_WARNINGS", &mut v.deprecation_warnings);
        override_parsed(&lookup, "GATEWAY_VERSION_HEADERS", &mut v.include_headers);
        if let Some(name) = lookup("GATEWAY_VERSION_HEADER") {
            v.header_name = name.trim().to_string();
        }
        if let Some(version) = lookup("GATEWAY_DEFAULT_VERSION") {
            v.default_version = version.trim().to_string();
        }
        if let Some(list) = lookup("GATEWAY_API_VERSIONS") {
            v.versions = split_list(&list)
                .into_iter()
                .map(|version| VersionEntry::supported(&version))
                .collect();
        }
        // Entries are `1.0` or `1.0=2027-06-30` (end of life).
        if let Some(list) = lookup("GATEWAY_API_DEPRECATED_VERSIONS") {
            for item in split_list(&list) {
                let (version, eol) = match item.split_once('=') {
                    Some((version, date)) => (version.trim().to_string(), parse_date(date)),
                    None => (item, None),
                };
                match v.versions.iter_mut().find(|e| e.version == version) {
                    Some(entry) => {
                        entry.deprecated = true;
                        entry.end_of_life_date = eol;
                    }
                    None => v.versions.push(VersionEntry::deprecated(&version, eol)),
                }
            }
        }

        let c = &mut config.cors;
        override_parsed(&lookup, "GATEWAY_CORS_ENABLED", &mut c.enabled);
        override_parsed(&lookup, "GATEWAY_CORS_CREDENTIALS", &mut c.credentials);
        if let Some(list) = lookup("GATEWAY_CORS_ORIGINS") {
            c.origins = split_list(&list);
        }
        if let Some(list) = lookup("GATEWAY_CORS_METHODS") {
            c.methods = split_list(&list);
        }
        if let Some(list) = lookup("GATEWAY_CORS_HEADERS") {
            c.allowed_headers = split_list(&list);
        }

        let r = &mut config.rate_limit;
        override_parsed(&lookup, "GATEWAY_RATE_LIMIT_ENABLED", &mut r.enabled);
        override_parsed(&lookup, "GATEWAY_RATE_LIMIT_REQUESTS", &mut r.max_requests);
        let mut window_secs = r.window.as_secs();
        override_parsed(&lookup, "GATEWAY_RATE_LIMIT_WINDOW_SECS", &mut window_secs);
        r.window = Duration::from_secs(window_secs);
        let mut sweep_secs = r.sweep_interval.as_secs();
        override_parsed(&lookup, "GATEWAY_RATE_LIMIT_SWEEP_SECS", &mut sweep_secs);
        r.sweep_interval = Duration::from_secs(sweep_secs.max(1));

        let l = &mut config.logging;
        override_parsed(&lookup, "GATEWAY_LOG_REQUESTS", &mut l.enabled);
        override_parsed(&lookup, "GATEWAY_LOG_HEADERS", &mut l.log_headers);
        override_parsed(&lookup, "GATEWAY_LOG_BODY", &mut l.log_body);
        override_parsed(&lookup, "GATEWAY_LOG_RESPONSES", &mut l.log_responses);

        override_parsed(&lookup, "GATEWAY_METRICS_ENABLED", &mut config.metrics_enabled);

        config
    }
}

fn override_parsed<F, T>(lookup: &F, name: &str, target: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
{
    if let Some(raw) = lookup(name) {
        match raw.trim().parse() {
            Ok(value) => *target = value,
            Err(_) => warn!(variable = name, value = %raw, "ignoring unparsable setting"),
        }
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    match NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(_) => {
            warn!(value = raw, "ignoring unparsable end-of-life date");
            None
        }
    }
}

//! Validator modules.

use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use regex::Regex;
use serde::Deserialize;

use crate::cache::TtlCache;
use crate::error::{GatewayError, ModuleError};
use crate::http::context::RequestContext;
use crate::http::response::{ResponseContext, ResponseSink};
use crate::modules::{ModuleFilters, Validator};

/// Accepts GET and POST, answers CORS preflight itself, rejects everything else.
pub struct MethodValidator {
    filters: ModuleFilters,
}

impl MethodValidator {
    pub fn new(filters: ModuleFilters) -> Self {
        Self { filters }
    }
}

fn preflight_headers() -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("origin, x-requested-with, content-type, accept"),
    );
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"));
    headers.insert(header::CACHE_CONTROL, HeaderValue::from_static("private"));
    headers
}

#[async_trait]
impl Validator for MethodValidator {
    async fn validate(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) {
            return Ok(());
        }
        match *request.method() {
            Method::GET | Method::POST => Ok(()),
            Method::OPTIONS => {
                response.write_head(StatusCode::OK, preflight_headers());
                response.write(Bytes::new());
                response.end();
                Err(ModuleError::Answered)
            }
            ref other => Err(ModuleError::rejected(format!("HTTP method [{}] is not supported", other))),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct PathValidatorOptions {
    pub paths: Vec<String>,
}

/// The request URL must match at least one configured regex.
pub struct PathValidator {
    paths: Vec<Regex>,
    filters: ModuleFilters,
}

impl PathValidator {
    pub fn new(options: PathValidatorOptions, filters: ModuleFilters) -> Result<Self, GatewayError> {
        let paths = options
            .paths
            .iter()
            .map(|p| Regex::new(p).map_err(|e| GatewayError::module(format!("invalid path regex [{}]: {}", p, e))))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { paths, filters })
    }
}

#[async_trait]
impl Validator for PathValidator {
    async fn validate(&self, request: &RequestContext, _response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) {
            return Ok(());
        }
        let url = request.url();
        if self.paths.iter().any(|re| re.is_match(&url)) {
            Ok(())
        } else {
            Err(ModuleError::rejected(format!("Path [{}] is invalid", url)))
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ThrottlerOptions {
    pub limit: u64,
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

fn default_window_secs() -> u64 {
    60
}

/// Fixed-window request limit per client IP, counted in the shared TTL cache.
pub struct Throttler {
    limit: u64,
    window: Duration,
    cache: TtlCache,
    filters: ModuleFilters,
}

impl Throttler {
    pub fn new(options: ThrottlerOptions, filters: ModuleFilters, cache: TtlCache) -> Self {
        Self {
            limit: options.limit,
            window: Duration::from_secs(options.window_secs),
            cache,
            filters,
        }
    }
}

#[async_trait]
impl Validator for Throttler {
    async fn validate(&self, request: &RequestContext, _response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) {
            return Ok(());
        }
        let Some(ip) = request.client_ip() else {
            return Ok(());
        };
        let count = self.cache.increment(&format!("throttle:{}", ip), self.window);
        if count > self.limit {
            tracing::warn!(request_id = %request.id(), client_ip = %ip, count, limit = self.limit, "Request throttled");
            return Err(ModuleError::rejected_with_code(
                format!("Request limit exceeded for [{}]", ip),
                429,
            ));
        }
        Ok(())
    }
}

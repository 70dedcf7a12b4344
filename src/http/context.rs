//! Per-request context carried through a workflow.
//!
//! # Responsibilities
//! - Assign a request ID (honouring an inbound `x-request-id`)
//! - Expose routing-relevant attributes (method, URL, headers, client IP)
//! - Read the request body exactly once
//! - Hold state accumulated by stages: parsed body, session, cache key
//! - Memoise filter results for the lifetime of the request
//!
//! # Design Decisions
//! - Original URL preserved for logging; the working URL is rewritable
//! - Interior mutability only where concurrent race stages need it (memo, body handle)

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, Method, Request, Uri};
use parking_lot::Mutex;
use serde_json::{Map, Value};

use crate::error::ModuleError;

pub const X_REQUEST_ID: &str = "x-request-id";
pub const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Inbound request plus everything the pipeline attaches to it.
#[derive(Debug)]
pub struct RequestContext {
    id: String,
    method: Method,
    uri: Uri,
    original_uri: Uri,
    headers: HeaderMap,
    peer_addr: Option<SocketAddr>,
    transport_body: Mutex<Option<Body>>,
    body_read: bool,
    start_time: Instant,
    filters: Mutex<HashMap<String, Option<bool>>>,

    /// Raw request body, line breaks stripped. Empty until the body is read.
    pub body: String,

    /// Structured body produced by processors.
    pub parsed_body: Option<Value>,

    /// Session derived from a token by an earlier stage. Opaque to the engine.
    pub session: Option<Map<String, Value>>,

    /// Key under which cachers store and look up the response.
    pub cache_key: Option<String>,
}

impl RequestContext {
    /// Wrap an inbound request. `peer_addr` is the transport-level client address.
    pub fn from_request(request: Request<Body>, peer_addr: Option<SocketAddr>) -> Self {
        let (parts, body) = request.into_parts();
        let id = parts
            .headers
            .get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            id,
            method: parts.method,
            original_uri: parts.uri.clone(),
            uri: parts.uri,
            headers: parts.headers,
            peer_addr,
            transport_body: Mutex::new(Some(body)),
            body_read: false,
            start_time: Instant::now(),
            filters: Mutex::new(HashMap::new()),
            body: String::new(),
            parsed_body: None,
            session: None,
            cache_key: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn method(&self) -> &Method {
        &self.method
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    /// Path and query of the working URL.
    pub fn url(&self) -> String {
        self.uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| self.uri.path().to_string())
    }

    /// Path and query as received, before any rewrite.
    pub fn original_url(&self) -> String {
        self.original_uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| self.original_uri.path().to_string())
    }

    /// Replace the working URL (path and optional query).
    pub fn set_url(&mut self, url: &str) -> Result<(), ModuleError> {
        self.uri = url
            .parse::<Uri>()
            .map_err(|e| ModuleError::rejected(format!("Invalid URL [{}]: {}", url, e)))?;
        Ok(())
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header(header::CONTENT_TYPE.as_str())
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Client address: last hop of `x-forwarded-for`, else the peer address.
    pub fn client_ip(&self) -> Option<IpAddr> {
        let forwarded = self
            .header(X_FORWARDED_FOR)
            .and_then(|v| v.rsplit(',').next())
            .and_then(|hop| hop.trim().parse::<IpAddr>().ok());

        forwarded
            .or_else(|| self.peer_addr.map(|a| a.ip()))
            .map(|ip| match ip {
                IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(ip),
                v4 => v4,
            })
    }

    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    pub fn is_body_read(&self) -> bool {
        self.body_read
    }

    /// Drain the transport body into `self.body`, once.
    ///
    /// Later calls return the already-read body.
    pub async fn read_body(&mut self, limit: usize) -> Result<&str, ModuleError> {
        if self.body_read {
            return Ok(&self.body);
        }
        let transport = self.transport_body.lock().take();
        if let Some(body) = transport {
            let bytes = axum::body::to_bytes(body, limit)
                .await
                .map_err(|e| ModuleError::rejected(format!("Failed to read request body: {}", e)))?;
            self.body = String::from_utf8_lossy(&bytes).replace(['\r', '\n'], "");
        }
        self.body_read = true;
        Ok(&self.body)
    }

    /// Replace the body forwarded upstream, keeping `content-length` in sync.
    pub fn set_body(&mut self, body: String) {
        if let Ok(len) = header::HeaderValue::from_str(&body.len().to_string()) {
            self.headers.insert(header::CONTENT_LENGTH, len);
        }
        self.body = body;
        self.body_read = true;
    }

    pub(crate) fn register_filter(&self, name: &str) {
        self.filters.lock().entry(name.to_string()).or_insert(None);
    }

    pub(crate) fn cached_filter(&self, name: &str) -> Option<bool> {
        self.filters.lock().get(name).copied().flatten()
    }

    pub(crate) fn cache_filter(&self, name: &str, value: bool) {
        self.filters.lock().insert(name.to_string(), Some(value));
    }
}

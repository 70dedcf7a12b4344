//! Upstream proxy module.
//!
//! # Responsibilities
//! - Claim the request when the module's filters match
//! - Forward method, headers and the processed body to the configured target
//! - Capture upstream headers so gzip payloads are recognised downstream
//! - Stream the upstream body into the response frame by frame

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::uri::{Authority, PathAndQuery, Scheme};
use axum::http::{header, HeaderMap, HeaderValue, Request, Uri};
use http_body_util::BodyExt;
use serde::Deserialize;

use crate::error::{GatewayError, ModuleError};
use crate::http::context::{RequestContext, X_FORWARDED_FOR, X_REQUEST_ID};
use crate::http::response::{ResponseContext, ResponseSink};
use crate::modules::registry::UpstreamClient;
use crate::modules::{ModuleFilters, Proxy};

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiProxyOptions {
    /// Upstream base URL, e.g. `http://10.0.0.7:8080` or `http://backend/api`.
    pub target: String,
    /// Upper bound for receiving the upstream response head.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// Hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [header::HeaderName; 5] = [
    header::CONNECTION,
    header::TRANSFER_ENCODING,
    header::CONTENT_LENGTH,
    header::UPGRADE,
    header::TE,
];

/// Forwards requests to one upstream over plain HTTP.
pub struct ApiProxy {
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    timeout: Option<Duration>,
    client: UpstreamClient,
    filters: ModuleFilters,
}

impl ApiProxy {
    pub fn new(options: ApiProxyOptions, filters: ModuleFilters, client: UpstreamClient) -> Result<Self, GatewayError> {
        let invalid = |reason: &str| GatewayError::module(format!("invalid proxy target [{}]: {}", options.target, reason));

        let target: Uri = options.target.parse().map_err(|_| invalid("not a URI"))?;
        let scheme = target.scheme().cloned().ok_or_else(|| invalid("missing scheme"))?;
        if scheme != Scheme::HTTP {
            return Err(invalid("only http upstreams are supported"));
        }
        let authority = target.authority().cloned().ok_or_else(|| invalid("missing host"))?;

        Ok(Self {
            scheme,
            authority,
            base_path: target.path().trim_end_matches('/').to_string(),
            timeout: options.timeout_secs.map(Duration::from_secs),
            client,
            filters,
        })
    }

    fn upstream_uri(&self, request: &RequestContext) -> Result<Uri, ModuleError> {
        let path_and_query = format!("{}{}", self.base_path, request.url());
        let path_and_query = PathAndQuery::try_from(path_and_query.as_str()).map_err(ModuleError::http)?;
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
            .map_err(ModuleError::http)
    }

    fn upstream_request(&self, request: &RequestContext) -> Result<Request<Body>, ModuleError> {
        let mut headers = request.headers().clone();
        headers.remove(header::HOST);
        for name in &HOP_BY_HOP {
            headers.remove(name);
        }
        if let Ok(id) = HeaderValue::from_str(request.id()) {
            headers.insert(X_REQUEST_ID, id);
        }
        if let Some(ip) = request.peer_addr().map(|a| a.ip()) {
            let chain = match request.header(X_FORWARDED_FOR) {
                Some(existing) => format!("{}, {}", existing, ip),
                None => ip.to_string(),
            };
            if let Ok(value) = HeaderValue::from_str(&chain) {
                headers.insert(X_FORWARDED_FOR, value);
            }
        }

        let mut upstream = Request::builder()
            .method(request.method().clone())
            .uri(self.upstream_uri(request)?)
            .body(Body::from(request.body.clone()))
            .map_err(ModuleError::http)?;
        *upstream.headers_mut() = headers;
        Ok(upstream)
    }
}

fn strip_hop_by_hop(mut headers: HeaderMap) -> HeaderMap {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers
}

#[async_trait]
impl Proxy for ApiProxy {
    async fn proxy(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) {
            return Err(ModuleError::NotApplicable);
        }
        let upstream = self.upstream_request(request)?;
        let uri = upstream.uri().clone();
        tracing::debug!(request_id = %request.id(), upstream = %uri, "Proxying request");

        let pending = self.client.request(upstream);
        let result = match self.timeout {
            Some(limit) => tokio::time::timeout(limit, pending)
                .await
                .map_err(|_| ModuleError::http(format!("upstream {} timed out", uri)))?,
            None => pending.await,
        };
        let upstream_response = result.map_err(|e| {
            tracing::error!(request_id = %request.id(), upstream = %uri, error = %e, "Upstream error");
            ModuleError::http(e)
        })?;

        let (parts, mut body) = upstream_response.into_parts();
        response.set_upstream_headers(parts.headers.clone());
        response.write_head(parts.status, strip_hop_by_hop(parts.headers));

        while let Some(frame) = body.frame().await {
            let frame = frame.map_err(ModuleError::http)?;
            if let Ok(chunk) = frame.into_data() {
                response.write(chunk);
            }
        }
        response.end();

        tracing::debug!(request_id = %request.id(), upstream = %uri, status = %parts.status, "Upstream responded");
        Ok(())
    }
}

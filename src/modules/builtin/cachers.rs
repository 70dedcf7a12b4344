//! Cacher modules.
//!
//! Both cachers key on `RequestContext::cache_key`, set by a processor such as `key-md5`.
//! Without a key every lookup is a miss and nothing is stored.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::cache::TtlCache;
use crate::error::{GatewayError, ModuleError};
use crate::http::context::RequestContext;
use crate::http::response::{ResponseContext, ResponseSink};
use crate::modules::{Cacher, ModuleFilters};

const CACHE_KEY_HEADER: HeaderName = HeaderName::from_static("cache-key");

fn cache_key(request: &RequestContext) -> Result<&str, ModuleError> {
    request
        .cache_key
        .as_deref()
        .ok_or_else(|| ModuleError::rejected("No cache key"))
}

fn hit_headers(key: &str, content_type: Option<&str>) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(key) {
        headers.insert(CACHE_KEY_HEADER, value);
    }
    if let Some(value) = content_type.and_then(|ct| HeaderValue::from_str(ct).ok()) {
        headers.insert(header::CONTENT_TYPE, value);
    }
    headers
}

/// Write a cached response into the (intercepting) response.
fn serve_hit(response: &ResponseContext, status: StatusCode, headers: HeaderMap, body: Bytes) {
    response.write_head(status, headers);
    response.write(body);
    response.end();
    response.mark_from_cache();
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryCacherOptions {
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_ttl_secs() -> u64 {
    300
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CachedResponse {
    status: u16,
    content_type: Option<String>,
    body: String,
}

/// Keeps successful response bodies in the worker's TTL cache.
pub struct MemoryCacher {
    ttl: Duration,
    cache: TtlCache,
    filters: ModuleFilters,
}

impl MemoryCacher {
    pub fn new(options: MemoryCacherOptions, filters: ModuleFilters, cache: TtlCache) -> Self {
        Self {
            ttl: Duration::from_secs(options.ttl_secs),
            cache,
            filters,
        }
    }

    fn entry_key(key: &str) -> String {
        format!("response:{}", key)
    }
}

#[async_trait]
impl Cacher for MemoryCacher {
    async fn start(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) {
            return Err(ModuleError::NotApplicable);
        }
        let key = cache_key(request)?;
        let cached = self
            .cache
            .get(&Self::entry_key(key))
            .ok_or_else(|| ModuleError::rejected("Cache not found"))?;
        let cached: CachedResponse = serde_json::from_value(cached)?;
        let status = StatusCode::from_u16(cached.status).map_err(ModuleError::http)?;

        tracing::debug!(request_id = %request.id(), cache_key = %key, "Memory cache hit");
        serve_hit(
            response,
            status,
            hit_headers(key, cached.content_type.as_deref()),
            Bytes::from(cached.body),
        );
        Ok(())
    }

    async fn cache(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) || !response.status().is_success() {
            return Ok(());
        }
        let key = cache_key(request)?;
        let entry = CachedResponse {
            status: response.status().as_u16(),
            content_type: response.header(header::CONTENT_TYPE.as_str()),
            body: response.body_text(),
        };
        self.cache.insert(Self::entry_key(key), serde_json::to_value(entry)?, self.ttl);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct FileCacherOptions {
    pub path: PathBuf,
}

/// Metadata stored beside each cached body.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    /// Invalidation keys. Written empty; reserved for invalidation support.
    keys: Vec<String>,
    path: PathBuf,
    #[serde(default)]
    content_type: Option<String>,
}

/// Persists responses as `<key>.data` plus `<key>.cache` metadata under a directory.
pub struct FileCacher {
    dir: PathBuf,
    filters: ModuleFilters,
}

impl FileCacher {
    pub fn new(options: FileCacherOptions, filters: ModuleFilters) -> Result<Self, GatewayError> {
        std::fs::create_dir_all(&options.path)?;
        Ok(Self {
            dir: options.path,
            filters,
        })
    }

    /// Base path for a key. Keys are used as file names, so only safe characters pass.
    fn base_path(&self, key: &str) -> Result<PathBuf, ModuleError> {
        if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
            return Err(ModuleError::rejected(format!("Unsafe cache key [{}]", key)));
        }
        Ok(self.dir.join(key))
    }
}

#[async_trait]
impl Cacher for FileCacher {
    async fn start(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) {
            return Err(ModuleError::NotApplicable);
        }
        let key = cache_key(request)?;
        let base = self.base_path(key)?;

        let meta = match tokio::fs::read(base.with_extension("cache")).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ModuleError::rejected("Cache not found"));
            }
            Err(e) => return Err(e.into()),
        };
        let meta: CacheFile = serde_json::from_slice(&meta)?;
        let body = tokio::fs::read(&meta.path).await?;

        tracing::debug!(request_id = %request.id(), cache_key = %key, "File cache hit");
        serve_hit(
            response,
            StatusCode::OK,
            hit_headers(key, meta.content_type.as_deref()),
            Bytes::from(body),
        );
        Ok(())
    }

    async fn cache(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.filters.matches(request) || !response.status().is_success() {
            return Ok(());
        }
        let key = cache_key(request)?;
        let base = self.base_path(key)?;
        let data_path = base.with_extension("data");

        tokio::fs::write(&data_path, response.body()).await?;
        let meta = CacheFile {
            keys: Vec::new(),
            path: data_path,
            content_type: response.header(header::CONTENT_TYPE.as_str()),
        };
        tokio::fs::write(base.with_extension("cache"), serde_json::to_vec(&meta)?).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::builtin::testing::{request, response};

    fn keyed(key: &str) -> RequestContext {
        let mut req = request("GET", "/api");
        req.cache_key = Some(key.to_string());
        req
    }

    async fn store(cacher: &dyn Cacher, req: &RequestContext, body: &str) {
        let (res, _rx) = response();
        res.insert_header(header::CONTENT_TYPE, HeaderValue::from_static("application/json"));
        res.set_body(body.to_string());
        cacher.cache(req, &res).await.unwrap();
    }

    #[tokio::test]
    async fn memory_cacher_round_trip() {
        let cacher = MemoryCacher::new(MemoryCacherOptions { ttl_secs: 60 }, ModuleFilters::default(), TtlCache::new());
        let req = keyed("abc");
        let (res, _rx) = response();
        assert!(cacher.start(&req, &res).await.is_err(), "empty cache is a miss");

        store(&cacher, &req, "{\"a\":1}").await;

        let (res, _rx) = response();
        res.intercept();
        cacher.start(&req, &res).await.unwrap();
        assert!(res.is_from_cache());
        assert_eq!(res.body_text(), "{\"a\":1}");
        assert_eq!(res.header("cache-key").as_deref(), Some("abc"));
        assert_eq!(res.header("content-type").as_deref(), Some("application/json"));
    }

    #[tokio::test]
    async fn missing_key_is_a_miss() {
        let cacher = MemoryCacher::new(MemoryCacherOptions { ttl_secs: 60 }, ModuleFilters::default(), TtlCache::new());
        let (res, _rx) = response();
        assert!(cacher.start(&request("GET", "/"), &res).await.is_err());
    }

    #[tokio::test]
    async fn file_cacher_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let cacher = FileCacher::new(
            FileCacherOptions { path: dir.path().join("cache") },
            ModuleFilters::default(),
        )
        .unwrap();
        let req = keyed("0123abcd");

        store(&cacher, &req, "cached body").await;
        assert!(dir.path().join("cache/0123abcd.data").exists());
        assert!(dir.path().join("cache/0123abcd.cache").exists());

        let (res, _rx) = response();
        res.intercept();
        cacher.start(&req, &res).await.unwrap();
        assert!(res.is_from_cache());
        assert_eq!(res.body_text(), "cached body");
        assert_eq!(res.header("cache-key").as_deref(), Some("0123abcd"));
    }

    #[tokio::test]
    async fn file_cacher_rejects_unsafe_keys() {
        let dir = tempfile::tempdir().unwrap();
        let cacher = FileCacher::new(FileCacherOptions { path: dir.path().to_path_buf() }, ModuleFilters::default()).unwrap();
        let (res, _rx) = response();
        assert!(cacher.start(&keyed("../etc/passwd"), &res).await.is_err());
    }
}

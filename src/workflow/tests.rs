use std::io::{Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode};
use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use serde_json::json;

use super::*;
use crate::config::{FilterConfig, ModuleConfig, WorkflowConfig};
use crate::filter::FilterRegistry;
use crate::http::response::ResponseSink;
use crate::modules::builtin::testing::{request, request_with, response};
use crate::modules::ModuleFilters;

/// Appends its `suffix` option to the request body.
struct Append(String);

#[async_trait]
impl Processor for Append {
    async fn process(&self, data: &mut PipelineData<'_>) -> Result<(), ModuleError> {
        let body = format!("{}{}", data.request.body, self.0);
        data.request.set_body(body);
        Ok(())
    }
}

/// Serves the request body back, or declines when its filters do not match.
struct Echo(ModuleFilters);

#[async_trait]
impl Proxy for Echo {
    async fn proxy(&self, request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if !self.0.matches(request) {
            return Err(ModuleError::NotApplicable);
        }
        response.respond(StatusCode::OK, "text/plain", request.body.clone());
        Ok(())
    }
}

/// Always hits when `hit` is set; counts stored responses otherwise.
struct Counting {
    hit: bool,
    stored: Arc<AtomicUsize>,
}

#[async_trait]
impl Cacher for Counting {
    async fn start(&self, _request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        if self.hit {
            response.respond(StatusCode::OK, "text/plain", "cached");
            Ok(())
        } else {
            Err(ModuleError::rejected("Cache not found"))
        }
    }

    async fn cache(&self, _request: &RequestContext, _response: &ResponseContext) -> Result<(), ModuleError> {
        self.stored.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Streams `<label>-1;` and `<label>-2;` with a pause in between, like a slow upstream.
struct Streaming {
    label: &'static str,
    calls: Arc<AtomicUsize>,
}

#[async_trait]
impl Proxy for Streaming {
    async fn proxy(&self, _request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        response.write_head(StatusCode::OK, HeaderMap::new());
        response.write(Bytes::from(format!("{}-1;", self.label)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        response.write(Bytes::from(format!("{}-2;", self.label)));
        response.end();
        Ok(())
    }
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).unwrap();
    encoder.finish().unwrap()
}

/// Upstream that answers with a gzip-encoded body.
struct GzipUpstream;

#[async_trait]
impl Proxy for GzipUpstream {
    async fn proxy(&self, _request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_ENCODING, HeaderValue::from_static("gzip"));
        headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        response.set_upstream_headers(headers.clone());
        response.write_head(StatusCode::OK, headers);
        response.write(Bytes::from(gzip(b"hello gzip")));
        response.end();
        Ok(())
    }
}

/// Never hits; remembers every body it is asked to store.
struct Recording(Arc<Mutex<Vec<String>>>);

#[async_trait]
impl Cacher for Recording {
    async fn start(&self, _request: &RequestContext, _response: &ResponseContext) -> Result<(), ModuleError> {
        Err(ModuleError::NotApplicable)
    }

    async fn cache(&self, _request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        self.0.lock().push(response.body_text());
        Ok(())
    }
}

struct Closed;

impl Prerequisite for Closed {
    fn is_fulfilled(&self, _request: &RequestContext, _response: &ResponseContext) -> Result<(), ModuleError> {
        Err(ModuleError::rejected("closed for maintenance"))
    }
}

struct Deny;

#[async_trait]
impl Validator for Deny {
    async fn validate(&self, _request: &RequestContext, _response: &ResponseContext) -> Result<(), ModuleError> {
        Err(ModuleError::rejected_with_code("denied", 403))
    }
}

struct Upper;

#[async_trait]
impl Enricher for Upper {
    async fn enrich(&self, _request: &RequestContext, response: &ResponseContext) -> Result<(), ModuleError> {
        response.set_body(response.body_text().to_uppercase());
        Ok(())
    }
}

struct PlainError;

impl ErrorResponseWrapper for PlainError {
    fn wrap(&self, err: &PipelineError, _request: &RequestContext, response: &ResponseContext) -> bool {
        response.respond(StatusCode::BAD_REQUEST, "text/plain", format!("wrapped: {}", err));
        true
    }
}

struct Fixture {
    registry: ModuleRegistry,
    stored: Arc<AtomicUsize>,
    built: Arc<AtomicUsize>,
    proxied: Arc<AtomicUsize>,
    recorded: Arc<Mutex<Vec<String>>>,
}

fn fixture() -> Fixture {
    let stored = Arc::new(AtomicUsize::new(0));
    let built = Arc::new(AtomicUsize::new(0));
    let proxied = Arc::new(AtomicUsize::new(0));
    let recorded = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ModuleRegistry::new();

    let counter = Arc::clone(&built);
    registry.register("append", Capability::Processor, move |config, _ctx| {
        counter.fetch_add(1, Ordering::SeqCst);
        let suffix = config.options.get("suffix").and_then(|v| v.as_str()).unwrap_or_default();
        Ok(Module::Processor(Arc::new(Append(suffix.to_string()))))
    });
    registry.register("echo", Capability::Proxy, |config, ctx| {
        Ok(Module::Proxy(Arc::new(Echo(ctx.module_filters(config)?))))
    });
    let hits = Arc::clone(&stored);
    registry.register("hit", Capability::Cacher, move |_config, _ctx| {
        Ok(Module::Cacher(Arc::new(Counting { hit: true, stored: Arc::clone(&hits) })))
    });
    let misses = Arc::clone(&stored);
    registry.register("miss", Capability::Cacher, move |_config, _ctx| {
        Ok(Module::Cacher(Arc::new(Counting { hit: false, stored: Arc::clone(&misses) })))
    });
    for label in ["stream-a", "stream-b"] {
        let calls = Arc::clone(&proxied);
        let tag = if label == "stream-a" { "A" } else { "B" };
        registry.register(label, Capability::Proxy, move |_config, _ctx| {
            Ok(Module::Proxy(Arc::new(Streaming { label: tag, calls: Arc::clone(&calls) })))
        });
    }
    registry.register("gzip-upstream", Capability::Proxy, |_config, _ctx| Ok(Module::Proxy(Arc::new(GzipUpstream))));
    let bodies = Arc::clone(&recorded);
    registry.register("recording", Capability::Cacher, move |_config, _ctx| {
        Ok(Module::Cacher(Arc::new(Recording(Arc::clone(&bodies)))))
    });
    registry.register("closed", Capability::Prerequisite, |_config, _ctx| {
        Ok(Module::Prerequisite(Arc::new(Closed)))
    });
    registry.register("deny", Capability::Validator, |_config, _ctx| Ok(Module::Validator(Arc::new(Deny))));
    registry.register("upper", Capability::Enricher, |_config, _ctx| Ok(Module::Enricher(Arc::new(Upper))));
    registry.register("plain-error", Capability::ErrorResponseWrapper, |_config, _ctx| {
        Ok(Module::ErrorResponseWrapper(Arc::new(PlainError)))
    });

    Fixture {
        registry,
        stored,
        built,
        proxied,
        recorded,
    }
}

fn inline(require: &str) -> ModuleRef {
    ModuleRef::Inline(ModuleConfig::new(require))
}

fn build(config: &GatewayConfig, registry: &ModuleRegistry) -> Result<Vec<Arc<Workflow>>, GatewayError> {
    let filters = FilterRegistry::from_config(&config.filters).unwrap();
    let ctx = ModuleContext::new(Arc::new(filters), 1024);
    build_workflows(config, registry, &ctx)
}

fn single(config: &GatewayConfig, registry: &ModuleRegistry) -> Arc<Workflow> {
    build(config, registry).unwrap().remove(0)
}

async fn body_of(rx: tokio::sync::oneshot::Receiver<axum::http::Response<axum::body::Body>>) -> (StatusCode, String) {
    let sent = rx.await.unwrap();
    let status = sent.status();
    let body = axum::body::to_bytes(sent.into_body(), 4096).await.unwrap();
    (status, String::from_utf8_lossy(&body).into_owned())
}

#[test]
fn extends_prepends_base_stages() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    for (name, suffix) in [("a", "A"), ("b", "B"), ("c", "C")] {
        config
            .modules
            .insert(name.into(), ModuleConfig::new("append").with_option("suffix", json!(suffix)));
    }
    config.workflows.insert(
        "base".into(),
        WorkflowConfig { processors: vec![ModuleRef::Named("a".into())], ..Default::default() },
    );
    config.workflows.insert(
        "middle".into(),
        WorkflowConfig {
            extends: Some("base".into()),
            processors: vec![ModuleRef::Named("b".into())],
            ..Default::default()
        },
    );
    config.workflows.insert(
        "top".into(),
        WorkflowConfig {
            extends: Some("middle".into()),
            processors: vec![ModuleRef::Named("c".into())],
            ..Default::default()
        },
    );

    let workflows = build(&config, &f.registry).unwrap();
    let names: Vec<&str> = workflows.iter().map(|w| w.name()).collect();
    assert_eq!(names, vec!["base", "middle", "top"]);
    assert_eq!(workflows[2].module_names(Capability::Processor), vec!["a", "b", "c"]);
    // shared modules are instantiated once no matter how many workflows use them
    assert_eq!(f.built.load(Ordering::SeqCst), 3);
}

#[test]
fn extends_cycle_is_rejected() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config
        .workflows
        .insert("a".into(), WorkflowConfig { extends: Some("b".into()), ..Default::default() });
    config
        .workflows
        .insert("b".into(), WorkflowConfig { extends: Some("a".into()), ..Default::default() });

    let err = build(&config, &f.registry).unwrap_err();
    assert!(err.to_string().contains("cycle"), "{}", err);
}

#[test]
fn undefined_named_module_is_rejected() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig { proxies: vec![ModuleRef::Named("ghost".into())], ..Default::default() },
    );
    let err = build(&config, &f.registry).unwrap_err();
    assert!(err.to_string().contains("Module ghost is not defined for workflow api"));
}

#[tokio::test]
async fn processors_compose_in_order() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig {
            processors: vec![
                ModuleRef::Inline(ModuleConfig::new("append").with_option("suffix", json!("1"))),
                ModuleRef::Inline(ModuleConfig::new("append").with_option("suffix", json!("2"))),
            ],
            proxies: vec![inline("echo")],
            ..Default::default()
        },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request("POST", "/");
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    assert_eq!(body_of(rx).await, (StatusCode::OK, "12".to_string()));
    assert_eq!(res.claimed_by().as_deref(), Some("api"));
}

#[tokio::test]
async fn cache_hit_skips_proxies_and_enrichers() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig {
            cachers: vec![inline("miss"), inline("hit")],
            proxies: vec![inline("echo")],
            enrichers: vec![inline("upper")],
            ..Default::default()
        },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request("GET", "/");
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    assert_eq!(body_of(rx).await, (StatusCode::OK, "cached".to_string()));
    assert!(res.is_from_cache());
    assert_eq!(f.stored.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn cache_miss_proxies_enriches_and_stores() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig {
            processors: vec![ModuleRef::Inline(ModuleConfig::new("append").with_option("suffix", json!("payload")))],
            cachers: vec![inline("miss"), inline("miss")],
            proxies: vec![inline("echo")],
            enrichers: vec![inline("upper")],
            ..Default::default()
        },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request("POST", "/");
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    assert_eq!(body_of(rx).await, (StatusCode::OK, "PAYLOAD".to_string()));
    assert_eq!(f.stored.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn empty_body_is_not_stored() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig { cachers: vec![inline("miss")], proxies: vec![inline("echo")], ..Default::default() },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request("GET", "/");
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    assert_eq!(body_of(rx).await, (StatusCode::OK, String::new()));
    assert_eq!(f.stored.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn validator_failure_goes_to_error_wrapper() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig {
            validators: vec![inline("deny")],
            proxies: vec![inline("echo")],
            error_response_wrappers: vec![inline("plain-error")],
            ..Default::default()
        },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request("GET", "/");
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    assert_eq!(body_of(rx).await, (StatusCode::BAD_REQUEST, "wrapped: denied".to_string()));
}

#[tokio::test]
async fn unhandled_errors_are_returned() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert("bare".into(), WorkflowConfig::default());
    config.workflows.insert(
        "denied".into(),
        WorkflowConfig { validators: vec![inline("deny")], ..Default::default() },
    );
    let workflows = build(&config, &f.registry).unwrap();

    let (res, _rx) = response();
    let err = workflows[0].serve(&mut request("GET", "/"), &res).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoProxyDefined));
    assert!(!res.is_flushed());

    let (res, _rx) = response();
    let err = workflows[1].serve(&mut request("GET", "/"), &res).await.unwrap_err();
    assert_eq!(err.code(), Some(403));
}

#[tokio::test]
async fn all_proxies_declining_is_no_proxy_found() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.filters.insert(
        "never".into(),
        FilterConfig { methods: Some(vec!["DELETE".into()]), ..Default::default() },
    );
    config.workflows.insert(
        "api".into(),
        WorkflowConfig {
            proxies: vec![ModuleRef::Inline(ModuleConfig::new("echo").with_filters(&["never"]))],
            ..Default::default()
        },
    );
    let workflow = single(&config, &f.registry);

    let (res, _rx) = response();
    let err = workflow.serve(&mut request("GET", "/"), &res).await.unwrap_err();
    assert!(matches!(err, PipelineError::NoProxyMatched));
    assert_eq!(err.to_string(), "No proxy found");
}

#[tokio::test]
async fn ineligible_and_second_claims_decline() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.filters.insert(
        "posts".into(),
        FilterConfig { methods: Some(vec!["POST".into()]), ..Default::default() },
    );
    config.workflows.insert(
        "posts-only".into(),
        WorkflowConfig { filters: vec!["posts".into()], proxies: vec![inline("echo")], ..Default::default() },
    );
    config
        .workflows
        .insert("any".into(), WorkflowConfig { proxies: vec![inline("echo")], ..Default::default() });
    let workflows = build(&config, &f.registry).unwrap();
    let (any, posts_only) = (&workflows[0], &workflows[1]);

    let req = request("GET", "/");
    let (res, _rx) = response();
    assert!(matches!(posts_only.handle(&req, &res).await, Err(PipelineError::FilterMismatch)));

    let req = request("POST", "/");
    assert!(posts_only.handle(&req, &res).await.is_ok());
    assert!(matches!(any.handle(&req, &res).await, Err(PipelineError::Claimed)));
    assert!(!res.is_ended());
}

#[tokio::test]
async fn racing_proxies_never_interleave_output() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig { proxies: vec![inline("stream-a"), inline("stream-b")], ..Default::default() },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request("GET", "/");
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    let (status, body) = body_of(rx).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body == "A-1;A-2;" || body == "B-1;B-2;", "mixed body: {}", body);
    assert_eq!(f.proxied.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failed_prerequisite_stops_before_any_io() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig {
            prerequisites: vec![inline("closed")],
            proxies: vec![inline("stream-a")],
            error_response_wrappers: vec![inline("plain-error")],
            ..Default::default()
        },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request_with(Request::builder().method("POST").uri("/").body(Body::from("payload")).unwrap());
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    assert_eq!(
        body_of(rx).await,
        (StatusCode::BAD_REQUEST, "wrapped: closed for maintenance".to_string())
    );
    assert!(!req.is_body_read());
    assert_eq!(f.proxied.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn gzip_upstream_is_enriched_as_text_and_re_encoded() {
    let f = fixture();
    let mut config = GatewayConfig::default();
    config.workflows.insert(
        "api".into(),
        WorkflowConfig {
            cachers: vec![inline("recording")],
            proxies: vec![inline("gzip-upstream")],
            enrichers: vec![inline("upper")],
            ..Default::default()
        },
    );
    let workflow = single(&config, &f.registry);

    let mut req = request("GET", "/");
    let (res, rx) = response();
    workflow.serve(&mut req, &res).await.unwrap();

    let sent = rx.await.unwrap();
    assert_eq!(sent.headers()[header::CONTENT_ENCODING], "gzip");
    let body = axum::body::to_bytes(sent.into_body(), 4096).await.unwrap();
    let mut decoded = String::new();
    GzDecoder::new(&body[..]).read_to_string(&mut decoded).unwrap();
    assert_eq!(decoded, "HELLO GZIP");

    assert_eq!(*f.recorded.lock(), vec!["HELLO GZIP".to_string()]);
}

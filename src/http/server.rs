//! Worker HTTP/HTTPS server.
//!
//! # Responsibilities
//! - Build the filter, module and workflow graph from configuration (once per worker)
//! - Bind the configured ports with `SO_REUSEPORT` so sibling workers share them
//! - Hand every request to the dispatcher on its own task
//! - Drain in-flight requests when the shutdown signal fires

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request, StatusCode},
    response::{IntoResponse, Response},
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use tokio::net::{TcpListener, TcpSocket};
use tokio::task::JoinSet;
use tower_http::trace::TraceLayer;

use crate::cache::TtlCache;
use crate::config::GatewayConfig;
use crate::error::GatewayError;
use crate::filter::FilterRegistry;
use crate::http::context::{RequestContext, X_REQUEST_ID};
use crate::http::dispatch::Dispatcher;
use crate::http::response::{ResponseContext, TransportSink};
use crate::http::tls::load_tls_config;
use crate::lifecycle::Shutdown;
use crate::modules::registry::{ModuleContext, ModuleRegistry};
use crate::workflow::build_workflows;

const LISTEN_BACKLOG: u32 = 1024;
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

/// Application state injected into the handler.
#[derive(Clone)]
struct AppState {
    dispatcher: Dispatcher,
}

/// Listeners bound but not yet serving.
pub struct BoundListeners {
    http: Option<TcpListener>,
    https: Option<(std::net::TcpListener, RustlsConfig)>,
}

impl BoundListeners {
    pub fn http_addr(&self) -> Option<SocketAddr> {
        self.http.as_ref().and_then(|l| l.local_addr().ok())
    }

    pub fn https_addr(&self) -> Option<SocketAddr> {
        self.https.as_ref().and_then(|(l, _)| l.local_addr().ok())
    }

    pub fn local_addrs(&self) -> Vec<SocketAddr> {
        self.http_addr().into_iter().chain(self.https_addr()).collect()
    }
}

/// One worker's request-serving side.
pub struct WorkerServer {
    config: Arc<GatewayConfig>,
    dispatcher: Dispatcher,
    cache: TtlCache,
}

impl WorkerServer {
    /// Build the worker's immutable pipeline graph.
    pub fn from_config(config: Arc<GatewayConfig>, registry: &ModuleRegistry) -> Result<Self, GatewayError> {
        let filters = FilterRegistry::from_config(&config.filters).map_err(|e| GatewayError::module(e.to_string()))?;
        let ctx = ModuleContext::new(Arc::new(filters), config.body_limit);
        let workflows = build_workflows(&config, registry, &ctx)?;

        Ok(Self {
            cache: ctx.cache.clone(),
            dispatcher: Dispatcher::new(workflows),
            config,
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    /// The worker's router: everything goes through the dispatcher.
    pub fn router(&self) -> Router {
        let state = AppState {
            dispatcher: self.dispatcher.clone(),
        };
        Router::new()
            .fallback(gateway_handler)
            .with_state(state)
            .layer(TraceLayer::new_for_http())
    }

    /// Bind every configured port. TLS material is loaded here so a bad
    /// certificate fails the worker before it reports `listening`.
    pub async fn bind(&self) -> Result<BoundListeners, GatewayError> {
        let http = match self.config.ports.http {
            Some(port) => Some(bind_reuseport(resolve(&self.config.host, port).await?)?),
            None => None,
        };
        let https = match (self.config.ports.https, &self.config.ssl_options) {
            (Some(port), Some(ssl)) => {
                let tls = load_tls_config(ssl).await?;
                let addr = resolve(&self.config.host, port).await?;
                let listener = bind_reuseport(addr)?
                    .into_std()
                    .map_err(|source| GatewayError::Bind { addr: addr.to_string(), source })?;
                Some((listener, tls))
            }
            (Some(_), None) => return Err(GatewayError::tls("https port configured without sslOptions")),
            (None, _) => None,
        };
        Ok(BoundListeners { http, https })
    }

    /// Bind, report the bound addresses, then serve until `shutdown` drains the worker.
    pub async fn run<F>(self, shutdown: Shutdown, on_listening: F) -> Result<(), GatewayError>
    where
        F: FnOnce(&[SocketAddr]),
    {
        let listeners = self.bind().await?;
        on_listening(&listeners.local_addrs());
        self.serve(listeners, shutdown).await
    }

    /// Serve on already-bound listeners. Returns once every listener has drained.
    pub async fn serve(self, listeners: BoundListeners, shutdown: Shutdown) -> Result<(), GatewayError> {
        let app = self.router();
        let mut servers = JoinSet::new();

        if let Some(listener) = listeners.http {
            let addr = listener.local_addr()?;
            tracing::info!(address = %addr, workflows = self.dispatcher.workflows().len(), "HTTP listener started");
            let service = app.clone().into_make_service_with_connect_info::<SocketAddr>();
            let drain = shutdown.wait();
            servers.spawn(async move {
                axum::serve(listener, service).with_graceful_shutdown(drain).await?;
                tracing::info!(address = %addr, "HTTP listener drained");
                Ok::<_, GatewayError>(())
            });
        }

        if let Some((listener, tls)) = listeners.https {
            let addr = listener.local_addr()?;
            tracing::info!(address = %addr, workflows = self.dispatcher.workflows().len(), "HTTPS listener started");
            let handle = axum_server::Handle::new();
            let drain = shutdown.wait();
            let drain_handle = handle.clone();
            tokio::spawn(async move {
                drain.await;
                drain_handle.graceful_shutdown(None);
            });
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            servers.spawn(async move {
                axum_server::from_tcp_rustls(listener, tls)
                    .handle(handle)
                    .serve(service)
                    .await?;
                tracing::info!(address = %addr, "HTTPS listener drained");
                Ok::<_, GatewayError>(())
            });
        }

        tokio::spawn(purge_cache(self.cache.clone(), shutdown.clone()));

        let mut result = Ok(());
        while let Some(joined) = servers.join_next().await {
            let outcome = joined.unwrap_or_else(|e| Err(GatewayError::Io(std::io::Error::other(e))));
            if let Err(e) = outcome {
                tracing::error!(error = %e, "Listener failed");
                shutdown.trigger();
                result = Err(e);
            }
        }
        result
    }
}

/// Periodically drop expired TTL cache entries until the worker drains.
async fn purge_cache(cache: TtlCache, shutdown: Shutdown) {
    let mut interval = tokio::time::interval(CACHE_PURGE_INTERVAL);
    interval.tick().await;
    loop {
        tokio::select! {
            _ = interval.tick() => {
                let purged = cache.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, remaining = cache.len(), "Expired cache entries purged");
                }
            }
            _ = shutdown.wait() => return,
        }
    }
}

async fn resolve(host: &str, port: u16) -> Result<SocketAddr, GatewayError> {
    let bind_error = |source| GatewayError::Bind {
        addr: format!("{}:{}", host, port),
        source,
    };
    tokio::net::lookup_host((host, port))
        .await
        .map_err(bind_error)?
        .next()
        .ok_or_else(|| bind_error(std::io::Error::new(std::io::ErrorKind::NotFound, "host did not resolve")))
}

/// Bind with `SO_REUSEADDR` and, on unix, `SO_REUSEPORT`.
fn bind_reuseport(addr: SocketAddr) -> Result<TcpListener, GatewayError> {
    let bind_error = |source| GatewayError::Bind {
        addr: addr.to_string(),
        source,
    };
    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()
    } else {
        TcpSocket::new_v6()
    }
    .map_err(bind_error)?;
    socket.set_reuseaddr(true).map_err(bind_error)?;
    #[cfg(unix)]
    socket.set_reuseport(true).map_err(bind_error)?;
    socket.bind(addr).map_err(bind_error)?;
    socket.listen(LISTEN_BACKLOG).map_err(bind_error)
}

/// Runs the dispatch race on its own task and waits for the response it produces.
///
/// A dispatch that panics or drops the response without ending it becomes a 500;
/// cachers keep running on that task after the client has been answered.
async fn gateway_handler(State(state): State<AppState>, request: Request<Body>) -> Response {
    let started = Instant::now();
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);
    let context = RequestContext::from_request(request, peer);
    let request_id = context.id().to_string();
    let method = context.method().clone();
    let url = context.original_url();

    let (sink, rx) = TransportSink::new();
    let response_context = ResponseContext::new(sink);
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        dispatcher.dispatch(context, response_context).await;
    });

    let mut response = match rx.await {
        Ok(response) => response,
        Err(_) => {
            tracing::error!(request_id = %request_id, "Dispatch ended without a response");
            (StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
        }
    };
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().entry(X_REQUEST_ID).or_insert(value);
    }

    tracing::info!(
        request_id = %request_id,
        method = %method,
        url = %url,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "Request completed"
    );
    response
}

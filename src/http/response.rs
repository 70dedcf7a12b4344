//! Response handling and interception.
//!
//! # Responsibilities
//! - Define the write/end contract every response writer satisfies (`ResponseSink`)
//! - Collect the final response for the transport (`TransportSink`)
//! - Decorate the transport with a buffering layer (`ResponseContext`) so enrichers
//!   and cachers see a complete body regardless of how upstream streamed it
//! - Handle gzip transparently for the buffered body
//!
//! # Design Decisions
//! - The decorator owns the buffer; the transport object is never patched
//! - Race participants write into private forks; only the winner's fork is adopted
//! - Writes after `end` are ignored
//! - Hop-by-hop length headers are recomputed when the buffered body is flushed

use std::io::{Read, Write};
use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Response, StatusCode};
use bytes::{Bytes, BytesMut};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;
use tokio::sync::oneshot;

/// The write/end contract of an HTTP response.
pub trait ResponseSink: Send + Sync {
    /// Set status and merge headers. Ignored once the response has ended.
    fn write_head(&self, status: StatusCode, headers: HeaderMap);

    /// Append a body chunk.
    fn write(&self, chunk: Bytes);

    /// Finish the response.
    fn end(&self);

    /// Whether `end` has been called.
    fn is_ended(&self) -> bool;
}

struct TransportState {
    status: StatusCode,
    headers: HeaderMap,
    body: BytesMut,
    tx: Option<oneshot::Sender<Response<Body>>>,
}

/// Underlying response writer: assembles the response handed back to the server.
pub struct TransportSink {
    state: Mutex<TransportState>,
}

impl TransportSink {
    /// Create a sink and the receiver that yields the finished response.
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Response<Body>>) {
        let (tx, rx) = oneshot::channel();
        let sink = Arc::new(Self {
            state: Mutex::new(TransportState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                body: BytesMut::new(),
                tx: Some(tx),
            }),
        });
        (sink, rx)
    }
}

impl ResponseSink for TransportSink {
    fn write_head(&self, status: StatusCode, headers: HeaderMap) {
        let mut state = self.state.lock();
        if state.tx.is_none() {
            return;
        }
        state.status = status;
        for (name, value) in headers.iter() {
            state.headers.insert(name.clone(), value.clone());
        }
    }

    fn write(&self, chunk: Bytes) {
        let mut state = self.state.lock();
        if state.tx.is_some() {
            state.body.extend_from_slice(&chunk);
        }
    }

    fn end(&self) {
        let mut state = self.state.lock();
        let Some(tx) = state.tx.take() else {
            return;
        };
        let body = std::mem::take(&mut state.body).freeze();
        let mut response = Response::new(Body::from(body));
        *response.status_mut() = state.status;
        *response.headers_mut() = std::mem::take(&mut state.headers);
        // The client may have gone away; nothing to do then.
        let _ = tx.send(response);
    }

    fn is_ended(&self) -> bool {
        self.state.lock().tx.is_none()
    }
}

#[derive(Debug, Clone)]
struct ResponseState {
    status: StatusCode,
    headers: HeaderMap,
    upstream_headers: Option<HeaderMap>,
    body: BytesMut,
    intercepting: bool,
    ended: bool,
    flushed: bool,
    from_cache: bool,
    disable_cache: bool,
}

/// Module-facing response: buffers writes once interception starts and
/// forwards to the transport sink when flushed.
pub struct ResponseContext {
    inner: Arc<dyn ResponseSink>,
    state: Mutex<ResponseState>,
    claimed_by: Mutex<Option<String>>,
}

impl ResponseContext {
    pub fn new(inner: Arc<dyn ResponseSink>) -> Self {
        Self {
            inner,
            state: Mutex::new(ResponseState {
                status: StatusCode::OK,
                headers: HeaderMap::new(),
                upstream_headers: None,
                body: BytesMut::new(),
                intercepting: false,
                ended: false,
                flushed: false,
                from_cache: false,
                disable_cache: false,
            }),
            claimed_by: Mutex::new(None),
        }
    }

    /// Take ownership of the request for one workflow. Only the first claim succeeds.
    pub fn claim(&self, owner: &str) -> bool {
        let mut claimed = self.claimed_by.lock();
        if claimed.is_some() {
            return false;
        }
        *claimed = Some(owner.to_string());
        true
    }

    /// Workflow that claimed the request, if any.
    pub fn claimed_by(&self) -> Option<String> {
        self.claimed_by.lock().clone()
    }

    /// Start buffering writes instead of forwarding them.
    pub(crate) fn intercept(&self) {
        self.state.lock().intercepting = true;
    }

    /// A private copy of the current state for one race participant.
    ///
    /// The fork always intercepts, so nothing it is given reaches the transport.
    pub(crate) fn fork(&self) -> Self {
        let mut state = self.state.lock().clone();
        state.intercepting = true;
        state.flushed = false;
        Self {
            inner: Arc::clone(&self.inner),
            state: Mutex::new(state),
            claimed_by: Mutex::new(self.claimed_by()),
        }
    }

    /// Take over a fork's status, headers and body. Ignored once flushed.
    pub(crate) fn adopt(&self, fork: ResponseContext) {
        let adopted = fork.state.into_inner();
        let mut state = self.state.lock();
        if state.flushed {
            return;
        }
        let intercepting = state.intercepting;
        *state = ResponseState {
            intercepting,
            flushed: false,
            ..adopted
        };
    }

    pub fn status(&self) -> StatusCode {
        self.state.lock().status
    }

    pub fn set_status(&self, status: StatusCode) {
        let mut state = self.state.lock();
        if !state.ended {
            state.status = status;
        }
    }

    pub fn headers(&self) -> HeaderMap {
        self.state.lock().headers.clone()
    }

    pub fn header(&self, name: &str) -> Option<String> {
        self.state
            .lock()
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    }

    pub fn insert_header(&self, name: HeaderName, value: HeaderValue) {
        let mut state = self.state.lock();
        if !state.ended {
            state.headers.insert(name, value);
        }
    }

    /// Headers received from the upstream that served this response.
    pub fn set_upstream_headers(&self, headers: HeaderMap) {
        self.state.lock().upstream_headers = Some(headers);
    }

    pub fn upstream_headers(&self) -> Option<HeaderMap> {
        self.state.lock().upstream_headers.clone()
    }

    /// Whether the payload is gzip-encoded per our own or the upstream headers.
    pub fn is_gzip(&self) -> bool {
        let state = self.state.lock();
        let gzip = |headers: &HeaderMap| {
            headers
                .get(header::CONTENT_ENCODING)
                .and_then(|v| v.to_str().ok())
                .map(|v| v.trim().eq_ignore_ascii_case("gzip"))
                .unwrap_or(false)
        };
        gzip(&state.headers) || state.upstream_headers.as_ref().map(gzip).unwrap_or(false)
    }

    pub fn mark_from_cache(&self) {
        self.state.lock().from_cache = true;
    }

    pub fn is_from_cache(&self) -> bool {
        self.state.lock().from_cache
    }

    /// Prevent cachers from persisting this response.
    pub fn disable_cache(&self) {
        self.state.lock().disable_cache = true;
    }

    pub fn is_cache_disabled(&self) -> bool {
        self.state.lock().disable_cache
    }

    /// Buffered body bytes.
    pub fn body(&self) -> Bytes {
        Bytes::copy_from_slice(&self.state.lock().body)
    }

    /// Buffered body as text.
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.state.lock().body).into_owned()
    }

    /// Replace the buffered body.
    pub fn set_body(&self, body: impl Into<Bytes>) {
        let body = body.into();
        let mut state = self.state.lock();
        state.body.clear();
        state.body.extend_from_slice(&body);
    }

    /// Write a complete response in one go.
    pub fn respond(&self, status: StatusCode, content_type: &str, body: impl Into<Bytes>) {
        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(content_type) {
            headers.insert(header::CONTENT_TYPE, value);
        }
        self.write_head(status, headers);
        self.write(body.into());
        self.end();
    }

    /// Drop everything buffered so far so an error response can start clean.
    ///
    /// No effect once the response reached the transport.
    pub(crate) fn discard(&self) {
        let mut state = self.state.lock();
        if state.flushed {
            return;
        }
        state.status = StatusCode::OK;
        state.headers.clear();
        state.upstream_headers = None;
        state.body.clear();
        state.ended = false;
    }

    /// Replace the buffered body with its gunzipped form.
    pub(crate) fn decode_gzip(&self) -> std::io::Result<()> {
        let mut state = self.state.lock();
        let mut decoded = Vec::new();
        GzDecoder::new(&state.body[..]).read_to_end(&mut decoded)?;
        state.body.clear();
        state.body.extend_from_slice(&decoded);
        Ok(())
    }

    /// Forward status, headers and `payload` to the transport and end it.
    ///
    /// The buffered body stays available for cachers.
    pub(crate) fn flush_with(&self, payload: Bytes) {
        let (status, mut headers) = {
            let mut state = self.state.lock();
            if state.flushed {
                return;
            }
            state.flushed = true;
            state.ended = true;
            (state.status, state.headers.clone())
        };
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::TRANSFER_ENCODING);
        self.inner.write_head(status, headers);
        self.inner.write(payload);
        self.inner.end();
    }

    /// Flush the buffer as-is (no enrichment, no re-encoding).
    pub(crate) fn flush(&self) {
        let payload = self.body();
        self.flush_with(payload);
    }

    /// Flush the buffer, gzip-encoding it first.
    pub(crate) fn flush_gzip(&self) -> std::io::Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&self.state.lock().body)?;
        let payload = encoder.finish()?;
        self.flush_with(Bytes::from(payload));
        Ok(())
    }

    pub fn is_flushed(&self) -> bool {
        self.state.lock().flushed || self.inner.is_ended()
    }
}

impl ResponseSink for ResponseContext {
    fn write_head(&self, status: StatusCode, headers: HeaderMap) {
        let forward = {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.status = status;
            for (name, value) in headers.iter() {
                state.headers.insert(name.clone(), value.clone());
            }
            !state.intercepting
        };
        if forward {
            self.inner.write_head(status, headers);
        }
    }

    fn write(&self, chunk: Bytes) {
        {
            let mut state = self.state.lock();
            if state.ended {
                tracing::debug!(bytes = chunk.len(), "Write after end ignored");
                return;
            }
            state.body.extend_from_slice(&chunk);
            if state.intercepting {
                return;
            }
        }
        self.inner.write(chunk);
    }

    fn end(&self) {
        let forward = {
            let mut state = self.state.lock();
            if state.ended {
                return;
            }
            state.ended = true;
            if !state.intercepting {
                state.flushed = true;
            }
            !state.intercepting
        };
        if forward {
            self.inner.end();
        }
    }

    fn is_ended(&self) -> bool {
        self.state.lock().ended
    }
}

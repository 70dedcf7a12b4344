//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection (SO_REUSEPORT, shared with sibling workers)
//!     → server.rs (Axum fallback handler, TraceLayer)
//!     → context.rs (request ID, body read once, filter memo)
//!     → dispatch.rs (race every workflow; first claim runs its pipeline)
//!     → response.rs (intercept, enrich, flush to the transport)
//!     → Send to client
//! ```

pub mod context;
pub mod dispatch;
pub mod response;
pub mod server;
pub mod tls;

pub use context::{RequestContext, X_REQUEST_ID};
pub use dispatch::Dispatcher;
pub use response::{ResponseContext, ResponseSink, TransportSink};
pub use server::WorkerServer;

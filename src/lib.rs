//! Configurable HTTP API gateway.
//!
//! Requests are raced across named workflows; the first eligible workflow runs its
//! pipeline of pluggable modules. A master process supervises a pool of workers that
//! share the listening ports.

pub mod admin;
pub mod cache;
pub mod config;
pub mod error;
pub mod filter;
pub mod http;
pub mod lifecycle;
pub mod modules;
pub mod observability;
pub mod supervisor;
pub mod workflow;

pub use config::schema::GatewayConfig;
pub use error::GatewayError;
pub use http::WorkerServer;
pub use lifecycle::Shutdown;
pub use supervisor::{Supervisor, SupervisorHandle};
pub use workflow::Workflow;

//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events with structured fields (request_id, workflow, module, worker_id, pid)
//!     → logging.rs (EnvFilter + fmt layer)
//!     → stderr
//! ```
//!
//! # Design Decisions
//! - Logs go to stderr: a worker process's stdout is its control channel to the master
//! - The master and each worker install their own subscriber
//! - Request ID flows through all subsystems

pub mod logging;

//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (JSON)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → GatewayConfig (validated, immutable)
//!     → each worker builds its Filter/Module/Workflow graph from it
//!
//! On change:
//!     watcher.rs detects a new modification time
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → master starts a rolling reload of the worker pool
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes replace workers, never mutate them
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use watcher::ConfigWatcher;
pub use schema::{
    AdminConfig, FilterConfig, GatewayConfig, ModuleConfig, ModuleRef, OneOrMany, PortsConfig,
    SslOptions, WorkflowConfig,
};

//! Request filtering subsystem.
//!
//! # Data Flow
//! ```text
//! FilterConfig (per name)
//!     → matcher.rs (compile method / content-type / path / IP-range dimensions)
//!     → predicate.rs (Filter = AND of dimensions, optionally negated)
//!     → registry.rs (name → Arc<Filter>, shared by every module and workflow)
//!
//! Per request:
//!     Filter::get(request) → RequestFilter
//!     → is_fulfilled() evaluates once, then answers from the request's memo
//! ```
//!
//! # Design Decisions
//! - Filters compiled at worker startup, immutable at runtime
//! - Results memoised per request so stages can re-check cheaply
//! - Memo is not invalidated when stages mutate the request; callers force re-evaluation

pub mod matcher;
pub mod predicate;
pub mod registry;

pub use predicate::{filters_match, Filter, RequestFilter};
pub use registry::FilterRegistry;

/// Error building filters from configuration.
#[derive(Debug, thiserror::Error)]
pub enum FilterError {
    #[error("filter [{filter}] has invalid regex: {source}")]
    InvalidRegex {
        filter: String,
        #[source]
        source: regex::Error,
    },

    #[error("filter [{filter}] has invalid IP range [{range}]")]
    InvalidIpRange { filter: String, range: String },

    #[error("filter [{0}] is not defined")]
    Unknown(String),
}

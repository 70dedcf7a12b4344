//! Shared in-memory cache service.
//!
//! One `TtlCache` is created per worker and handed to every module factory,
//! so modules never keep process-wide state keyed by their own type.

pub mod ttl;

pub use ttl::TtlCache;

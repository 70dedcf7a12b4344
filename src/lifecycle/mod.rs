//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → master stop (disconnect workers, exit after the last)
//!     SIGHUP         → master rolling reload
//!     SIGTERM        → worker drain
//!
//! Shutdown (shutdown.rs):
//!     trigger → listeners stop accepting → in-flight requests finish → exit
//!
//! Backoff (backoff.rs):
//!     worker died before listening → wait, growing per repeat, then respawn
//! ```
//!
//! # Design Decisions
//! - Workers are disconnected, never killed, unless the drain deadline passes
//! - Shutdown is level-triggered so late subscribers still observe it

pub mod backoff;
pub mod shutdown;
pub mod signals;

pub use backoff::RespawnBackoff;
pub use shutdown::Shutdown;

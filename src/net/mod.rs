//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection
//!     → listener.rs (accept loop, connection limits)
//!     → Hand off to HTTP layer (one exchange per request)
//!     → connection.rs (exchange tracking for graceful shutdown)
//! ```
//!
//! # Design Decisions
//! - Bounded accept queue prevents resource exhaustion
//! - Each exchange tracked for graceful shutdown

pub mod connection;
pub mod listener;

pub use connection::{ExchangeGuard, ExchangeId, ExchangeTracker};
pub use listener::{ConnectionPermit, Listener, ListenerError};

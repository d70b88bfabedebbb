//! WebSocket exchange subsystem.
//!
//! # Data Flow
//! ```text
//! Upgrade request (matched to a WebSocket endpoint)
//!     → 101 Switching Protocols
//!     → exchange.rs (split socket, start sender loop, run callback)
//!     → session.rs (receive / send for the callback)
//!     → outbound.rs (bounded FIFO between producers and the sender loop)
//!     → termination (close handshake or abort, queue drained)
//! ```
//!
//! # Design Decisions
//! - One writer per socket; producers only ever touch the queue
//! - A full queue suspends producers instead of growing memory
//! - Termination is decided once and always closes the queue

pub mod exchange;
pub mod outbound;
pub mod session;

pub use exchange::{run_session, SessionSettings, Termination};
pub use outbound::{FrameKind, OutboundMessage, OutboundReceiver, OutboundSender};
pub use session::{CloseStatus, SessionError, SessionMessage, WebSocketSession};

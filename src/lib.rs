//! Embeddable request-serving layer.
//!
//! Path routing with typed parameters, method dispatch and full-duplex
//! WebSocket sessions on top of hyper and tokio-tungstenite.

pub mod config;
pub mod execution;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod routing;
pub mod websocket;

/// Boxed error used at handler boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub use config::ServerConfig;
pub use http::{ExchangeContext, HandlerResult, Reject, Reply, Server};
pub use lifecycle::Shutdown;
pub use routing::{EndpointFlags, RouteTableBuilder};
pub use websocket::{OutboundMessage, WebSocketSession};

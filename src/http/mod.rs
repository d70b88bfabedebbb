//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP connection
//!     → server.rs (accept loop, hyper HTTP/1.1 with upgrades)
//!     → dispatcher.rs (span, caller address, route, decision table)
//!     → exchange.rs (body read, parse, handler, outcome → Reply)
//!     → response.rs (WebResponse contract, BodySink)
//!     → Send to client
//! ```
//!
//! Supporting modules: `request.rs` (classification helpers), `context.rs`
//! (what handlers see), `body.rs` (content-type parsing), `values.rs`
//! (query and form multi-maps).

pub mod body;
pub mod context;
pub mod dispatcher;
pub mod exchange;
pub mod request;
pub mod response;
pub mod server;
pub mod values;

pub use body::{ParsedBody, XmlElement};
pub use context::{ExchangeContext, RequestInfo};
pub use dispatcher::Dispatcher;
pub use exchange::{handle_http, HttpOutcome, HttpSettings};
pub use request::MalformedRequest;
pub use response::{BodyAbort, BodySink, BodyStream, HandlerResult, Reject, Reply, SinkError, WebResponse};
pub use server::{Server, ServerError};
pub use values::ValuesMap;

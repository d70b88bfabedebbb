//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Registration (at startup):
//!     register(template, methods, handler, flags)
//!     → matcher.rs (compile template: regex + typed placeholders + score)
//!     → registry.rs (collect EndpointRegistration values in order)
//!     → Freeze as immutable RouteTable
//!
//! Incoming Request (path, method)
//!     → router.rs (filter by method, structural match, keep best score)
//!     → params.rs (convert the winner's captures)
//!     → Return: Resolved | NotFound | InvalidParam
//! ```
//!
//! # Design Decisions
//! - Routes compiled at startup, immutable at runtime
//! - Deterministic: highest score wins, earliest registration breaks ties
//! - Bad templates fail registration; bad values fail the request (400)

pub mod matcher;
pub mod params;
pub mod registry;
pub mod router;

pub use matcher::{RouteTemplate, WILDCARD};
pub use params::{FromParamValue, ParamError, ParamType, ParamValue, RouteParams};
pub use registry::{
    Endpoint, EndpointFlags, EndpointKind, EndpointRegistration, HttpHandler, RouteError,
    RouteTableBuilder, WebSocketHandler,
};
pub use router::{ResolveError, Resolved, RouteTable, SharedRouteTable};

//! Endpoint registration.
//!
//! # Responsibilities
//! - Accept HTTP and WebSocket endpoints as plain registration values
//! - Compile each template once, failing fast on bad templates
//! - Freeze registrations into an immutable [`RouteTable`]

use std::future::Future;
use std::sync::Arc;

use axum::http::Method;
use futures_util::future::BoxFuture;
use futures_util::FutureExt;

use crate::http::{ExchangeContext, HandlerResult};
use crate::routing::matcher::RouteTemplate;
use crate::routing::router::RouteTable;
use crate::websocket::WebSocketSession;
use crate::BoxError;

/// Fatal registration-time errors.
#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("Unknown placeholder type '{type_tag}' in route '{template}'")]
    UnknownType { template: String, type_tag: String },
    #[error("Duplicate parameter '{name}' in route '{template}'")]
    DuplicateParam { template: String, name: String },
    #[error("Invalid route '{template}': {reason}")]
    InvalidTemplate { template: String, reason: String },
    #[error("Route '{0}' allows no methods")]
    NoMethods(String),
}

/// Callback for plain HTTP endpoints.
pub type HttpHandler = Arc<dyn Fn(ExchangeContext) -> BoxFuture<'static, HandlerResult> + Send + Sync>;

/// Callback for WebSocket endpoints.
pub type WebSocketHandler =
    Arc<dyn Fn(WebSocketSession) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// The callback bound to a route. A registration carries exactly one.
#[derive(Clone)]
pub enum Endpoint {
    Http(HttpHandler),
    WebSocket(WebSocketHandler),
}

impl Endpoint {
    pub fn kind(&self) -> EndpointKind {
        match self {
            Endpoint::Http(_) => EndpointKind::Http,
            Endpoint::WebSocket(_) => EndpointKind::WebSocket,
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Endpoint::{:?}", self.kind())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Http,
    WebSocket,
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EndpointKind::Http => f.write_str("HTTP"),
            EndpointKind::WebSocket => f.write_str("WS"),
        }
    }
}

/// Per-endpoint options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EndpointFlags {
    /// Run the callback on the shared background worker pool.
    pub run_on_background_pool: bool,
    /// Leave the endpoint out of [`RouteTable::documented`].
    pub skip_docs: bool,
}

impl EndpointFlags {
    pub fn background() -> Self {
        Self {
            run_on_background_pool: true,
            ..Self::default()
        }
    }

    pub fn undocumented(mut self) -> Self {
        self.skip_docs = true;
        self
    }
}

/// A compiled template bound to its endpoint.
#[derive(Debug)]
pub struct EndpointRegistration {
    pub template: RouteTemplate,
    pub endpoint: Endpoint,
    pub flags: EndpointFlags,
}

impl EndpointRegistration {
    pub fn kind(&self) -> EndpointKind {
        self.endpoint.kind()
    }
}

/// Collects registrations in order; order breaks score ties.
#[derive(Debug, Default)]
pub struct RouteTableBuilder {
    routes: Vec<EndpointRegistration>,
}

impl RouteTableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an HTTP endpoint.
    pub fn register<F, Fut>(
        &mut self,
        template: &str,
        methods: &[Method],
        handler: F,
        flags: EndpointFlags,
    ) -> Result<&mut Self, RouteError>
    where
        F: Fn(ExchangeContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler: HttpHandler = Arc::new(move |ctx| handler(ctx).boxed());
        self.push(template, methods, Endpoint::Http(handler), flags)
    }

    /// Register a WebSocket endpoint. Upgrades are always GET requests.
    pub fn register_websocket<F, Fut>(
        &mut self,
        template: &str,
        handler: F,
        flags: EndpointFlags,
    ) -> Result<&mut Self, RouteError>
    where
        F: Fn(WebSocketSession) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler: WebSocketHandler = Arc::new(move |session| handler(session).boxed());
        self.push(template, &[Method::GET], Endpoint::WebSocket(handler), flags)
    }

    fn push(
        &mut self,
        template: &str,
        methods: &[Method],
        endpoint: Endpoint,
        flags: EndpointFlags,
    ) -> Result<&mut Self, RouteError> {
        let template = RouteTemplate::compile(template, methods)?;

        tracing::debug!(
            template = %template.pattern(),
            kind = %endpoint.kind(),
            score = template.score(),
            "Route registered"
        );

        self.routes.push(EndpointRegistration {
            template,
            endpoint,
            flags,
        });
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    pub fn build(self) -> RouteTable {
        RouteTable::new(self.routes)
    }
}

//! Per-request dispatcher.
//!
//! # Responsibilities
//! - Open the `exchange` logging span (correlation id, caller, method, path, kind)
//! - Reject malformed requests before matching
//! - Resolve the route and apply the upgrade × endpoint-kind decision table
//! - Hand off to the HTTP or WebSocket exchange handler
//! - Notify observers and close every exchange exactly once
//!
//! # Data Flow
//! ```text
//! Request + peer address
//!     → client address, target check            (400)
//!     → RouteTable::resolve                      (404 | 400 invalid parameter)
//!     → kind table                               (405 | 426)
//!     → HTTP: handle_http → Reply → body writer task → flushed
//!     → WS:   handshake (400) → 101 → session task → flushed
//! ```
//!
//! # Design Decisions
//! - The exchange guard travels with the response body or the session task;
//!   whichever finishes last drops it, so closing happens once
//! - Body writes run in their own task; a peer that disconnects mid-write is
//!   expected and only logged at debug

use std::collections::BTreeMap;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, Response, StatusCode};
use futures_util::FutureExt;
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tracing::Instrument;

use crate::config::ServerConfig;
use crate::execution::{panic_message, ExecutionMode, Executor};
use crate::http::context::RequestInfo;
use crate::http::exchange::{handle_http, HttpOutcome, HttpSettings};
use crate::http::request::{client_ip, correlation_id, is_websocket_upgrade, validate_target, websocket_key};
use crate::http::response::{body_allowed, BodySink, Reply, SinkError};
use crate::http::values::ValuesMap;
use crate::lifecycle::ShutdownSignal;
use crate::net::{ExchangeGuard, ExchangeTracker};
use crate::observability::{ExchangeSummary, ExchangeTimings, ObserverSet};
use crate::routing::{Endpoint, ResolveError, SharedRouteTable, WebSocketHandler};
use crate::websocket::{run_session, SessionSettings};

const BODY_CHANNEL_CAPACITY: usize = 16;

struct DispatcherInner {
    routes: SharedRouteTable,
    executor: Executor,
    observers: ObserverSet,
    tracker: ExchangeTracker,
    trusted_proxies: Vec<IpAddr>,
    default_headers: HeaderMap,
    http: HttpSettings,
    websocket: SessionSettings,
    shutdown: ShutdownSignal,
}

/// Routes requests to endpoints. Cheap to clone; one per server.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    pub fn new(
        config: &ServerConfig,
        routes: SharedRouteTable,
        executor: Executor,
        observers: ObserverSet,
        tracker: ExchangeTracker,
        shutdown: ShutdownSignal,
    ) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                routes,
                executor,
                observers,
                tracker,
                trusted_proxies: config.trusted_proxies.clone(),
                default_headers: header_map(&config.http.default_headers),
                http: HttpSettings::new(&config.http, &config.observability),
                websocket: SessionSettings::from(&config.websocket),
                shutdown,
            }),
        }
    }

    /// Entry point for the connection service. Never panics into the connection.
    pub async fn serve(&self, request: Request<Incoming>, peer: SocketAddr) -> Response<Body> {
        let request = request.map(Body::new);
        match AssertUnwindSafe(self.dispatch(request, peer)).catch_unwind().await {
            Ok(response) => response,
            Err(payload) => {
                tracing::error!(peer = %peer, error = %panic_message(payload.as_ref()), "Dispatcher panicked");
                let mut response = Response::new(Body::from("Internal Server Error"));
                *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
                response
            }
        }
    }

    /// Dispatch one request received from `peer`.
    pub async fn dispatch(&self, request: Request<Body>, peer: SocketAddr) -> Response<Body> {
        let correlation_id = correlation_id();
        let upgrade = is_websocket_upgrade(request.headers());
        let span = tracing::info_span!(
            "exchange",
            correlation_id = %correlation_id,
            remote_ip = tracing::field::Empty,
            method = %request.method(),
            path = %request.uri().path(),
            kind = if upgrade { "WS" } else { "HTTP" },
        );
        self.exchange(request, peer, correlation_id, upgrade)
            .instrument(span)
            .await
    }

    async fn exchange(
        &self,
        mut request: Request<Body>,
        peer: SocketAddr,
        correlation_id: String,
        upgrade: bool,
    ) -> Response<Body> {
        let inner = &self.inner;
        let guard = inner.tracker.track();

        let resolved_ip = client_ip(peer.ip(), request.headers(), &inner.trusted_proxies);
        let remote_ip = resolved_ip.as_ref().copied().unwrap_or(peer.ip());
        tracing::Span::current().record("remote_ip", tracing::field::display(remote_ip));

        let mut summary = ExchangeSummary {
            id: guard.id(),
            method: request.method().clone(),
            path: request.uri().path().to_string(),
            remote_ip,
            correlation_id: correlation_id.clone(),
            upgrade,
            kind: None,
            started: Instant::now(),
        };
        inner.observers.accepted(&summary);
        tracing::debug!(exchange_id = %summary.id, "Exchange accepted");

        if let Err(error) = validate_target(&summary.path).and(resolved_ip.map(|_| ())) {
            tracing::info!(error = %error, "Malformed request");
            return self.respond(Reply::status_text(StatusCode::BAD_REQUEST, error.to_string()), summary, guard);
        }

        let table = inner.routes.load();
        let resolved = match table.resolve(&summary.path, &summary.method) {
            Ok(resolved) => resolved,
            Err(ResolveError::NotFound) => {
                tracing::trace!("No route matches");
                return self.respond(Reply::status(StatusCode::NOT_FOUND), summary, guard);
            }
            Err(ResolveError::InvalidParam(error)) => {
                tracing::info!(error = %error, "Invalid route parameter");
                return self.respond(Reply::status_text(StatusCode::BAD_REQUEST, error.to_string()), summary, guard);
            }
        };

        let route = Arc::clone(&resolved.route);
        summary.kind = Some(route.kind());
        inner.observers.matched(&summary, route.template.pattern(), route.kind());
        let mode = inner.executor.mode_for(route.flags.run_on_background_pool);

        let info = RequestInfo {
            method: request.method().clone(),
            uri: request.uri().clone(),
            headers: request.headers().clone(),
            query: ValuesMap::from_query(request.uri().query()),
            params: resolved.params,
            remote_ip,
            correlation_id,
        };

        match (&route.endpoint, upgrade) {
            (Endpoint::Http(handler), false) => {
                tracing::debug!(
                    template = %route.template.pattern(),
                    mode = %mode,
                    client = %info.client_id(),
                    "Dispatching HTTP exchange"
                );
                let outcome = handle_http(
                    info,
                    request.into_body(),
                    Arc::clone(handler),
                    &inner.executor,
                    mode,
                    inner.http,
                    inner.shutdown.clone(),
                )
                .await;
                self.respond(outcome, summary, guard)
            }
            (Endpoint::WebSocket(handler), true) => {
                self.upgrade(&mut request, info, Arc::clone(handler), mode, summary, guard)
            }
            (Endpoint::Http(_), true) => {
                tracing::info!(template = %route.template.pattern(), "Upgrade requested for an HTTP endpoint");
                self.respond(Reply::status(StatusCode::UPGRADE_REQUIRED), summary, guard)
            }
            (Endpoint::WebSocket(_), false) => {
                tracing::info!(template = %route.template.pattern(), "Plain request for a WebSocket endpoint");
                self.respond(Reply::status(StatusCode::METHOD_NOT_ALLOWED), summary, guard)
            }
        }
    }

    /// Complete the handshake and hand the upgraded connection to a session task.
    fn upgrade(
        &self,
        request: &mut Request<Body>,
        info: RequestInfo,
        handler: WebSocketHandler,
        mode: ExecutionMode,
        summary: ExchangeSummary,
        guard: ExchangeGuard,
    ) -> Response<Body> {
        let accept = match websocket_key(request.headers()) {
            Ok(key) => derive_accept_key(key),
            Err(error) => {
                tracing::info!(error = %error, "Malformed WebSocket handshake");
                return self.respond(Reply::status_text(StatusCode::BAD_REQUEST, error.to_string()), summary, guard);
            }
        };
        let Ok(accept) = HeaderValue::try_from(accept) else {
            return self.respond(Reply::status(StatusCode::INTERNAL_SERVER_ERROR), summary, guard);
        };

        let on_upgrade = hyper::upgrade::on(request);
        self.inner.observers.response_computed(&summary, StatusCode::SWITCHING_PROTOCOLS);
        let processing = summary.started.elapsed();

        let inner = Arc::clone(&self.inner);
        tokio::spawn(
            async move {
                let _guard = guard;
                let mut handler_time = None;
                match on_upgrade.await {
                    Ok(upgraded) => {
                        let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None).await;
                        let session_started = Instant::now();
                        let termination = run_session(
                            ws,
                            info,
                            handler,
                            inner.executor.clone(),
                            mode,
                            inner.websocket,
                            inner.shutdown.clone(),
                        )
                        .await;
                        handler_time = Some(session_started.elapsed());
                        tracing::info!(
                            termination = %termination,
                            elapsed_ms = summary.started.elapsed().as_millis() as u64,
                            "WebSocket session ended"
                        );
                    }
                    Err(error) => tracing::warn!(error = %error, "WebSocket upgrade failed"),
                }
                let timings = ExchangeTimings {
                    handler: handler_time,
                    processing,
                };
                inner.observers.response_flushed(&summary, StatusCode::SWITCHING_PROTOCOLS, &timings);
            }
            .in_current_span(),
        );

        let mut response = Response::new(Body::empty());
        *response.status_mut() = StatusCode::SWITCHING_PROTOCOLS;
        let headers = response.headers_mut();
        headers.insert(header::CONNECTION, HeaderValue::from_static("upgrade"));
        headers.insert(header::UPGRADE, HeaderValue::from_static("websocket"));
        headers.insert(header::SEC_WEBSOCKET_ACCEPT, accept);
        response
    }

    /// Turn a reply into a transport response and start writing its body.
    fn respond(&self, outcome: impl Into<HttpOutcome>, summary: ExchangeSummary, guard: ExchangeGuard) -> Response<Body> {
        let HttpOutcome { reply, handler_time } = outcome.into();
        let status = reply.status_code();
        self.inner.observers.response_computed(&summary, status);

        let timings = ExchangeTimings {
            handler: handler_time,
            processing: summary.started.elapsed(),
        };
        tracing::debug!(
            status = status.as_u16(),
            handler_ms = handler_time.map(|t| t.as_millis() as u64),
            processing_ms = timings.processing.as_millis() as u64,
            "Sending response"
        );

        let with_body = body_allowed(status);
        let mut headers = self.inner.default_headers.clone();
        for (name, value) in &reply.headers() {
            headers.insert(name.clone(), value.clone());
        }
        match reply.content_length() {
            Some(length) if with_body => {
                headers.insert(header::CONTENT_LENGTH, HeaderValue::from(length));
            }
            _ => {
                headers.remove(header::CONTENT_LENGTH);
            }
        }
        if !with_body {
            headers.remove(header::CONTENT_TYPE);
        }

        let (sink, stream) = BodySink::channel(BODY_CHANNEL_CAPACITY);
        let observers = self.inner.observers.clone();
        let body = stream.into_body(move || {
            observers.response_flushed(&summary, status, &timings);
            drop(guard);
        });

        if with_body {
            tokio::spawn(write_reply(reply, sink).in_current_span());
        }

        let mut response = Response::new(body);
        *response.status_mut() = status;
        *response.headers_mut() = headers;
        response
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("routes", &self.inner.routes.load().len())
            .field("observers", &self.inner.observers)
            .finish_non_exhaustive()
    }
}

async fn write_reply(reply: Reply, sink: BodySink) {
    let abort = sink.abort_handle();
    match reply.write_body(sink).await {
        Ok(()) => {}
        Err(SinkError::Disconnected) => {
            tracing::debug!("Peer disconnected before the response was written");
        }
        Err(error) => {
            tracing::warn!(error = %error, "Response body failed");
            abort.abort(error.to_string()).await;
        }
    }
}

fn header_map(headers: &BTreeMap<String, String>) -> HeaderMap {
    headers
        .iter()
        .filter_map(|(name, value)| {
            match (HeaderName::try_from(name.as_str()), HeaderValue::try_from(value.as_str())) {
                (Ok(name), Ok(value)) => Some((name, value)),
                _ => {
                    tracing::warn!(header = %name, "Skipping invalid default header");
                    None
                }
            }
        })
        .collect()
}

//! Exchange lifecycle observers.
//!
//! # Responsibilities
//! - Define the observer hooks (accepted, matched, response computed, response flushed)
//! - Report handler and processing time when the response is flushed
//! - Fan notifications out to every registered observer
//!
//! # Design Decisions
//! - Hooks are synchronous and fire-and-forget
//! - Each hook call is isolated; a panicking observer is logged and skipped

use std::net::IpAddr;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::http::{Method, StatusCode};

use crate::execution::panic_message;
use crate::net::ExchangeId;
use crate::routing::EndpointKind;

/// What observers learn about an exchange.
#[derive(Debug, Clone)]
pub struct ExchangeSummary {
    pub id: ExchangeId,
    pub method: Method,
    pub path: String,
    pub remote_ip: IpAddr,
    pub correlation_id: String,
    /// The request asked for a protocol upgrade.
    pub upgrade: bool,
    /// Kind of the matched endpoint; `None` until a route matched.
    pub kind: Option<EndpointKind>,
    pub started: Instant,
}

/// Where the time of an exchange went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeTimings {
    /// Time inside the endpoint callback (the whole session for WebSocket
    /// endpoints). `None` when no callback ran.
    pub handler: Option<Duration>,
    /// Accept to response computed.
    pub processing: Duration,
}

/// Listener for exchange lifecycle events. Every method defaults to a no-op.
pub trait ExchangeObserver: Send + Sync {
    fn on_accepted(&self, _exchange: &ExchangeSummary) {}

    fn on_matched(&self, _exchange: &ExchangeSummary, _template: &str, _kind: EndpointKind) {}

    fn on_response_computed(&self, _exchange: &ExchangeSummary, _status: StatusCode) {}

    fn on_response_flushed(&self, _exchange: &ExchangeSummary, _status: StatusCode, _timings: &ExchangeTimings) {}
}

/// An immutable set of observers.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Arc<Vec<Arc<dyn ExchangeObserver>>>,
}

impl ObserverSet {
    pub fn new(observers: Vec<Arc<dyn ExchangeObserver>>) -> Self {
        Self {
            observers: Arc::new(observers),
        }
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    fn notify(&self, hook: &'static str, call: impl Fn(&dyn ExchangeObserver)) {
        for observer in self.observers.iter() {
            let outcome = catch_unwind(AssertUnwindSafe(|| call(observer.as_ref())));
            if let Err(payload) = outcome {
                tracing::warn!(
                    hook = hook,
                    error = %panic_message(payload.as_ref()),
                    "Exchange observer failed"
                );
            }
        }
    }

    pub fn accepted(&self, exchange: &ExchangeSummary) {
        self.notify("accepted", |o| o.on_accepted(exchange));
    }

    pub fn matched(&self, exchange: &ExchangeSummary, template: &str, kind: EndpointKind) {
        self.notify("matched", |o| o.on_matched(exchange, template, kind));
    }

    pub fn response_computed(&self, exchange: &ExchangeSummary, status: StatusCode) {
        self.notify("response_computed", |o| o.on_response_computed(exchange, status));
    }

    pub fn response_flushed(&self, exchange: &ExchangeSummary, status: StatusCode, timings: &ExchangeTimings) {
        self.notify("response_flushed", |o| o.on_response_flushed(exchange, status, timings));
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverSet")
            .field("observers", &self.observers.len())
            .finish()
    }
}

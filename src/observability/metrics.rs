//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Define exchange metrics
//! - Expose Prometheus-compatible metrics endpoint
//!
//! # Metrics
//! - `switchyard_exchanges_total` (counter): exchanges by endpoint kind and status
//! - `switchyard_exchange_duration_seconds` (histogram): accept to flush
//! - `switchyard_handler_duration_seconds` (histogram): time inside the callback
//! - `switchyard_websocket_sessions_active` (gauge): open sessions
//!
//! # Design Decisions
//! - Recorded through an [`ExchangeObserver`], like any other listener
//! - Labels stay low-cardinality: kind and status only
//! - The kind label comes from the matched endpoint; unmatched requests are `none`

use std::net::SocketAddr;

use axum::http::StatusCode;
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::observability::hooks::{ExchangeObserver, ExchangeSummary, ExchangeTimings};
use crate::routing::EndpointKind;

/// Install the Prometheus exporter with its own HTTP listener.
pub fn init_metrics(addr: SocketAddr) -> Result<(), BuildError> {
    PrometheusBuilder::new().with_http_listener(addr).install()?;
    tracing::info!(address = %addr, "Metrics exporter listening");
    Ok(())
}

fn kind_label(exchange: &ExchangeSummary) -> &'static str {
    match exchange.kind {
        Some(EndpointKind::Http) => "http",
        Some(EndpointKind::WebSocket) => "ws",
        None => "none",
    }
}

/// Records exchange metrics.
#[derive(Debug, Default)]
pub struct MetricsObserver;

impl ExchangeObserver for MetricsObserver {
    fn on_response_computed(&self, exchange: &ExchangeSummary, status: StatusCode) {
        metrics::counter!(
            "switchyard_exchanges_total",
            "kind" => kind_label(exchange),
            "status" => status.as_u16().to_string()
        )
        .increment(1);

        if status == StatusCode::SWITCHING_PROTOCOLS {
            metrics::gauge!("switchyard_websocket_sessions_active").increment(1.0);
        }
    }

    fn on_response_flushed(&self, exchange: &ExchangeSummary, status: StatusCode, timings: &ExchangeTimings) {
        metrics::histogram!("switchyard_exchange_duration_seconds")
            .record(exchange.started.elapsed().as_secs_f64());

        if let Some(handler) = timings.handler {
            metrics::histogram!("switchyard_handler_duration_seconds", "kind" => kind_label(exchange))
                .record(handler.as_secs_f64());
        }

        if status == StatusCode::SWITCHING_PROTOCOLS {
            metrics::gauge!("switchyard_websocket_sessions_active").decrement(1.0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};

    use axum::http::Method;

    use crate::net::ExchangeId;

    fn summary(upgrade: bool, kind: Option<EndpointKind>) -> ExchangeSummary {
        ExchangeSummary {
            id: ExchangeId::new(),
            method: Method::GET,
            path: "/plain".into(),
            remote_ip: "127.0.0.1".parse().unwrap(),
            correlation_id: "abcd".into(),
            upgrade,
            kind,
            started: Instant::now(),
        }
    }

    #[test]
    fn test_kind_label_follows_matched_endpoint() {
        // An upgrade request answered with 426 still hit an HTTP endpoint.
        assert_eq!(kind_label(&summary(true, Some(EndpointKind::Http))), "http");
        assert_eq!(kind_label(&summary(false, Some(EndpointKind::WebSocket))), "ws");
        assert_eq!(kind_label(&summary(true, None)), "none");
    }

    #[test]
    fn test_observer_records_without_installed_recorder() {
        let observer = MetricsObserver;
        let exchange = summary(true, Some(EndpointKind::WebSocket));
        let timings = ExchangeTimings {
            handler: Some(Duration::from_millis(3)),
            processing: Duration::from_millis(1),
        };

        observer.on_response_computed(&exchange, StatusCode::SWITCHING_PROTOCOLS);
        observer.on_response_flushed(&exchange, StatusCode::SWITCHING_PROTOCOLS, &timings);
    }
}

//! HTTP exchange handler.
//!
//! # Responsibilities
//! - Drain the request body while honoring shutdown
//! - Parse known content types into a [`ParsedBody`]
//! - Run the matched handler in its execution mode
//! - Map every handler outcome to a [`Reply`]
//! - Measure the time spent inside the callback
//!
//! # Design Decisions
//! - Body limits are checked against `Content-Length` before reading
//! - A short-circuit reply is delivered exactly like a normal one
//! - Shutdown wins over both the body read and the handler

use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{header, HeaderMap, StatusCode};
use bytes::Bytes;

use crate::config::{HttpConfig, ObservabilityConfig};
use crate::execution::{ExecError, ExecutionMode, Executor};
use crate::http::body::ParsedBody;
use crate::http::context::{ExchangeContext, RequestInfo};
use crate::http::response::{shutting_down_status, HandlerResult, Reject, Reply};
use crate::lifecycle::ShutdownSignal;
use crate::routing::HttpHandler;

const SHUTDOWN_TEXT: &str = "Server is shutting down";

/// Limits and logging switches for HTTP exchanges.
#[derive(Debug, Clone, Copy)]
pub struct HttpSettings {
    pub max_body_size: usize,
    pub log_payloads: bool,
}

impl HttpSettings {
    pub fn new(http: &HttpConfig, observability: &ObservabilityConfig) -> Self {
        Self {
            max_body_size: http.max_body_size,
            log_payloads: observability.log_payloads,
        }
    }
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self::new(&HttpConfig::default(), &ObservabilityConfig::default())
    }
}

/// What an HTTP exchange produced.
#[derive(Debug)]
pub struct HttpOutcome {
    pub reply: Reply,
    /// Time inside the callback; `None` when it never ran.
    pub handler_time: Option<Duration>,
}

impl From<Reply> for HttpOutcome {
    fn from(reply: Reply) -> Self {
        Self {
            reply,
            handler_time: None,
        }
    }
}

/// Reply sent when shutdown interrupts an exchange.
pub fn shutting_down_reply() -> Reply {
    Reply::status_text(shutting_down_status(), SHUTDOWN_TEXT)
}

fn declared_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Run one HTTP exchange against `handler` and produce the reply to send.
pub async fn handle_http(
    info: RequestInfo,
    body: Body,
    handler: HttpHandler,
    executor: &Executor,
    mode: ExecutionMode,
    settings: HttpSettings,
    shutdown: ShutdownSignal,
) -> HttpOutcome {
    let started = Instant::now();

    if let Some(length) = declared_length(&info.headers) {
        if length > settings.max_body_size as u64 {
            tracing::info!(length = length, limit = settings.max_body_size, "Request body too large");
            return Reply::status(StatusCode::PAYLOAD_TOO_LARGE).into();
        }
    }

    let read = tokio::select! {
        biased;
        _ = shutdown.cancelled() => return shutting_down_reply().into(),
        read = axum::body::to_bytes(body, settings.max_body_size) => read,
    };
    let raw: Bytes = match read {
        Ok(raw) => raw,
        Err(error) => {
            tracing::info!(error = %error, "Failed to read request body");
            return Reply::status_text(StatusCode::BAD_REQUEST, "Invalid request body").into();
        }
    };

    let content_type = info.headers.get(header::CONTENT_TYPE).and_then(|v| v.to_str().ok());
    let parsed = ParsedBody::parse(content_type, &raw);
    if settings.log_payloads {
        tracing::debug!(body = %parsed, size = raw.len(), "Request body");
    } else {
        tracing::debug!(body = "<skipped>", kind = parsed.label(), size = raw.len(), "Request body");
    }

    let context = ExchangeContext::new(info, raw, parsed, shutdown.clone());

    let handler_started = Instant::now();
    let outcome = tokio::select! {
        biased;
        _ = shutdown.cancelled() => {
            tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "Exchange cancelled by shutdown");
            return HttpOutcome {
                reply: shutting_down_reply(),
                handler_time: Some(handler_started.elapsed()),
            };
        }
        outcome = executor.run(mode, handler(context)) => outcome,
    };
    let handler_time = handler_started.elapsed();

    HttpOutcome {
        reply: into_reply(outcome, started),
        handler_time: Some(handler_time),
    }
}

fn into_reply(outcome: Result<HandlerResult, ExecError>, started: Instant) -> Reply {
    let elapsed_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(reply)) => reply,
        Ok(Err(Reject::Respond(reply))) => {
            tracing::debug!(status = reply.status_code().as_u16(), "Handler short-circuited");
            reply
        }
        Ok(Err(Reject::Unauthorized)) => {
            tracing::info!(elapsed_ms = elapsed_ms, "Unauthorized");
            Reply::status(StatusCode::UNAUTHORIZED)
        }
        Ok(Err(Reject::Fail(error))) => {
            tracing::error!(error = %error, elapsed_ms = elapsed_ms, "Handler failed");
            Reply::status(StatusCode::INTERNAL_SERVER_ERROR)
        }
        Err(error) => {
            tracing::error!(error = %error, elapsed_ms = elapsed_ms, "Handler did not complete");
            Reply::status(StatusCode::INTERNAL_SERVER_ERROR)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use axum::http::{HeaderValue, Method, Uri};
    use futures_util::FutureExt;

    use crate::lifecycle::Shutdown;

    fn handler<F, Fut>(f: F) -> HttpHandler
    where
        F: Fn(ExchangeContext) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = HandlerResult> + Send + 'static,
    {
        Arc::new(move |ctx| f(ctx).boxed())
    }

    fn post(content_type: &str) -> RequestInfo {
        let mut info = RequestInfo::new(Method::POST, Uri::from_static("/data"));
        info.headers
            .insert(header::CONTENT_TYPE, HeaderValue::from_str(content_type).unwrap());
        info
    }

    async fn run(info: RequestInfo, body: &'static str, handler: HttpHandler) -> Reply {
        handle_http(
            info,
            Body::from(body),
            handler,
            &Executor::inline(),
            ExecutionMode::Inline,
            HttpSettings::default(),
            ShutdownSignal::never(),
        )
        .await
        .reply
    }

    #[tokio::test]
    async fn test_json_body_reaches_handler() {
        let echo = handler(|ctx: ExchangeContext| async move {
            let name = ctx.json().and_then(|v| v["name"].as_str()).unwrap_or("?").to_string();
            Ok::<_, Reject>(Reply::text(name))
        });

        let reply = run(post("application/json"), r#"{"name":"ada"}"#, echo).await;
        assert_eq!(reply.status_code(), StatusCode::OK);
        assert_eq!(reply.into_bytes().await.unwrap(), Bytes::from("ada"));
    }

    #[tokio::test]
    async fn test_form_body_reaches_handler() {
        let echo = handler(|ctx: ExchangeContext| async move {
            let all = ctx.form().map(|f| f.get_all("tag").collect::<Vec<_>>().join(",")).unwrap_or_default();
            Ok::<_, Reject>(Reply::text(all))
        });

        let reply = run(post("application/x-www-form-urlencoded"), "tag=a&tag=b", echo).await;
        assert_eq!(reply.into_bytes().await.unwrap(), Bytes::from("a,b"));
    }

    #[tokio::test]
    async fn test_malformed_known_type_is_not_fatal() {
        let inspect = handler(|ctx: ExchangeContext| async move {
            Ok::<_, Reject>(Reply::text(ctx.parsed_body().label()))
        });

        let reply = run(post("application/json"), "{not json", inspect).await;
        assert_eq!(reply.status_code(), StatusCode::OK);
        assert_eq!(reply.into_bytes().await.unwrap(), Bytes::from("malformed"));
    }

    #[tokio::test]
    async fn test_short_circuit_is_delivered() {
        let early = handler(|_ctx: ExchangeContext| async move {
            Err::<Reply, _>(Reject::respond(Reply::status_text(StatusCode::CONFLICT, "taken")))
        });

        let reply = run(post("text/plain"), "", early).await;
        assert_eq!(reply.status_code(), StatusCode::CONFLICT);
        assert_eq!(reply.into_bytes().await.unwrap(), Bytes::from("taken"));
    }

    #[tokio::test]
    async fn test_unauthorized_and_failure_statuses() {
        let denied = handler(|_ctx: ExchangeContext| async move { Err::<Reply, _>(Reject::Unauthorized) });
        assert_eq!(run(post("text/plain"), "", denied).await.status_code(), StatusCode::UNAUTHORIZED);

        let failing = handler(|_ctx: ExchangeContext| async move { Err::<Reply, _>(Reject::fail("boom")) });
        assert_eq!(
            run(post("text/plain"), "", failing).await.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[tokio::test]
    async fn test_handler_panic_becomes_500() {
        let panicking = handler(|ctx: ExchangeContext| async move {
            if ctx.body().is_empty() {
                panic!("handler bug");
            }
            Ok::<_, Reject>(Reply::empty())
        });

        let reply = run(post("text/plain"), "", panicking).await;
        assert_eq!(reply.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_declared_length_over_limit_is_rejected() {
        let mut info = post("text/plain");
        info.headers.insert(header::CONTENT_LENGTH, HeaderValue::from_static("100"));
        let settings = HttpSettings {
            max_body_size: 10,
            log_payloads: false,
        };
        let never = handler(|_ctx: ExchangeContext| async move { Ok::<_, Reject>(Reply::empty()) });

        let outcome = handle_http(
            info,
            Body::from("x"),
            never,
            &Executor::inline(),
            ExecutionMode::Inline,
            settings,
            ShutdownSignal::never(),
        )
        .await;
        assert_eq!(outcome.reply.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(outcome.handler_time, None);
    }

    #[tokio::test]
    async fn test_shutdown_interrupts_handler() {
        let shutdown = Shutdown::new();
        let slow = handler(|_ctx: ExchangeContext| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<_, Reject>(Reply::empty())
        });

        let signal = shutdown.subscribe();
        let exchange = tokio::spawn(async move {
            handle_http(
                post("text/plain"),
                Body::empty(),
                slow,
                &Executor::inline(),
                ExecutionMode::Inline,
                HttpSettings::default(),
                signal,
            )
            .await
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown.trigger();

        let outcome = exchange.await.unwrap();
        assert!(outcome.handler_time.is_some());
        assert_eq!(outcome.reply.status_code().as_u16(), 444);
        assert_eq!(outcome.reply.into_bytes().await.unwrap(), Bytes::from(SHUTDOWN_TEXT));
    }

    #[tokio::test]
    async fn test_handler_time_covers_the_callback() {
        let slow = handler(|_ctx: ExchangeContext| async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            Ok::<_, Reject>(Reply::empty())
        });

        let outcome = handle_http(
            post("text/plain"),
            Body::empty(),
            slow,
            &Executor::inline(),
            ExecutionMode::Inline,
            HttpSettings::default(),
            ShutdownSignal::never(),
        )
        .await;
        assert_eq!(outcome.reply.status_code(), StatusCode::OK);
        assert!(outcome.handler_time.unwrap() >= Duration::from_millis(30));
    }
}

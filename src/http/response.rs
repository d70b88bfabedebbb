//! Response contract and the built-in response values.
//!
//! # Responsibilities
//! - Define the write contract every response passes through
//! - Provide the common response shapes (empty, status, bytes, redirect, stream)
//! - Model the handler outcome: a reply, a short-circuit or a failure
//! - Feed response bytes into the transport through a [`BodySink`]
//!
//! # Design Decisions
//! - Handlers never see the transport; they only produce values
//! - A short-circuit reply is an explicit outcome, not an error
//! - A write after the peer went away is reported as [`SinkError::Disconnected`]

use std::fmt;

use axum::body::Body;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode};
use bytes::Bytes;
use futures_util::future::BoxFuture;
use futures_util::stream::BoxStream;
use futures_util::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::BoxError;

/// Non-standard status used when the server refuses to finish an exchange during shutdown.
pub fn shutting_down_status() -> StatusCode {
    StatusCode::from_u16(444).unwrap_or(StatusCode::SERVICE_UNAVAILABLE)
}

/// Whether a response with `status` may carry a body.
pub fn body_allowed(status: StatusCode) -> bool {
    !(status.is_informational() || status == StatusCode::NO_CONTENT || status == StatusCode::NOT_MODIFIED)
}

/// Error raised while writing a response body.
#[derive(Debug, thiserror::Error)]
pub enum SinkError {
    /// The peer stopped reading; expected when clients hang up.
    #[error("Peer disconnected")]
    Disconnected,
    /// The response's own body source failed.
    #[error("Body source failed: {0}")]
    Source(BoxError),
}

/// Writable end of a response body.
#[derive(Debug)]
pub struct BodySink {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
    written: u64,
}

impl BodySink {
    /// Create a sink and the transport body it feeds.
    pub fn channel(capacity: usize) -> (Self, BodyStream) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, written: 0 }, BodyStream { rx })
    }

    pub async fn write(&mut self, chunk: impl Into<Bytes>) -> Result<(), SinkError> {
        let chunk = chunk.into();
        if chunk.is_empty() {
            return Ok(());
        }
        let len = chunk.len() as u64;
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| SinkError::Disconnected)?;
        self.written += len;
        Ok(())
    }

    /// A handle that can break the body after the sink itself was consumed.
    pub fn abort_handle(&self) -> BodyAbort {
        BodyAbort { tx: self.tx.clone() }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Breaks a response body so the client sees a failed response rather than a truncated one.
#[derive(Debug)]
pub struct BodyAbort {
    tx: mpsc::Sender<Result<Bytes, std::io::Error>>,
}

impl BodyAbort {
    pub async fn abort(self, reason: String) {
        let _ = self.tx.send(Err(std::io::Error::other(reason))).await;
    }
}

/// Readable end of a [`BodySink`].
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::Receiver<Result<Bytes, std::io::Error>>,
}

impl BodyStream {
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, std::io::Error>> {
        self.rx.recv().await
    }

    /// Adapt into a transport body.
    ///
    /// `on_end` runs once when the transport is done with the body: after the
    /// last chunk was taken, or when the body is dropped early.
    pub fn into_body<F>(self, on_end: F) -> Body
    where
        F: FnOnce() + Send + 'static,
    {
        let state = (self, OnEnd(Some(on_end)));
        let stream = futures_util::stream::unfold(state, |(mut stream, on_end)| async move {
            let item = stream.next_chunk().await?;
            Some((item, (stream, on_end)))
        });
        Body::from_stream(stream)
    }
}

struct OnEnd<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for OnEnd<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

/// The write contract consumed by the dispatcher.
///
/// Implementors describe status and headers up front; `write_body` streams the
/// payload into the sink and completes when the body is fully written.
pub trait WebResponse: Send + 'static {
    fn status_code(&self) -> StatusCode;

    fn headers(&self) -> HeaderMap {
        HeaderMap::new()
    }

    /// Exact body length when known up front.
    fn content_length(&self) -> Option<u64> {
        None
    }

    fn write_body(self: Box<Self>, sink: BodySink) -> BoxFuture<'static, Result<(), SinkError>>;
}

/// `200 OK` with no body.
struct EmptyResponse;

impl WebResponse for EmptyResponse {
    fn status_code(&self) -> StatusCode {
        StatusCode::OK
    }

    fn content_length(&self) -> Option<u64> {
        Some(0)
    }

    fn write_body(self: Box<Self>, _sink: BodySink) -> BoxFuture<'static, Result<(), SinkError>> {
        async { Ok(()) }.boxed()
    }
}

/// A status that must not carry a body.
struct BodilessResponse {
    status: StatusCode,
}

impl WebResponse for BodilessResponse {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn write_body(self: Box<Self>, _sink: BodySink) -> BoxFuture<'static, Result<(), SinkError>> {
        async { Ok(()) }.boxed()
    }
}

/// A fixed payload with a content type.
struct BytesResponse {
    status: StatusCode,
    content_type: HeaderValue,
    payload: Bytes,
}

impl WebResponse for BytesResponse {
    fn status_code(&self) -> StatusCode {
        self.status
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, self.content_type.clone());
        headers
    }

    fn content_length(&self) -> Option<u64> {
        Some(self.payload.len() as u64)
    }

    fn write_body(self: Box<Self>, mut sink: BodySink) -> BoxFuture<'static, Result<(), SinkError>> {
        async move { sink.write(self.payload).await }.boxed()
    }
}

struct RedirectResponse {
    location: HeaderValue,
}

impl WebResponse for RedirectResponse {
    fn status_code(&self) -> StatusCode {
        StatusCode::FOUND
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::LOCATION, self.location.clone());
        headers
    }

    fn content_length(&self) -> Option<u64> {
        Some(0)
    }

    fn write_body(self: Box<Self>, _sink: BodySink) -> BoxFuture<'static, Result<(), SinkError>> {
        async { Ok(()) }.boxed()
    }
}

struct StreamResponse {
    content_type: HeaderValue,
    chunks: BoxStream<'static, Result<Bytes, BoxError>>,
}

impl WebResponse for StreamResponse {
    fn status_code(&self) -> StatusCode {
        StatusCode::OK
    }

    fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(header::CONTENT_TYPE, self.content_type.clone());
        headers
    }

    fn write_body(self: Box<Self>, mut sink: BodySink) -> BoxFuture<'static, Result<(), SinkError>> {
        async move {
            let mut chunks = self.chunks;
            while let Some(chunk) = chunks.next().await {
                sink.write(chunk.map_err(SinkError::Source)?).await?;
            }
            Ok(())
        }
        .boxed()
    }
}

/// A response value produced by a handler.
pub struct Reply {
    inner: Box<dyn WebResponse>,
    status: Option<StatusCode>,
    headers: HeaderMap,
}

impl Reply {
    /// Wrap any [`WebResponse`] implementation.
    pub fn new(response: impl WebResponse) -> Self {
        Self {
            inner: Box::new(response),
            status: None,
            headers: HeaderMap::new(),
        }
    }

    /// `200 OK` with no body.
    pub fn empty() -> Self {
        Self::new(EmptyResponse)
    }

    /// A bare status code with its canonical reason as plain text.
    ///
    /// Statuses that forbid a body (1xx, 204, 304) get none.
    pub fn status(status: StatusCode) -> Self {
        if !body_allowed(status) {
            return Self::new(BodilessResponse { status });
        }
        let reason = status.canonical_reason().unwrap_or("");
        Self::status_text(status, reason)
    }

    pub fn status_text(status: StatusCode, text: impl Into<String>) -> Self {
        Self::text(text.into()).with_status(status)
    }

    pub fn bytes(content_type: &str, payload: impl Into<Bytes>) -> Self {
        let content_type = HeaderValue::from_str(content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream"));
        Self::new(BytesResponse {
            status: StatusCode::OK,
            content_type,
            payload: payload.into(),
        })
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::bytes("text/plain; charset=utf-8", text.into())
    }

    pub fn html(html: impl Into<String>) -> Self {
        Self::bytes("text/html; charset=utf-8", html.into())
    }

    pub fn xml(xml: impl Into<String>) -> Self {
        Self::bytes("application/xml; charset=utf-8", xml.into())
    }

    pub fn json<T: Serialize>(value: &T) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_vec(value)?;
        Ok(Self::bytes("application/json", payload))
    }

    /// `302 Found` pointing at `location`.
    pub fn redirect(location: &str) -> Self {
        match HeaderValue::from_str(location) {
            Ok(location) => Self::new(RedirectResponse { location }),
            Err(_) => Self::status(StatusCode::INTERNAL_SERVER_ERROR),
        }
    }

    /// Stream chunks as they are produced.
    pub fn stream<S>(content_type: &str, chunks: S) -> Self
    where
        S: Stream<Item = Result<Bytes, BoxError>> + Send + 'static,
    {
        let content_type = HeaderValue::from_str(content_type)
            .unwrap_or(HeaderValue::from_static("application/octet-stream"));
        Self::new(StreamResponse {
            content_type,
            chunks: chunks.boxed(),
        })
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = Some(status);
        self
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn status_code(&self) -> StatusCode {
        self.status.unwrap_or_else(|| self.inner.status_code())
    }

    /// Response headers: the body's own headers, then any added with [`Reply::with_header`].
    pub fn headers(&self) -> HeaderMap {
        let mut headers = self.inner.headers();
        for (name, value) in &self.headers {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }

    pub fn content_length(&self) -> Option<u64> {
        self.inner.content_length()
    }

    pub async fn write_body(self, sink: BodySink) -> Result<(), SinkError> {
        self.inner.write_body(sink).await
    }

    /// Collect the whole body in memory. Used by tests and small in-process callers.
    pub async fn into_bytes(self) -> Result<Bytes, SinkError> {
        let (sink, mut stream) = BodySink::channel(16);
        let writer = self.write_body(sink);
        let reader = async move {
            let mut buf = Vec::new();
            while let Some(chunk) = stream.next_chunk().await {
                match chunk {
                    Ok(chunk) => buf.extend_from_slice(&chunk),
                    Err(e) => return Err(SinkError::Source(Box::new(e))),
                }
            }
            Ok(Bytes::from(buf))
        };
        let (written, collected) = tokio::join!(writer, reader);
        written?;
        collected
    }
}

impl fmt::Debug for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reply")
            .field("status", &self.status_code())
            .finish_non_exhaustive()
    }
}

/// Outcome of a handler that did not produce its normal reply.
#[derive(Debug)]
pub enum Reject {
    /// Short-circuit with this reply. Not a failure.
    Respond(Reply),
    /// The caller is not authorized (401).
    Unauthorized,
    /// A true failure (500).
    Fail(BoxError),
}

impl Reject {
    pub fn respond(reply: Reply) -> Self {
        Reject::Respond(reply)
    }

    pub fn fail(message: impl Into<String>) -> Self {
        Reject::Fail(message.into().into())
    }
}

impl<E> From<E> for Reject
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(err: E) -> Self {
        Reject::Fail(Box::new(err))
    }
}

/// Result type returned by HTTP handlers.
pub type HandlerResult = Result<Reply, Reject>;

//! The handle WebSocket callbacks talk to.
//!
//! # Responsibilities
//! - Receive whole inbound messages
//! - Enqueue outbound messages with back-pressure
//! - Expose the upgrade request's metadata
//! - Carry the termination and shutdown signals
//! - Let the callback close the socket with its own status, or abort it
//!
//! # Design Decisions
//! - Cloneable; every clone shares one inbound stream and one outbound queue
//! - Every suspension also wakes on termination and on process shutdown
//! - A protocol error seen by `receive` terminates the whole session
//! - `close` travels through the outbound queue, so it is written after
//!   everything enqueued before it

use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::HeaderMap;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};

use crate::http::{RequestInfo, ValuesMap};
use crate::lifecycle::{Shutdown, ShutdownSignal};
use crate::routing::RouteParams;
use crate::websocket::outbound::{OutboundMessage, OutboundSender, QueueError};

pub(crate) type InboundStream = BoxStream<'static, Result<Message, WsError>>;

/// A complete inbound message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMessage {
    Text(String),
    Binary(Bytes),
}

impl SessionMessage {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            SessionMessage::Text(t) => Some(t),
            SessionMessage::Binary(_) => None,
        }
    }
}

/// Errors surfaced to WebSocket callbacks.
///
/// Returning one of these from a callback is treated as a socket-level
/// termination, not as a handler failure.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Connection closed by peer ({code}): {reason}")]
    Closed { code: u16, reason: String },
    #[error("WebSocket protocol error: {0}")]
    Protocol(#[from] WsError),
    #[error("Session terminated")]
    Terminated,
    #[error("Server is shutting down")]
    ShuttingDown,
    #[error("Outbound queue is full")]
    QueueFull,
    #[error("Outbound queue is closed")]
    QueueClosed,
    #[error("Timed out waiting for outbound queue space")]
    Timeout,
}

/// Longest close reason that fits a control frame next to the code.
const MAX_CLOSE_REASON: usize = 123;

/// Close status recorded when the socket went away underneath the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloseStatus {
    pub code: u16,
    pub reason: String,
    /// The peer already started (or completed) the close handshake.
    pub by_peer: bool,
}

struct SessionInner {
    info: RequestInfo,
    outbound: OutboundSender,
    inbound: tokio::sync::Mutex<InboundStream>,
    termination: Shutdown,
    terminated: ShutdownSignal,
    shutdown: ShutdownSignal,
    close_status: Mutex<Option<CloseStatus>>,
}

/// A live WebSocket session.
#[derive(Clone)]
pub struct WebSocketSession {
    inner: Arc<SessionInner>,
}

impl WebSocketSession {
    pub(crate) fn new(
        info: RequestInfo,
        outbound: OutboundSender,
        inbound: InboundStream,
        shutdown: ShutdownSignal,
    ) -> Self {
        let termination = Shutdown::new();
        let terminated = termination.subscribe();
        Self {
            inner: Arc::new(SessionInner {
                info,
                outbound,
                inbound: tokio::sync::Mutex::new(inbound),
                termination,
                terminated,
                shutdown,
                close_status: Mutex::new(None),
            }),
        }
    }

    pub fn info(&self) -> &RequestInfo {
        &self.inner.info
    }

    pub fn path(&self) -> &str {
        self.inner.info.path()
    }

    pub fn params(&self) -> &RouteParams {
        &self.inner.info.params
    }

    pub fn query(&self) -> &ValuesMap {
        &self.inner.info.query
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.inner.info.headers
    }

    pub fn remote_ip(&self) -> IpAddr {
        self.inner.info.remote_ip
    }

    pub fn correlation_id(&self) -> &str {
        &self.inner.info.correlation_id
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.inner.shutdown
    }

    /// Resolves once the session has terminated for any reason.
    pub async fn terminated(&self) {
        self.inner.terminated.cancelled().await
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.is_cancelled()
    }

    /// The close status, if the socket closed or failed underneath the session.
    pub fn close_status(&self) -> Option<CloseStatus> {
        self.inner.close_status.lock().ok().and_then(|s| s.clone())
    }

    pub(crate) fn terminate(&self) {
        self.inner.termination.trigger();
    }

    fn record_close(&self, status: CloseStatus) {
        if let Ok(mut slot) = self.inner.close_status.lock() {
            slot.get_or_insert(status);
        }
    }

    /// Record a transport failure and terminate the session.
    pub(crate) fn fail(&self, error: &WsError) {
        self.record_close(CloseStatus {
            code: u16::from(CloseCode::Abnormal),
            reason: error.to_string(),
            by_peer: false,
        });
        self.terminate();
    }

    /// Wait for the next complete message.
    ///
    /// Control frames are handled by the transport and never returned.
    pub async fn receive(&self) -> Result<SessionMessage, SessionError> {
        let mut inbound = tokio::select! {
            guard = self.inner.inbound.lock() => guard,
            _ = self.inner.terminated.cancelled() => return Err(SessionError::Terminated),
            _ = self.inner.shutdown.cancelled() => return Err(SessionError::ShuttingDown),
        };

        loop {
            let next = tokio::select! {
                next = inbound.next() => next,
                _ = self.inner.terminated.cancelled() => return Err(SessionError::Terminated),
                _ = self.inner.shutdown.cancelled() => return Err(SessionError::ShuttingDown),
            };

            match next {
                Some(Ok(Message::Text(text))) => return Ok(SessionMessage::Text(text.as_str().to_owned())),
                Some(Ok(Message::Binary(data))) => return Ok(SessionMessage::Binary(data)),
                Some(Ok(Message::Close(frame))) => {
                    let (code, reason) = match frame {
                        Some(frame) => (u16::from(frame.code), frame.reason.as_str().to_owned()),
                        None => (u16::from(CloseCode::Status), String::new()),
                    };
                    self.record_close(CloseStatus {
                        code,
                        reason: reason.clone(),
                        by_peer: true,
                    });
                    return Err(SessionError::Closed { code, reason });
                }
                Some(Ok(_)) => continue,
                Some(Err(error)) => {
                    tracing::debug!(error = %error, "WebSocket receive failed");
                    self.fail(&error);
                    return Err(SessionError::Protocol(error));
                }
                None => {
                    let code = u16::from(CloseCode::Abnormal);
                    let reason = "connection closed without close frame".to_string();
                    self.record_close(CloseStatus {
                        code,
                        reason: reason.clone(),
                        by_peer: false,
                    });
                    self.terminate();
                    return Err(SessionError::Closed { code, reason });
                }
            }
        }
    }

    /// Enqueue a message, suspending while the outbound queue is full.
    pub async fn send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Terminated);
        }
        tokio::select! {
            sent = self.inner.outbound.enqueue(message) => sent.map_err(|_| SessionError::QueueClosed),
            _ = self.inner.terminated.cancelled() => Err(SessionError::Terminated),
            _ = self.inner.shutdown.cancelled() => Err(SessionError::ShuttingDown),
        }
    }

    /// Enqueue without waiting; fails with [`SessionError::QueueFull`] when full.
    pub fn try_send(&self, message: OutboundMessage) -> Result<(), SessionError> {
        if self.is_terminated() {
            return Err(SessionError::Terminated);
        }
        self.inner.outbound.try_enqueue(message).map_err(|e| match e {
            QueueError::Full(_) => SessionError::QueueFull,
            QueueError::Closed(_) => SessionError::QueueClosed,
        })
    }

    /// Enqueue, waiting at most `timeout` for queue space.
    pub async fn send_timeout(&self, message: OutboundMessage, timeout: Duration) -> Result<(), SessionError> {
        tokio::time::timeout(timeout, self.send(message))
            .await
            .map_err(|_| SessionError::Timeout)?
    }

    pub async fn send_text(&self, text: impl Into<String>) -> Result<(), SessionError> {
        self.send(OutboundMessage::text(text)).await
    }

    pub async fn send_binary(&self, payload: impl Into<Bytes>) -> Result<(), SessionError> {
        self.send(OutboundMessage::binary(payload)).await
    }

    /// Close the socket with `code` and `reason` after every message queued before it.
    ///
    /// Resolves once the session has terminated. When called from the
    /// callback itself, the callback is cancelled at that point.
    pub async fn close(&self, code: u16, reason: impl Into<String>) -> Result<(), SessionError> {
        let mut reason = reason.into();
        if reason.len() > MAX_CLOSE_REASON {
            let mut end = MAX_CLOSE_REASON;
            while !reason.is_char_boundary(end) {
                end -= 1;
            }
            reason.truncate(end);
        }
        self.send(OutboundMessage::close(code, reason)).await?;
        self.terminated().await;
        Ok(())
    }

    /// Drop the connection at once, without the close handshake.
    ///
    /// Anything still queued is discarded.
    pub fn abort(&self) {
        self.record_close(CloseStatus {
            code: u16::from(CloseCode::Abnormal),
            reason: "aborted".to_string(),
            by_peer: false,
        });
        self.terminate();
    }

    /// Read and discard inbound traffic until the peer's close frame or end of stream.
    pub(crate) async fn drain_inbound(&self) {
        let mut inbound = self.inner.inbound.lock().await;
        while let Some(Ok(message)) = inbound.next().await {
            if message.is_close() {
                break;
            }
        }
    }
}

impl std::fmt::Debug for WebSocketSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketSession")
            .field("path", &self.path())
            .field("correlation_id", &self.correlation_id())
            .field("terminated", &self.is_terminated())
            .finish()
    }
}

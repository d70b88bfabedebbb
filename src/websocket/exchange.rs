//! WebSocket exchange driver.
//!
//! # Responsibilities
//! - Run the sender loop and the application callback concurrently
//! - Decide how the session ends and perform the matching close
//! - Close and drain the outbound queue on every exit path
//!
//! # Data Flow
//! ```text
//! Upgraded socket ─ split ─┬─ sink   ← sender loop ← outbound queue ← session.send()
//!                          └─ stream → session.receive() → callback
//!
//! Termination:
//!     callback returned      → flush queue, close 1000 (bounded), else abort
//!     callback closed        → close frame in queue order, await the reply (bounded)
//!     socket error / closed  → cancel the other side, no handshake
//!     callback aborted       → no handshake
//!     shutdown               → close 1001 "unavailable" (bounded), else abort
//!     callback failed        → log, close 1011 (bounded), else abort
//! ```
//!
//! # Design Decisions
//! - The sender loop is the only writer; wire order is queue order
//! - The loop is told to drain or abort through a watch channel so that it is
//!   never cancelled in the middle of a write on the graceful path
//! - Non-final fragments are written as raw frames; the next frame continues them

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::protocol::frame::coding::{CloseCode, Data, OpCode};
use tokio_tungstenite::tungstenite::protocol::frame::Frame;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::WebSocketStream;

use crate::config::WebSocketConfig;
use crate::execution::{panic_message, ExecError, ExecutionMode, Executor};
use crate::http::RequestInfo;
use crate::lifecycle::ShutdownSignal;
use crate::routing::WebSocketHandler;
use crate::websocket::outbound::{self, FrameKind, OutboundMessage, OutboundReceiver};
use crate::websocket::session::{CloseStatus, SessionError, WebSocketSession};
use crate::BoxError;

const SHUTDOWN_REASON: &str = "Server is shutting down";
const FAILURE_REASON: &str = "Internal server error";

/// Per-session limits.
#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub queue_capacity: usize,
    pub close_timeout: Duration,
}

impl From<&WebSocketConfig> for SessionSettings {
    fn from(config: &WebSocketConfig) -> Self {
        Self {
            queue_capacity: config.send_queue_capacity,
            close_timeout: Duration::from_millis(config.close_timeout_ms),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&WebSocketConfig::default())
    }
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    /// The callback returned normally.
    Completed,
    /// The callback closed the socket with its own status.
    Closed(CloseStatus),
    /// The socket closed or failed underneath the session.
    SocketClosed(Option<CloseStatus>),
    /// Process shutdown.
    ShuttingDown,
    /// The callback failed or panicked.
    Failed(String),
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Completed => f.write_str("completed"),
            Termination::Closed(status) => write!(f, "closed by handler ({})", status.code),
            Termination::SocketClosed(Some(status)) => write!(f, "socket closed ({})", status.code),
            Termination::SocketClosed(None) => f.write_str("socket closed"),
            Termination::ShuttingDown => f.write_str("shutting down"),
            Termination::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopMode {
    Running,
    /// Refuse new messages, write what is queued, then return.
    Drain,
    /// Return at the next opportunity.
    Abort,
}

/// Drive one upgraded connection until it terminates.
pub async fn run_session<S>(
    ws: WebSocketStream<S>,
    info: RequestInfo,
    handler: WebSocketHandler,
    executor: Executor,
    mode: ExecutionMode,
    settings: SessionSettings,
    shutdown: ShutdownSignal,
) -> Termination
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (mut sink, stream) = ws.split();
    let (outbound, mut queue) = outbound::channel(settings.queue_capacity);
    let session = WebSocketSession::new(info, outbound, stream.boxed(), shutdown.clone());

    tracing::debug!(mode = %mode, "WebSocket session open");

    let (stop_tx, stop_rx) = watch::channel(StopMode::Running);
    let mut pump = Box::pin(send_loop(&mut sink, &mut queue, stop_rx));
    let mut callback = Box::pin(executor.run(mode, handler(session.clone())));

    // Shutdown and socket termination take precedence over a callback that
    // returned because of them.
    let termination = tokio::select! {
        biased;
        _ = shutdown.cancelled() => Termination::ShuttingDown,
        _ = session.terminated() => Termination::SocketClosed(session.close_status()),
        sent = &mut pump => match sent {
            Ok(Some(status)) => Termination::Closed(status),
            Ok(None) => Termination::SocketClosed(session.close_status()),
            Err(error) => {
                tracing::debug!(error = %error, "WebSocket send failed");
                session.fail(&error);
                Termination::SocketClosed(session.close_status())
            }
        },
        outcome = &mut callback => classify(&session, &shutdown, outcome),
    };

    // Cancels the callback wherever it runs.
    drop(callback);

    let deadline = Instant::now() + settings.close_timeout;

    let mut requested_close = None;
    let drained = if termination == Termination::Completed {
        let _ = stop_tx.send(StopMode::Drain);
        match tokio::time::timeout_at(deadline, &mut pump).await {
            Ok(Ok(close)) => {
                requested_close = close;
                true
            }
            Ok(Err(error)) => {
                tracing::debug!(error = %error, "WebSocket flush failed");
                false
            }
            Err(_) => {
                tracing::debug!("WebSocket flush timed out");
                false
            }
        }
    } else {
        let _ = stop_tx.send(StopMode::Abort);
        false
    };
    drop(pump);

    session.terminate();
    queue.close();
    let discarded = queue.discard_remaining();
    if discarded > 0 {
        tracing::debug!(discarded = discarded, "Discarded queued WebSocket messages");
    }

    match &termination {
        Termination::Completed => match (drained, requested_close) {
            (true, Some(status)) => await_close_reply(deadline, &session, &status).await,
            (true, None) => close_within(deadline, &mut sink, &session, CloseCode::Normal, "").await,
            (false, _) => {}
        },
        Termination::Closed(status) => await_close_reply(deadline, &session, status).await,
        Termination::SocketClosed(status) => {
            // The transport already queued its reply to a peer-initiated close.
            if status.as_ref().is_some_and(|s| s.by_peer) {
                let _ = tokio::time::timeout_at(deadline, sink.flush()).await;
            }
        }
        Termination::ShuttingDown => {
            close_within(deadline, &mut sink, &session, CloseCode::Away, SHUTDOWN_REASON).await;
        }
        Termination::Failed(reason) => {
            tracing::error!(error = %reason, "WebSocket handler failed");
            close_within(deadline, &mut sink, &session, CloseCode::Error, FAILURE_REASON).await;
        }
    }

    termination
}

fn classify(
    session: &WebSocketSession,
    shutdown: &ShutdownSignal,
    outcome: Result<Result<(), BoxError>, ExecError>,
) -> Termination {
    match outcome {
        Ok(Ok(())) if shutdown.is_cancelled() => Termination::ShuttingDown,
        Ok(Ok(())) if session.is_terminated() => Termination::SocketClosed(session.close_status()),
        Ok(Ok(())) => Termination::Completed,
        Ok(Err(error)) => match error.downcast::<SessionError>() {
            Ok(error) => match *error {
                SessionError::ShuttingDown => Termination::ShuttingDown,
                SessionError::Closed { .. }
                | SessionError::Protocol(_)
                | SessionError::Terminated
                | SessionError::QueueClosed => Termination::SocketClosed(session.close_status()),
                other => Termination::Failed(other.to_string()),
            },
            Err(error) => Termination::Failed(error.to_string()),
        },
        Err(error) => Termination::Failed(error.to_string()),
    }
}

/// Wait for the peer to answer a close frame the sender loop already wrote.
async fn await_close_reply(deadline: Instant, session: &WebSocketSession, status: &CloseStatus) {
    match tokio::time::timeout_at(deadline, session.drain_inbound()).await {
        Ok(()) => tracing::debug!(code = status.code, reason = %status.reason, "WebSocket closed by handler"),
        Err(_) => tracing::debug!(code = status.code, "Close handshake timed out, aborting"),
    }
}

/// Send a close frame and wait for the peer's reply, giving up at `deadline`.
async fn close_within<K>(
    deadline: Instant,
    sink: &mut K,
    session: &WebSocketSession,
    code: CloseCode,
    reason: &'static str,
) where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let handshake = async {
        let frame = CloseFrame {
            code,
            reason: reason.into(),
        };
        sink.send(Message::Close(Some(frame))).await?;
        session.drain_inbound().await;
        Ok::<(), WsError>(())
    };

    match tokio::time::timeout_at(deadline, handshake).await {
        Ok(Ok(())) => tracing::debug!(code = u16::from(code), "WebSocket closed"),
        Ok(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {}
        Ok(Err(error)) => tracing::debug!(error = %error, "Close handshake failed, aborting"),
        Err(_) => tracing::debug!("Close handshake timed out, aborting"),
    }
}

/// The single writer. Returns when told to abort, when draining finished, or
/// with the status of a close request once its frame is written.
async fn send_loop<K>(
    sink: &mut K,
    queue: &mut OutboundReceiver,
    mut stop: watch::Receiver<StopMode>,
) -> Result<Option<CloseStatus>, WsError>
where
    K: Sink<Message, Error = WsError> + Unpin,
{
    let mut draining = false;
    let mut in_fragment = false;

    loop {
        let next = if draining {
            queue.dequeue().await
        } else {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    let mode = if changed.is_ok() { *stop.borrow_and_update() } else { StopMode::Abort };
                    match mode {
                        StopMode::Running => {}
                        StopMode::Drain => {
                            queue.close();
                            draining = true;
                        }
                        StopMode::Abort => return Ok(None),
                    }
                    continue;
                }
                next = queue.dequeue() => next,
            }
        };

        let Some(mut message) = next else {
            return Ok(None);
        };

        if let Some(status) = message.close_request().cloned() {
            let frame = CloseFrame {
                code: CloseCode::from(status.code),
                reason: status.reason.clone().into(),
            };
            sink.send(Message::Close(Some(frame))).await?;
            return Ok(Some(status));
        }

        sink.send(frame_for(&message, &mut in_fragment)).await?;

        if let Some(callback) = message.take_callback() {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
                tracing::warn!(error = %panic_message(payload.as_ref()), "Post-send callback panicked");
            }
        }
    }
}

fn frame_for(message: &OutboundMessage, in_fragment: &mut bool) -> Message {
    let data = if *in_fragment {
        Data::Continue
    } else {
        match message.kind() {
            FrameKind::Text => Data::Text,
            FrameKind::Binary => Data::Binary,
        }
    };
    *in_fragment = !message.is_end_of_message();
    Message::Frame(Frame::message(
        message.payload().clone(),
        OpCode::Data(data),
        message.is_end_of_message(),
    ))
}

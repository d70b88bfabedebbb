//! Bounded outbound message queue.
//!
//! # Responsibilities
//! - Carry outbound messages from any number of producers to the sender loop
//! - Apply back-pressure: a full queue suspends the producer, nothing is dropped
//! - Close for writes, releasing every blocked producer
//!
//! # Design Decisions
//! - A bounded `tokio::sync::mpsc` channel; FIFO order is the channel order
//! - Closing keeps already-queued messages so a graceful close can still flush them

use std::fmt;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::websocket::session::CloseStatus;

/// Frame kind of an outbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    Text,
    Binary,
}

type SentCallback = Box<dyn FnOnce() + Send>;

/// A message waiting to be written by the sender loop.
pub struct OutboundMessage {
    pub(crate) payload: Bytes,
    pub(crate) kind: FrameKind,
    pub(crate) end_of_message: bool,
    on_sent: Option<SentCallback>,
    /// Set on the close request queued by `WebSocketSession::close`.
    close: Option<CloseStatus>,
}

impl OutboundMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(FrameKind::Text, Bytes::from(text.into()))
    }

    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Self::new(FrameKind::Binary, payload.into())
    }

    fn new(kind: FrameKind, payload: Bytes) -> Self {
        Self {
            payload,
            kind,
            end_of_message: true,
            on_sent: None,
            close: None,
        }
    }

    /// A close handshake request; the sender loop stops after writing it.
    pub(crate) fn close(code: u16, reason: String) -> Self {
        let mut message = Self::new(FrameKind::Text, Bytes::new());
        message.close = Some(CloseStatus {
            code,
            reason,
            by_peer: false,
        });
        message
    }

    /// Mark this as a non-final fragment; the message continues with the next one.
    pub fn partial(mut self) -> Self {
        self.end_of_message = false;
        self
    }

    pub fn with_end_of_message(mut self, end_of_message: bool) -> Self {
        self.end_of_message = end_of_message;
        self
    }

    /// Run `callback` once the frame has been written to the socket.
    pub fn on_sent(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_sent = Some(Box::new(callback));
        self
    }

    pub fn kind(&self) -> FrameKind {
        self.kind
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn is_end_of_message(&self) -> bool {
        self.end_of_message
    }

    pub(crate) fn take_callback(&mut self) -> Option<SentCallback> {
        self.on_sent.take()
    }

    pub(crate) fn close_request(&self) -> Option<&CloseStatus> {
        self.close.as_ref()
    }
}

impl fmt::Debug for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OutboundMessage")
            .field("kind", &self.kind)
            .field("len", &self.payload.len())
            .field("end_of_message", &self.end_of_message)
            .field("has_callback", &self.on_sent.is_some())
            .field("close", &self.close)
            .finish()
    }
}

/// Enqueue failure.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Outbound queue is full")]
    Full(OutboundMessage),
    #[error("Outbound queue is closed")]
    Closed(OutboundMessage),
}

/// Create a queue holding at most `capacity` messages.
pub fn channel(capacity: usize) -> (OutboundSender, OutboundReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (OutboundSender { tx }, OutboundReceiver { rx })
}

/// Producer side. Cheap to clone.
#[derive(Debug, Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<OutboundMessage>,
}

impl OutboundSender {
    /// Enqueue, suspending while the queue is full.
    pub async fn enqueue(&self, message: OutboundMessage) -> Result<(), QueueError> {
        self.tx
            .send(message)
            .await
            .map_err(|mpsc::error::SendError(m)| QueueError::Closed(m))
    }

    /// Enqueue without waiting.
    pub fn try_enqueue(&self, message: OutboundMessage) -> Result<(), QueueError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(m) => QueueError::Full(m),
            mpsc::error::TrySendError::Closed(m) => QueueError::Closed(m),
        })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Free slots right now.
    pub fn available(&self) -> usize {
        self.tx.capacity()
    }
}

/// Consumer side, owned by the sender loop.
#[derive(Debug)]
pub struct OutboundReceiver {
    rx: mpsc::Receiver<OutboundMessage>,
}

impl OutboundReceiver {
    /// Next message in FIFO order. `None` once closed and empty.
    pub async fn dequeue(&mut self) -> Option<OutboundMessage> {
        self.rx.recv().await
    }

    pub fn try_dequeue(&mut self) -> Option<OutboundMessage> {
        self.rx.try_recv().ok()
    }

    /// Refuse further enqueues and wake every blocked producer. Queued messages stay.
    pub fn close(&mut self) {
        self.rx.close();
    }

    /// Drop everything still queued without sending it. Returns how many were dropped.
    pub fn discard_remaining(&mut self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn text_of(message: &OutboundMessage) -> &str {
        std::str::from_utf8(message.payload()).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let (tx, mut rx) = channel(8);
        for i in 0..3 {
            tx.enqueue(OutboundMessage::text(format!("m{}", i))).await.unwrap();
        }
        for i in 0..3 {
            let message = rx.dequeue().await.unwrap();
            assert_eq!(text_of(&message), format!("m{}", i));
        }
    }

    #[tokio::test]
    async fn test_full_queue_suspends_producer() {
        let (tx, mut rx) = channel(2);
        tx.enqueue(OutboundMessage::text("a")).await.unwrap();
        tx.enqueue(OutboundMessage::text("b")).await.unwrap();
        assert!(matches!(tx.try_enqueue(OutboundMessage::text("x")), Err(QueueError::Full(_))));

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.enqueue(OutboundMessage::text("c")).await })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!producer.is_finished());

        assert_eq!(text_of(&rx.dequeue().await.unwrap()), "a");
        producer.await.unwrap().unwrap();

        assert_eq!(text_of(&rx.dequeue().await.unwrap()), "b");
        assert_eq!(text_of(&rx.dequeue().await.unwrap()), "c");
    }

    #[tokio::test]
    async fn test_close_releases_blocked_producers() {
        let (tx, mut rx) = channel(1);
        tx.enqueue(OutboundMessage::text("queued")).await.unwrap();

        let blocked = {
            let tx = tx.clone();
            tokio::spawn(async move { tx.enqueue(OutboundMessage::text("blocked")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        rx.close();
        let result = tokio::time::timeout(Duration::from_secs(1), blocked)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(QueueError::Closed(_))));
        assert!(tx.is_closed());

        assert_eq!(text_of(&rx.dequeue().await.unwrap()), "queued");
        assert!(rx.dequeue().await.is_none());
    }

    #[tokio::test]
    async fn test_discard_remaining() {
        let (tx, mut rx) = channel(4);
        tx.enqueue(OutboundMessage::text("a")).await.unwrap();
        tx.enqueue(OutboundMessage::binary(vec![1u8, 2])).await.unwrap();
        rx.close();
        assert_eq!(rx.discard_remaining(), 2);
        assert!(rx.is_empty());
    }
}

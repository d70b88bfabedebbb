//! Exchange lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique exchange IDs for tracing
//! - Count in-flight exchanges
//! - Let shutdown wait until every exchange has closed
//!
//! # Design Decisions
//! - Closing is tied to dropping the guard, so it happens exactly once
//! - A watch channel carries the live count; waiters never poll

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

/// Relaxed ordering is sufficient since we only need uniqueness.
static EXCHANGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExchangeId(u64);

impl ExchangeId {
    pub fn new() -> Self {
        Self(EXCHANGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ExchangeId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ex-{}", self.0)
    }
}

/// Tracks in-flight exchanges for graceful shutdown.
#[derive(Debug, Clone)]
pub struct ExchangeTracker {
    active: Arc<watch::Sender<u64>>,
}

impl ExchangeTracker {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(0);
        Self { active: Arc::new(tx) }
    }

    /// Record a new exchange. The returned guard closes it on drop.
    pub fn track(&self) -> ExchangeGuard {
        self.active.send_modify(|n| *n += 1);
        ExchangeGuard {
            active: Arc::clone(&self.active),
            id: ExchangeId::new(),
        }
    }

    pub fn active_count(&self) -> u64 {
        *self.active.borrow()
    }

    /// Wait until no exchange is in flight.
    pub async fn wait_idle(&self) {
        let mut rx = self.active.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }
}

impl Default for ExchangeTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Guard for one exchange's lifetime.
#[derive(Debug)]
pub struct ExchangeGuard {
    active: Arc<watch::Sender<u64>>,
    id: ExchangeId,
}

impl ExchangeGuard {
    pub fn id(&self) -> ExchangeId {
        self.id
    }
}

impl Drop for ExchangeGuard {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n = n.saturating_sub(1));
        tracing::trace!(exchange_id = %self.id, "Exchange closed");
    }
}

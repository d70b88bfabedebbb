//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Dispatcher lifecycle events:
//!     → hooks.rs (ObserverSet fans out to ExchangeObserver impls)
//!     → metrics.rs (MetricsObserver: counters, gauges, histograms)
//!
//! All subsystems produce:
//!     → logging.rs (structured log events inside the `exchange` span)
//! ```
//!
//! # Design Decisions
//! - Structured logging (JSON) for machine parsing
//! - Correlation id flows through all log lines of an exchange
//! - Observer failures never reach the exchange

pub mod hooks;
pub mod logging;
pub mod metrics;

pub use hooks::{ExchangeObserver, ExchangeSummary, ExchangeTimings, ObserverSet};
pub use logging::init_logging;
pub use metrics::{init_metrics, MetricsObserver};

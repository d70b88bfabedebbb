//! Server setup and the accept loop.
//!
//! # Responsibilities
//! - Build the execution contexts and the dispatcher from configuration
//! - Accept connections and serve HTTP/1.1 on each, upgrades enabled
//! - On shutdown: stop accepting, close idle connections, drain exchanges
//!
//! # Design Decisions
//! - One task per connection; a failing connection never stops the loop
//! - Drain is bounded by `shutdown.drain_timeout_secs`

use std::convert::Infallible;
use std::net::SocketAddr;
use std::time::Duration;

use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::Request;
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;

use crate::config::ServerConfig;
use crate::execution::{ExecError, Executor};
use crate::http::dispatcher::Dispatcher;
use crate::lifecycle::ShutdownSignal;
use crate::net::{ConnectionPermit, ExchangeTracker, Listener, ListenerError};
use crate::observability::ObserverSet;
use crate::routing::SharedRouteTable;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Listener(#[from] ListenerError),
    #[error("Failed to start execution contexts: {0}")]
    Execution(#[from] ExecError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The request-serving layer.
#[derive(Debug)]
pub struct Server {
    config: ServerConfig,
    routes: SharedRouteTable,
    observers: ObserverSet,
    executor: Executor,
    tracker: ExchangeTracker,
}

impl Server {
    /// Create a server. Starts the background pool and the serializing context if configured.
    pub fn new(
        config: ServerConfig,
        routes: impl Into<SharedRouteTable>,
        observers: ObserverSet,
    ) -> Result<Self, ServerError> {
        let executor = Executor::from_config(&config.workers)?;
        Ok(Self {
            config,
            routes: routes.into(),
            observers,
            executor,
            tracker: ExchangeTracker::new(),
        })
    }

    /// Route table handle; replacing its contents affects new requests only.
    pub fn routes(&self) -> &SharedRouteTable {
        &self.routes
    }

    pub fn tracker(&self) -> &ExchangeTracker {
        &self.tracker
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Serve connections from `listener` until `shutdown` fires, then drain.
    pub async fn run(self, listener: Listener, shutdown: ShutdownSignal) -> Result<(), ServerError> {
        let addr = listener.local_addr()?;
        tracing::info!(
            address = %addr,
            routes = self.routes.load().len(),
            "Server starting"
        );

        let dispatcher = Dispatcher::new(
            &self.config,
            self.routes.clone(),
            self.executor.clone(),
            self.observers.clone(),
            self.tracker.clone(),
            shutdown.clone(),
        );

        loop {
            let accepted = tokio::select! {
                accepted = listener.accept() => accepted,
                _ = shutdown.cancelled() => break,
            };

            match accepted {
                Ok((stream, peer, permit)) => {
                    tokio::spawn(serve_connection(
                        stream,
                        peer,
                        permit,
                        dispatcher.clone(),
                        shutdown.clone(),
                    ));
                }
                Err(ListenerError::Closed) => {
                    tracing::warn!("Listener closed");
                    break;
                }
                Err(error) => {
                    tracing::warn!(error = %error, "Failed to accept connection");
                }
            }
        }

        tracing::info!(
            active = self.tracker.active_count(),
            "Stopped accepting connections, draining"
        );

        let drain = Duration::from_secs(self.config.shutdown.drain_timeout_secs);
        match tokio::time::timeout(drain, self.tracker.wait_idle()).await {
            Ok(()) => tracing::info!("All exchanges closed"),
            Err(_) => tracing::warn!(
                active = self.tracker.active_count(),
                "Drain timeout elapsed with exchanges still open"
            ),
        }

        tracing::info!("Server stopped");
        Ok(())
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    permit: ConnectionPermit,
    dispatcher: Dispatcher,
    shutdown: ShutdownSignal,
) {
    let _permit = permit;

    let service = service_fn(move |request: Request<Incoming>| {
        let dispatcher = dispatcher.clone();
        async move { Ok::<_, Infallible>(dispatcher.serve(request, peer).await) }
    });

    let connection = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades();
    tokio::pin!(connection);

    let result = tokio::select! {
        result = connection.as_mut() => result,
        _ = shutdown.cancelled() => {
            connection.as_mut().graceful_shutdown();
            connection.await
        }
    };

    if let Err(error) = result {
        tracing::debug!(peer = %peer, error = %error, "Connection ended with error");
    }
}

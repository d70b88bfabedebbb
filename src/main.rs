//! switchyard demo server.
//!
//! # Architecture Overview
//!
//! ```text
//!     Client ──▶ net::Listener ──▶ http::Server (hyper, one task per connection)
//!                                        │
//!                                        ▼
//!                               http::Dispatcher ── routing::RouteTable
//!                                 │            │
//!                     plain HTTP  ▼            ▼  WebSocket upgrade
//!                     http::exchange      websocket::exchange
//!                          │                   │  sender loop ◀─ outbound queue
//!                          ▼                   ▼
//!                  execution::Executor (inline | background pool | serialized)
//!
//!     Cross-cutting: config, lifecycle (shutdown), observability (logs, observers, metrics)
//! ```
//!
//! Registers a handful of endpoints that exercise typed parameters, body
//! parsing, short-circuit outcomes and a WebSocket echo.

use std::path::PathBuf;
use std::sync::Arc;

use axum::http::{Method, StatusCode};
use clap::Parser;

use switchyard::config::{load_config, validate_config, ConfigError, ServerConfig};
use switchyard::http::{ExchangeContext, Reject, Reply, Server};
use switchyard::lifecycle::{spawn_signal_listener, Shutdown};
use switchyard::net::Listener;
use switchyard::observability::{init_logging, init_metrics, ExchangeObserver, MetricsObserver, ObserverSet};
use switchyard::routing::{EndpointFlags, RouteError, RouteTable, RouteTableBuilder};
use switchyard::websocket::{SessionError, SessionMessage, WebSocketSession};
use switchyard::BoxError;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(about = "Routing and WebSocket serving layer (demo server)", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override `listener.bind_address`
    #[arg(short, long)]
    bind: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => load_config(path)?,
        None => ServerConfig::default(),
    };
    if let Some(bind) = cli.bind {
        config.listener.bind_address = bind;
        validate_config(&config).map_err(ConfigError::Validation)?;
    }

    init_logging(&config.observability)?;
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "switchyard starting");

    let mut observers: Vec<Arc<dyn ExchangeObserver>> = Vec::new();
    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse() {
            Ok(addr) => {
                init_metrics(addr)?;
                observers.push(Arc::new(MetricsObserver));
            }
            Err(_) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                "Failed to parse metrics address"
            ),
        }
    }

    let routes = demo_routes()?;
    for route in routes.documented() {
        tracing::debug!(template = %route.template.pattern(), kind = %route.kind(), "Documented endpoint");
    }

    let listener = Listener::bind(&config.listener).await?;
    let server = Server::new(config, routes, ObserverSet::new(observers))?;

    let shutdown = Shutdown::new();
    spawn_signal_listener(shutdown.clone());

    server.run(listener, shutdown.subscribe()).await?;

    tracing::info!("Shutdown complete");
    Ok(())
}

fn demo_routes() -> Result<RouteTable, RouteError> {
    let mut builder = RouteTableBuilder::new();

    builder
        .register(
            "/",
            &[Method::GET],
            |_ctx: ExchangeContext| async move {
                Ok::<_, Reject>(Reply::html("<h1>switchyard</h1>"))
            },
            EndpointFlags::default(),
        )?
        .register(
            "/user/<string:name>",
            &[Method::GET],
            |ctx: ExchangeContext| async move {
                let name: &str = ctx.params().get_as("name").unwrap_or_default();
                Ok::<_, Reject>(Reply::json(&serde_json::json!({ "hello": name }))?)
            },
            EndpointFlags::default(),
        )?
        .register(
            "/user/<int:id>/report",
            &[Method::GET],
            |ctx: ExchangeContext| async move {
                let id: i32 = ctx.params().get_as("id").unwrap_or_default();
                let lines = (1..=3).map(|n| format!("report {} line {}", id, n)).collect::<Vec<_>>();
                Ok::<_, Reject>(Reply::text(lines.join("\n")))
            },
            EndpointFlags::background(),
        )?
        .register(
            "/data",
            &[Method::POST, Method::PUT],
            |ctx: ExchangeContext| async move {
                match ctx.json() {
                    Some(value) => Ok(Reply::json(value)?),
                    None => Err(Reject::respond(Reply::status_text(
                        StatusCode::UNSUPPORTED_MEDIA_TYPE,
                        format!("Expected JSON, got {}", ctx.parsed_body().label()),
                    ))),
                }
            },
            EndpointFlags::default(),
        )?
        .register(
            "/private",
            &[Method::GET],
            |ctx: ExchangeContext| async move {
                match ctx.header("authorization") {
                    Some(_) => Ok(Reply::text("welcome")),
                    None => Err(Reject::Unauthorized),
                }
            },
            EndpointFlags::default().undocumented(),
        )?
        .register_websocket("/ws/echo", echo, EndpointFlags::default())?;

    Ok(builder.build())
}

async fn echo(session: WebSocketSession) -> Result<(), BoxError> {
    loop {
        match session.receive().await {
            Ok(SessionMessage::Text(text)) => session.send_text(text).await?,
            Ok(SessionMessage::Binary(data)) => session.send_binary(data).await?,
            Err(SessionError::Closed { .. }) => return Ok(()),
            Err(error) => return Err(error.into()),
        }
    }
}

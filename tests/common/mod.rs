//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::time::Duration;

use switchyard::config::ServerConfig;
use switchyard::http::Server;
use switchyard::lifecycle::Shutdown;
use switchyard::net::Listener;
use switchyard::observability::ObserverSet;
use switchyard::routing::RouteTable;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

/// A server running on an ephemeral port.
pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: Shutdown,
    pub handle: JoinHandle<()>,
}

impl TestServer {
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    pub fn ws_url(&self, path: &str) -> String {
        format!("ws://{}{}", self.addr, path)
    }

    /// Trigger shutdown and wait for the server to finish draining.
    #[allow(dead_code)]
    pub async fn stop(self) {
        self.shutdown.trigger();
        let _ = tokio::time::timeout(Duration::from_secs(10), self.handle).await;
    }
}

/// Start a server with `routes` and default configuration.
pub async fn start_server(routes: RouteTable) -> TestServer {
    start_server_with(ServerConfig::default(), routes, ObserverSet::default()).await
}

/// Start a server with explicit configuration and observers.
pub async fn start_server_with(config: ServerConfig, routes: RouteTable, observers: ObserverSet) -> TestServer {
    let tcp = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let listener = Listener::from_tcp(tcp, config.listener.max_connections);
    let addr = listener.local_addr().unwrap();

    let server = Server::new(config, routes, observers).unwrap();
    let shutdown = Shutdown::new();
    let signal = shutdown.subscribe();

    let handle = tokio::spawn(async move {
        server.run(listener, signal).await.unwrap();
    });

    TestServer { addr, shutdown, handle }
}

/// HTTP client that never goes through a system proxy.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder().no_proxy().build().unwrap()
}

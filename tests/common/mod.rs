//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use backend_header::{HttpServer, MiddlewareRegistry, ProxyConfig, Shutdown};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Start a mock backend that answers every request with `body` and the given
/// extra header lines. Returns the bound address.
pub async fn start_mock_backend(body: &'static str, headers: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let response = format!(
                    "HTTP/1.1 200 OK\r\n{}Content-Length: {}\r\nConnection: close\r\n\r\n{}",
                    headers,
                    body.len(),
                    body
                );
                let _ = socket.write_all(response.as_bytes()).await;
                let _ = socket.shutdown().await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            });
        }
    });

    addr
}

/// A running host plus the handles a test needs to drive it.
pub struct TestProxy {
    pub addr: SocketAddr,
    pub updates: mpsc::UnboundedSender<ProxyConfig>,
    pub shutdown: Shutdown,
}

/// Start the host with `config` on an ephemeral port.
pub async fn start_proxy(config: ProxyConfig) -> TestProxy {
    let registry = Arc::new(MiddlewareRegistry::with_builtins().unwrap());
    let server = HttpServer::new(config, registry).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let shutdown = Shutdown::new();
    let (updates, config_updates) = mpsc::unbounded_channel();
    let server_shutdown = shutdown.subscribe();

    tokio::spawn(async move {
        let _ = server.run(listener, config_updates, server_shutdown).await;
    });

    TestProxy {
        addr,
        updates,
        shutdown,
    }
}

pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_max_idle_per_host(0)
        .no_proxy()
        .build()
        .unwrap()
}

//! Shared fixtures for endpoint tests.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::server::{ServerSettings, TunnelServer};
use super::session::SessionRegistry;
use crate::error::Result;

pub(crate) fn test_settings() -> ServerSettings {
    ServerSettings {
        listen: "127.0.0.1:0".to_string(),
        dial_timeout: Duration::from_secs(2),
        handshake_timeout: Duration::from_secs(2),
        max_session: None,
    }
}

pub(crate) struct TestServer {
    pub addr: SocketAddr,
    pub registry: SessionRegistry,
    shutdown: CancellationToken,
    handle: JoinHandle<Result<()>>,
}

impl TestServer {
    /// Wait until every session the server opened has closed.
    pub async fn wait_idle(&self) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.registry.stats().active > 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("server sessions should drain");
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle.await.unwrap().unwrap();
    }
}

pub(crate) async fn spawn_server(settings: ServerSettings) -> TestServer {
    let server = TunnelServer::bind(settings).await.unwrap();
    let addr = server.local_addr().unwrap();
    let registry = server.registry();
    let shutdown = CancellationToken::new();
    let handle = tokio::spawn(server.run(shutdown.clone()));
    TestServer {
        addr,
        registry,
        shutdown,
        handle,
    }
}

/// TCP echo server standing in for a private service.
pub(crate) async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let (mut reader, mut writer) = stream.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    addr
}

//! Client side of the tunnel: local listeners that forward each accepted
//! connection over its own channel to the management server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use url::Url;

use super::channel::{tunnel_url, ClientChannel};
use super::relay::{relay, Termination};
use super::session::{Role, Session, SessionRegistry, SessionState};
use crate::error::Result;
use crate::protocol::{ForwardSpec, TargetDescriptor};

/// Pause after a failed accept so fd exhaustion doesn't spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

struct ClientSettings {
    server: Url,
    open_timeout: Duration,
}

#[derive(Clone)]
pub struct TunnelClient {
    settings: Arc<ClientSettings>,
    registry: SessionRegistry,
}

impl TunnelClient {
    /// `server_address` is `host:port` or a `ws://`/`wss://` URL
    pub fn new(server_address: &str, open_timeout: Duration) -> Result<Self> {
        Ok(Self {
            settings: Arc::new(ClientSettings {
                server: tunnel_url(server_address)?,
                open_timeout,
            }),
            registry: SessionRegistry::new(),
        })
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Bind the local side of one forwarding rule
    pub async fn bind(&self, spec: &ForwardSpec) -> Result<Forwarder> {
        let listener = TcpListener::bind(spec.bind_addr()).await?;
        Ok(Forwarder {
            listener,
            target: spec.target.clone(),
            client: self.clone(),
        })
    }

    /// Bind every rule, then serve them all until `shutdown` fires.
    ///
    /// Binding is all-or-nothing; a rule that cannot bind aborts startup.
    pub async fn run(&self, specs: &[ForwardSpec], shutdown: CancellationToken) -> Result<()> {
        let mut forwarders = Vec::with_capacity(specs.len());
        for spec in specs {
            let forwarder = self.bind(spec).await?;
            info!(
                "Forwarding {} -> {} via {}",
                forwarder.local_addr()?,
                spec.target,
                self.settings.server
            );
            forwarders.push(forwarder);
        }

        let tracker = TaskTracker::new();
        for forwarder in forwarders {
            tracker.spawn(forwarder.run(shutdown.clone()));
        }
        tracker.close();
        shutdown.cancelled().await;
        self.registry.log_active();
        tracker.wait().await;

        let stats = self.registry.stats();
        info!(
            opened = stats.opened,
            clean = stats.clean,
            failed = stats.failed,
            "Tunnel client stopped"
        );
        Ok(())
    }

    /// Tunnel one already-established local connection to `target`.
    pub async fn forward_connection<C>(
        &self,
        conn: C,
        target: &TargetDescriptor,
        cancel: CancellationToken,
    ) -> Result<Termination>
    where
        C: AsyncRead + AsyncWrite + Unpin,
    {
        let session = self.registry.open(Role::Client, None);
        tunnel(&self.settings, conn, session, target, &cancel).await
    }
}

/// One bound local listener
pub struct Forwarder {
    listener: TcpListener,
    target: TargetDescriptor,
    client: TunnelClient,
}

impl Forwarder {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept local connections until `shutdown` fires; every connection
    /// gets its own session and channel.
    pub async fn run(self, shutdown: CancellationToken) {
        let tracker = TaskTracker::new();

        loop {
            let (conn, peer) = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            debug!(peer = %peer, target = %self.target, "Accepted local connection");
            let _ = conn.set_nodelay(true);
            let session = self.client.registry.open(Role::Client, Some(peer));
            let settings = self.client.settings.clone();
            let target = self.target.clone();
            let cancel = shutdown.child_token();
            tracker.spawn(async move {
                let _ = tunnel(&settings, conn, session, &target, &cancel).await;
            });
        }

        tracker.close();
        tracker.wait().await;
    }
}

async fn tunnel<C>(
    settings: &ClientSettings,
    mut conn: C,
    mut session: Session,
    target: &TargetDescriptor,
    cancel: &CancellationToken,
) -> Result<Termination>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    session.set_target(target.clone());
    let outcome = run_session(settings, &mut conn, &mut session, target, cancel).await;
    let _ = conn.shutdown().await;
    drop(conn);
    session.finish(&outcome);
    outcome
}

async fn run_session<C>(
    settings: &ClientSettings,
    conn: &mut C,
    session: &mut Session,
    target: &TargetDescriptor,
    cancel: &CancellationToken,
) -> Result<Termination>
where
    C: AsyncRead + AsyncWrite + Unpin,
{
    session.advance(SessionState::Connecting)?;

    let mut channel = tokio::select! {
        biased;
        _ = cancel.cancelled() => return Ok(Termination::Cancelled),
        opened = ClientChannel::open(&settings.server, target, settings.open_timeout) => opened?,
    };

    session.advance(SessionState::Relaying)?;
    let outcome = relay(conn, &mut channel, cancel, session.counters()).await;
    channel.close_with(&outcome).await;
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;
    use crate::tunnel::testutil::{spawn_echo_server, spawn_server, test_settings};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    fn forward_to(target: SocketAddr) -> ForwardSpec {
        format!("127.0.0.1:0:{}", target).parse().unwrap()
    }

    fn payload(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(17).wrapping_add(seed))
            .collect()
    }

    /// Send `data` through the tunnel and read the echo back.
    async fn echo_through(addr: SocketAddr, data: Vec<u8>) -> Vec<u8> {
        let stream = TcpStream::connect(addr).await.unwrap();
        let (mut reader, mut writer) = stream.into_split();
        let len = data.len();
        let write = tokio::spawn(async move {
            writer.write_all(&data).await.unwrap();
            writer
        });
        let mut echoed = vec![0u8; len];
        reader.read_exact(&mut echoed).await.unwrap();
        let _writer = write.await.unwrap();
        echoed
    }

    #[tokio::test]
    async fn test_forwarder_round_trip() {
        let echo = spawn_echo_server().await;
        let server = spawn_server(test_settings()).await;
        let client = TunnelClient::new(&server.addr.to_string(), Duration::from_secs(5)).unwrap();

        let forwarder = client.bind(&forward_to(echo)).await.unwrap();
        let local = forwarder.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(forwarder.run(shutdown.clone()));

        assert_eq!(echo_through(local, b"hello".to_vec()).await, b"hello");
        assert_eq!(echo_through(local, vec![7]).await, vec![7]);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(3), handle)
            .await
            .expect("forwarder should stop")
            .unwrap();
        assert_eq!(client.registry().stats().active, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_sessions_are_independent() {
        let echo = spawn_echo_server().await;
        let server = spawn_server(test_settings()).await;
        let client = TunnelClient::new(&server.addr.to_string(), Duration::from_secs(5)).unwrap();

        let forwarder = client.bind(&forward_to(echo)).await.unwrap();
        let local = forwarder.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(forwarder.run(shutdown.clone()));

        // A session that is killed halfway through
        let victim = tokio::spawn(async move {
            let mut stream = TcpStream::connect(local).await.unwrap();
            stream.write_all(&payload(256 * 1024, 99)).await.unwrap();
            let mut some = [0u8; 1024];
            let _ = stream.read(&mut some).await;
            drop(stream);
        });

        let mut sessions = Vec::new();
        for seed in 0..3u8 {
            sessions.push(tokio::spawn(async move {
                let data = payload(2 * 1024 * 1024, seed);
                let echoed = echo_through(local, data.clone()).await;
                assert!(echoed == data, "session {} corrupted", seed);
            }));
        }

        victim.await.unwrap();
        for session in sessions {
            tokio::time::timeout(Duration::from_secs(30), session)
                .await
                .expect("session should complete")
                .unwrap();
        }

        shutdown.cancel();
        handle.await.unwrap();
        let stats = client.registry().stats();
        assert_eq!(stats.opened, 4);
        assert_eq!(stats.active, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_channel_open_failure_closes_local_connection() {
        // Nothing listens on the "server" address.
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_server = closed.local_addr().unwrap();
        drop(closed);

        let client = TunnelClient::new(&dead_server.to_string(), Duration::from_secs(2)).unwrap();
        let forwarder = client
            .bind(&"127.0.0.1:0:postgres:5432".parse().unwrap())
            .await
            .unwrap();
        let local = forwarder.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(forwarder.run(shutdown.clone()));

        // The listener survives each failure and keeps accepting.
        for _ in 0..2 {
            let mut stream = TcpStream::connect(local).await.unwrap();
            let mut buf = [0u8; 16];
            let read = tokio::time::timeout(Duration::from_secs(3), stream.read(&mut buf))
                .await
                .expect("local connection should be closed");
            assert!(matches!(read, Ok(0) | Err(_)));
        }

        let registry = client.registry();
        tokio::time::timeout(Duration::from_secs(3), async {
            while registry.stats().failed < 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("both sessions should be recorded as failed");

        shutdown.cancel();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_server_dial_failure_reported_remotely() {
        let server = spawn_server(test_settings()).await;
        let client = TunnelClient::new(&server.addr.to_string(), Duration::from_secs(5)).unwrap();

        // Valid syntax but unresolvable host: the server accepts the channel
        // and reports the dial failure back over it.
        let (conn, _other) = tokio::io::duplex(1024);
        let target: TargetDescriptor = "unresolvable.invalid:5432".parse().unwrap();
        let result = client
            .forward_connection(conn, &target, CancellationToken::new())
            .await;
        match result {
            Err(TunnelError::Remote { code, .. }) => assert_eq!(code, 1011),
            other => panic!("expected remote error, got {:?}", other),
        }
        assert_eq!(client.registry().stats().failed, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_forward_preaccepted_connection() {
        let echo = spawn_echo_server().await;
        let server = spawn_server(test_settings()).await;
        let client = TunnelClient::new(&server.addr.to_string(), Duration::from_secs(5)).unwrap();
        let target: TargetDescriptor = echo.to_string().parse().unwrap();

        let (conn, mut local) = tokio::io::duplex(64 * 1024);
        let forward = tokio::spawn({
            let client = client.clone();
            async move {
                client
                    .forward_connection(conn, &target, CancellationToken::new())
                    .await
            }
        });

        local.write_all(b"over stdio").await.unwrap();
        let mut echoed = [0u8; 10];
        local.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"over stdio");

        local.shutdown().await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(3), forward)
            .await
            .expect("session should end on local EOF")
            .unwrap();
        assert_eq!(result.unwrap(), Termination::ConnectionClosed);
        assert_eq!(client.registry().stats().clean, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_before_channel_opens() {
        let client = TunnelClient::new("127.0.0.1:9", Duration::from_secs(5)).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (conn, _other) = tokio::io::duplex(1024);
        let result = client
            .forward_connection(conn, &"redis:6379".parse().unwrap(), cancel)
            .await;
        assert_eq!(result.unwrap(), Termination::Cancelled);
        // Never reached the relay, so it counts as a failed session
        assert_eq!(client.registry().stats().failed, 1);
    }
}

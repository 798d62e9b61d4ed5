//! Server side of the tunnel: accept channels, dial targets, relay.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use http::StatusCode;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use super::channel::FrameChannel;
use super::relay::{relay, Termination};
use super::session::{Role, Session, SessionRegistry, SessionState};
use crate::error::{Result, TunnelError};
use crate::protocol::{TargetDescriptor, TARGET_HEADER, TUNNEL_PATH};

/// Pause after a failed accept so fd exhaustion doesn't spin the loop
const ACCEPT_BACKOFF: Duration = Duration::from_millis(50);

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen: String,
    pub dial_timeout: Duration,
    pub handshake_timeout: Duration,
    /// Upper bound on a session's lifetime; `None` means unlimited
    pub max_session: Option<Duration>,
}

pub struct TunnelServer {
    listener: TcpListener,
    settings: Arc<ServerSettings>,
    registry: SessionRegistry,
}

impl TunnelServer {
    pub async fn bind(settings: ServerSettings) -> Result<Self> {
        let listener = TcpListener::bind(&settings.listen).await?;
        Ok(Self {
            listener,
            settings: Arc::new(settings),
            registry: SessionRegistry::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    /// Accept tunnel channels until `shutdown` fires, then cancel live
    /// sessions and wait for them to close.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        info!("Tunnel server listening on {}", self.local_addr()?);
        let tracker = TaskTracker::new();

        loop {
            let (stream, peer) = tokio::select! {
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

            debug!(peer = %peer, "Accepted connection");
            let session = self.registry.open(Role::Server, Some(peer));
            tracker.spawn(serve_channel(
                stream,
                session,
                self.settings.clone(),
                shutdown.child_token(),
            ));
        }

        tracker.close();
        info!(
            active = tracker.len(),
            "Shutting down, waiting for sessions to close"
        );
        self.registry.log_active();
        tracker.wait().await;

        let stats = self.registry.stats();
        info!(
            opened = stats.opened,
            clean = stats.clean,
            failed = stats.failed,
            "Tunnel server stopped"
        );
        Ok(())
    }
}

async fn serve_channel(
    stream: TcpStream,
    mut session: Session,
    settings: Arc<ServerSettings>,
    cancel: CancellationToken,
) {
    let accepted = tokio::select! {
        biased;
        _ = cancel.cancelled() => None,
        accepted = accept_channel(stream, &mut session, &settings) => Some(accepted),
    };

    let outcome = match accepted {
        None => Ok(Termination::Cancelled),
        Some(Ok((channel, target))) => {
            relay_to_target(channel, &target, &mut session, &settings, &cancel).await
        }
        Some(Err(e)) => Err(e),
    };
    session.finish(&outcome);
}

/// Complete the WebSocket handshake, validating the target metadata before
/// the upgrade is accepted.
async fn accept_channel(
    stream: TcpStream,
    session: &mut Session,
    settings: &ServerSettings,
) -> Result<(FrameChannel<TcpStream>, TargetDescriptor)> {
    let mut requested: Option<Result<TargetDescriptor>> = None;
    let callback = |request: &Request, response: Response| match check_request(request) {
        Ok(target) => {
            requested = Some(Ok(target));
            Ok(response)
        }
        Err((status, err)) => {
            let rejection = reject(status, &err);
            requested = Some(Err(err));
            Err(rejection)
        }
    };

    let handshake = tokio::time::timeout(
        settings.handshake_timeout,
        accept_hdr_async(stream, callback),
    )
    .await
    .map_err(|_| TunnelError::Timeout(settings.handshake_timeout))?;

    if requested.is_some() {
        session.advance(SessionState::AwaitingTarget)?;
    }

    match (handshake, requested) {
        (Ok(ws), Some(Ok(target))) => {
            session.set_target(target.clone());
            session.advance(SessionState::Connecting)?;
            Ok((FrameChannel::new(ws), target))
        }
        (Ok(_), _) => Err(TunnelError::protocol(
            "handshake completed without a target",
        )),
        (Err(_), Some(Err(rejected))) => Err(rejected),
        (Err(e), _) => Err(e.into()),
    }
}

async fn relay_to_target(
    mut channel: FrameChannel<TcpStream>,
    target: &TargetDescriptor,
    session: &mut Session,
    settings: &ServerSettings,
    cancel: &CancellationToken,
) -> Result<Termination> {
    let dialed = tokio::select! {
        _ = cancel.cancelled() => Ok(None),
        conn = dial(target, settings.dial_timeout) => conn.map(Some),
    };

    let mut conn = match dialed {
        Ok(Some(conn)) => conn,
        Ok(None) => {
            let outcome = Ok(Termination::Cancelled);
            channel.close_with(&outcome).await;
            return outcome;
        }
        Err(e) => {
            let outcome = Err(e);
            channel.close_with(&outcome).await;
            return outcome;
        }
    };

    session.advance(SessionState::Relaying)?;

    let outcome = match settings.max_session {
        Some(limit) => tokio::time::timeout(
            limit,
            relay(&mut conn, &mut channel, cancel, session.counters()),
        )
        .await
        .unwrap_or(Err(TunnelError::Deadline(limit))),
        None => relay(&mut conn, &mut channel, cancel, session.counters()).await,
    };

    channel.close_with(&outcome).await;
    let _ = conn.shutdown().await;
    outcome
}

async fn dial(target: &TargetDescriptor, timeout: Duration) -> Result<TcpStream> {
    let addr = target.to_string();
    let stream = tokio::time::timeout(timeout, TcpStream::connect(&addr))
        .await
        .map_err(|_| TunnelError::Timeout(timeout))?
        .map_err(|source| TunnelError::Dial {
            addr: addr.clone(),
            source,
        })?;
    let _ = stream.set_nodelay(true);
    debug!(host = target.host(), port = target.port(), "Dialed target");
    Ok(stream)
}

/// Validate the upgrade request: right path, exactly one well-formed `addr`.
fn check_request(
    request: &Request,
) -> std::result::Result<TargetDescriptor, (StatusCode, TunnelError)> {
    let path = request.uri().path();
    if path != TUNNEL_PATH {
        return Err((
            StatusCode::NOT_FOUND,
            TunnelError::protocol(format!("unknown path {}", path)),
        ));
    }

    let mut values = request.headers().get_all(TARGET_HEADER).iter();
    let value = match (values.next(), values.next()) {
        (Some(value), None) => value,
        (None, _) => {
            return Err((
                StatusCode::BAD_REQUEST,
                TunnelError::protocol(format!("missing {} metadata", TARGET_HEADER)),
            ))
        }
        (Some(_), Some(_)) => {
            return Err((
                StatusCode::BAD_REQUEST,
                TunnelError::protocol(format!("more than one {} value", TARGET_HEADER)),
            ))
        }
    };

    let value = value.to_str().map_err(|_| {
        (
            StatusCode::BAD_REQUEST,
            TunnelError::invalid_target("<binary>", "not valid ASCII"),
        )
    })?;
    value
        .parse()
        .map_err(|e| (StatusCode::BAD_REQUEST, e))
}

fn reject(status: StatusCode, err: &TunnelError) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(err.to_string()));
    *response.status_mut() = status;
    response
}

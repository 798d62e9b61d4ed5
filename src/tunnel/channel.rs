//! WebSocket-backed framed message channel.
//!
//! A [`FrameChannel`] is one tunnel call: binary messages are frames, a
//! normal close is end-of-stream, and any other close code is an error
//! raised by the peer. Control frames never reach the relay.

use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use http::header::HeaderValue;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

use crate::error::{Result, TunnelError};
use crate::protocol::{TargetDescriptor, TARGET_HEADER, TUNNEL_PATH};

/// Close reasons are limited to 123 bytes by the WebSocket protocol
const MAX_CLOSE_REASON: usize = 123;

/// How long to wait for the peer's close reply before dropping the socket
const CLOSE_GRACE: Duration = Duration::from_secs(1);

pub type ClientChannel = FrameChannel<MaybeTlsStream<TcpStream>>;

pub struct FrameChannel<S> {
    ws: WebSocketStream<S>,
    finished: bool,
}

impl<S> FrameChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            finished: false,
        }
    }

    /// Close the call, reporting `outcome` to the peer, then wait briefly for
    /// its close reply.
    pub async fn close_with<T>(&mut self, outcome: &Result<T>) {
        let frame = match outcome {
            Ok(_) => CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            },
            Err(e) => CloseFrame {
                code: CloseCode::Error,
                reason: truncate_reason(&e.to_string()).into(),
            },
        };

        if let Err(e) = self.ws.close(Some(frame)).await {
            debug!("Close frame not sent: {}", e);
            return;
        }

        // Drain until the peer acknowledges; anything else is discarded.
        let _ = tokio::time::timeout(CLOSE_GRACE, async {
            while let Some(Ok(_)) = self.ws.next().await {}
        })
        .await;
    }
}

impl ClientChannel {
    /// Open a tunnel call to `server`, tagged with `target`.
    pub async fn open(server: &Url, target: &TargetDescriptor, timeout: Duration) -> Result<Self> {
        let mut request = server.as_str().into_client_request().map_err(|e| {
            TunnelError::ChannelOpen {
                url: server.to_string(),
                source: Box::new(e),
            }
        })?;

        let value = HeaderValue::from_str(&target.to_string())
            .map_err(|e| TunnelError::invalid_target(target.to_string(), e.to_string()))?;
        request.headers_mut().insert(TARGET_HEADER, value);

        let (ws, _response) = tokio::time::timeout(timeout, connect_async(request))
            .await
            .map_err(|_| TunnelError::Timeout(timeout))?
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => TunnelError::Rejected {
                    status: response.status().as_u16(),
                    reason: response
                        .body()
                        .as_ref()
                        .map(|b| String::from_utf8_lossy(b).into_owned())
                        .unwrap_or_default(),
                },
                other => TunnelError::ChannelOpen {
                    url: server.to_string(),
                    source: Box::new(other),
                },
            })?;

        Ok(Self::new(ws))
    }
}

impl<S> Stream for FrameChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Item = Result<Vec<u8>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.finished {
            return Poll::Ready(None);
        }

        loop {
            let message = match self.ws.poll_next_unpin(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(message) => message,
            };

            match message {
                Some(Ok(Message::Binary(data))) => return Poll::Ready(Some(Ok(data))),
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                Some(Ok(Message::Frame(_))) => continue,
                Some(Ok(Message::Text(_))) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(TunnelError::protocol(
                        "unexpected text message on tunnel channel",
                    ))));
                }
                Some(Ok(Message::Close(frame))) => {
                    self.finished = true;
                    return match frame {
                        Some(f) if f.code != CloseCode::Normal => {
                            Poll::Ready(Some(Err(TunnelError::Remote {
                                code: f.code.into(),
                                reason: f.reason.to_string(),
                            })))
                        }
                        _ => Poll::Ready(None),
                    };
                }
                Some(Err(tungstenite::Error::ConnectionClosed)) | None => {
                    self.finished = true;
                    return Poll::Ready(None);
                }
                Some(Err(e)) => {
                    self.finished = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
            }
        }
    }
}

impl<S> Sink<Vec<u8>> for FrameChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    type Error = TunnelError;

    fn poll_ready(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.ws.poll_ready_unpin(cx).map_err(Into::into)
    }

    fn start_send(mut self: Pin<&mut Self>, item: Vec<u8>) -> Result<()> {
        self.ws
            .start_send_unpin(Message::Binary(item))
            .map_err(Into::into)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.ws.poll_flush_unpin(cx).map_err(Into::into)
    }

    fn poll_close(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<()>> {
        self.ws.poll_close_unpin(cx).map_err(Into::into)
    }
}

/// Build the tunnel endpoint URL from `host:port` or a `ws://`/`wss://` URL.
pub fn tunnel_url(address: &str) -> Result<Url> {
    let raw = if address.contains("://") {
        address.to_string()
    } else {
        format!("ws://{}", address)
    };

    let mut url = Url::parse(&raw)
        .map_err(|e| TunnelError::protocol(format!("invalid server address {:?}: {}", address, e)))?;

    match url.scheme() {
        "ws" | "wss" => {}
        other => {
            return Err(TunnelError::protocol(format!(
                "unsupported scheme {:?} in server address",
                other
            )))
        }
    }
    if url.host_str().is_none() {
        return Err(TunnelError::protocol(format!(
            "server address {:?} has no host",
            address
        )));
    }

    url.set_path(TUNNEL_PATH);
    Ok(url)
}

fn truncate_reason(reason: &str) -> String {
    if reason.len() <= MAX_CLOSE_REASON {
        return reason.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    reason[..end].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::protocol::Role;

    async fn ws_pair() -> (
        FrameChannel<tokio::io::DuplexStream>,
        WebSocketStream<tokio::io::DuplexStream>,
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let ours = WebSocketStream::from_raw_socket(a, Role::Client, None).await;
        let theirs = WebSocketStream::from_raw_socket(b, Role::Server, None).await;
        (FrameChannel::new(ours), theirs)
    }

    #[test]
    fn test_tunnel_url() {
        assert_eq!(
            tunnel_url("admin.internal:9000").unwrap().as_str(),
            "ws://admin.internal:9000/tunnel"
        );
        assert_eq!(
            tunnel_url("wss://admin.example.com").unwrap().as_str(),
            "wss://admin.example.com/tunnel"
        );
        assert!(tunnel_url("http://admin.internal:9000").is_err());
    }

    #[test]
    fn test_truncate_reason() {
        let long = "é".repeat(100);
        let cut = truncate_reason(&long);
        assert!(cut.len() <= MAX_CLOSE_REASON);
        assert!(cut.chars().all(|c| c == 'é'));
        assert_eq!(truncate_reason("short"), "short");
    }

    #[tokio::test]
    async fn test_binary_frames_and_control_messages() {
        let (mut channel, mut peer) = ws_pair().await;

        peer.send(Message::Ping(vec![1])).await.unwrap();
        peer.send(Message::Binary(b"hello".to_vec())).await.unwrap();
        assert_eq!(channel.next().await.unwrap().unwrap(), b"hello");

        channel.send(b"world".to_vec()).await.unwrap();
        loop {
            match peer.next().await.unwrap().unwrap() {
                Message::Binary(data) => {
                    assert_eq!(data, b"world");
                    break;
                }
                Message::Pong(_) => continue,
                other => panic!("unexpected message: {:?}", other),
            }
        }
    }

    #[tokio::test]
    async fn test_normal_close_ends_stream() {
        let (mut channel, mut peer) = ws_pair().await;
        peer.close(None).await.unwrap();
        assert!(channel.next().await.is_none());
        assert!(channel.next().await.is_none());
    }

    #[tokio::test]
    async fn test_error_close_is_remote_error() {
        let (mut channel, mut peer) = ws_pair().await;
        peer.close(Some(CloseFrame {
            code: CloseCode::Error,
            reason: "failed to dial db:5432".into(),
        }))
        .await
        .unwrap();

        match channel.next().await {
            Some(Err(TunnelError::Remote { code, reason })) => {
                assert_eq!(code, 1011);
                assert_eq!(reason, "failed to dial db:5432");
            }
            other => panic!("expected remote error, got {:?}", other),
        }
        assert!(channel.next().await.is_none());
    }

    #[tokio::test]
    async fn test_text_message_is_protocol_error() {
        let (mut channel, mut peer) = ws_pair().await;
        peer.send(Message::Text("hi".to_string())).await.unwrap();
        assert!(matches!(
            channel.next().await,
            Some(Err(TunnelError::Protocol(_)))
        ));
    }

    #[tokio::test]
    async fn test_close_with_error_reports_code() {
        let (mut channel, mut peer) = ws_pair().await;
        let outcome: Result<()> = Err(TunnelError::protocol("boom"));

        let closer = tokio::spawn(async move {
            channel.close_with(&outcome).await;
        });

        match peer.next().await.unwrap().unwrap() {
            Message::Close(Some(frame)) => {
                assert_eq!(frame.code, CloseCode::Error);
                assert_eq!(frame.reason, "protocol error: boom");
            }
            other => panic!("expected close frame, got {:?}", other),
        }
        // Flushes our close reply so the closer's drain completes.
        while let Some(Ok(_)) = peer.next().await {}
        closer.await.unwrap();
    }
}

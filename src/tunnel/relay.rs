//! Byte-stream <-> frame-channel copy engine.
//!
//! The two directions run concurrently and the first one to finish decides
//! the session outcome. The other direction's future is dropped right away,
//! which cancels any read or write it was blocked in; it can never touch the
//! handles again once the result is known.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Direction, Result, TunnelError};
use crate::protocol::FRAME_BUFFER_SIZE;

/// Why a relay stopped without error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Termination {
    /// The byte connection reached end-of-stream
    ConnectionClosed,
    /// The peer ended the frame channel
    ChannelClosed,
    /// The session's cancellation token fired
    Cancelled,
}

impl fmt::Display for Termination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Termination::ConnectionClosed => write!(f, "connection closed"),
            Termination::ChannelClosed => write!(f, "channel closed"),
            Termination::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Per-session byte counters, safe to bump from either direction
#[derive(Debug, Default)]
pub struct TrafficCounters {
    downlink: AtomicU64,
    uplink: AtomicU64,
}

impl TrafficCounters {
    pub fn add(&self, direction: Direction, bytes: usize) {
        let counter = match direction {
            Direction::Downlink => &self.downlink,
            Direction::Uplink => &self.uplink,
        };
        counter.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn downlink(&self) -> u64 {
        self.downlink.load(Ordering::Relaxed)
    }

    pub fn uplink(&self) -> u64 {
        self.uplink.load(Ordering::Relaxed)
    }
}

/// Relay between `conn` and `channel` until either side ends, fails, or
/// `cancel` fires.
///
/// Both handles are borrowed; closing them afterwards is the caller's job.
pub async fn relay<C, M>(
    conn: &mut C,
    channel: &mut M,
    cancel: &CancellationToken,
    counters: &TrafficCounters,
) -> Result<Termination>
where
    C: AsyncRead + AsyncWrite + Unpin,
    M: Stream<Item = Result<Vec<u8>>> + Sink<Vec<u8>, Error = TunnelError> + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(conn);
    let (mut frames_out, mut frames_in) = channel.split();

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Ok(Termination::Cancelled),
        result = downlink(&mut reader, &mut frames_out, counters) => result,
        result = uplink(&mut frames_in, &mut writer, counters) => result,
    }
}

async fn downlink<R, S>(
    reader: &mut R,
    frames: &mut S,
    counters: &TrafficCounters,
) -> Result<Termination>
where
    R: AsyncRead + Unpin,
    S: Sink<Vec<u8>, Error = TunnelError> + Unpin,
{
    let mut buf = vec![0u8; FRAME_BUFFER_SIZE];
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| TunnelError::io(Direction::Downlink, e))?;
        if n == 0 {
            return Ok(Termination::ConnectionClosed);
        }
        frames.send(buf[..n].to_vec()).await?;
        counters.add(Direction::Downlink, n);
    }
}

async fn uplink<S, W>(
    frames: &mut S,
    writer: &mut W,
    counters: &TrafficCounters,
) -> Result<Termination>
where
    S: Stream<Item = Result<Vec<u8>>> + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Some(frame) = frames.next().await {
        let frame = frame?;
        if frame.is_empty() {
            continue;
        }
        writer
            .write_all(&frame)
            .await
            .map_err(|e| TunnelError::io(Direction::Uplink, e))?;
        writer
            .flush()
            .await
            .map_err(|e| TunnelError::io(Direction::Uplink, e))?;
        counters.add(Direction::Uplink, frame.len());
    }
    Ok(Termination::ChannelClosed)
}

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite;

/// Direction of data flow inside a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Byte connection -> frame channel
    Downlink,
    /// Frame channel -> byte connection
    Uplink,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Downlink => write!(f, "downlink"),
            Direction::Uplink => write!(f, "uplink"),
        }
    }
}

/// Broad classification used when reporting how a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// The session never reached the relay
    Setup,
    /// The relay was running and one side failed
    Transport,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Setup => write!(f, "setup"),
            ErrorKind::Transport => write!(f, "transport"),
        }
    }
}

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("invalid target address {addr:?}: {reason}")]
    InvalidTarget { addr: String, reason: String },

    #[error("invalid forward spec {spec:?}: {reason}")]
    InvalidForward { spec: String, reason: String },

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("failed to open channel to {url}: {source}")]
    ChannelOpen {
        url: String,
        #[source]
        source: Box<tungstenite::Error>,
    },

    #[error("channel rejected by server ({status}): {reason}")]
    Rejected { status: u16, reason: String },

    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{direction} I/O error: {source}")]
    Io {
        direction: Direction,
        #[source]
        source: std::io::Error,
    },

    #[error("channel error: {0}")]
    Channel(#[source] Box<tungstenite::Error>),

    #[error("remote closed the channel with code {code}: {reason}")]
    Remote { code: u16, reason: String },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("session exceeded its maximum lifetime of {0:?}")]
    Deadline(Duration),

    #[error("IO error: {0}")]
    Listener(#[from] std::io::Error),
}

impl TunnelError {
    pub fn invalid_target(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidTarget {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_forward(spec: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidForward {
            spec: spec.into(),
            reason: reason.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol(message.into())
    }

    pub fn io(direction: Direction, source: std::io::Error) -> Self {
        Self::Io { direction, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            TunnelError::InvalidTarget { .. }
            | TunnelError::InvalidForward { .. }
            | TunnelError::Protocol(_)
            | TunnelError::ChannelOpen { .. }
            | TunnelError::Rejected { .. }
            | TunnelError::Dial { .. }
            | TunnelError::Timeout(_)
            | TunnelError::Listener(_) => ErrorKind::Setup,
            TunnelError::Io { .. }
            | TunnelError::Channel(_)
            | TunnelError::Remote { .. }
            | TunnelError::Deadline(_) => ErrorKind::Transport,
        }
    }
}

impl From<tungstenite::Error> for TunnelError {
    fn from(err: tungstenite::Error) -> Self {
        TunnelError::Channel(Box::new(err))
    }
}

pub type Result<T> = std::result::Result<T, TunnelError>;

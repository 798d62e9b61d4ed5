//! Target descriptor: the `host:port` a server endpoint dials for a session.

use std::fmt;
use std::str::FromStr;

use url::Host;

use crate::error::{Result, TunnelError};

/// A syntactically valid `host:port` pair.
///
/// The host is a DNS name, an IPv4 literal or a bracketed IPv6 literal.
/// Port 0 is rejected since it cannot be dialed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    host: String,
    port: u16,
}

impl TargetDescriptor {
    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }
}

impl FromStr for TargetDescriptor {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let (host, port) = split_host_port(s)
            .ok_or_else(|| TunnelError::invalid_target(s, "expected host:port"))?;

        let port: u16 = port
            .parse()
            .map_err(|_| TunnelError::invalid_target(s, format!("invalid port {:?}", port)))?;

        validate_host(s, host)?;
        if port == 0 {
            return Err(TunnelError::invalid_target(s, "port must be non-zero"));
        }

        Ok(Self {
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for TargetDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Split `host:port`, keeping brackets on IPv6 hosts.
pub(crate) fn split_host_port(s: &str) -> Option<(&str, &str)> {
    if s.starts_with('[') {
        let end = s.find("]:")?;
        Some((&s[..=end], &s[end + 2..]))
    } else {
        let (host, port) = s.rsplit_once(':')?;
        // Unbracketed IPv6 is ambiguous
        if host.contains(':') {
            return None;
        }
        Some((host, port))
    }
}

fn validate_host(raw: &str, host: &str) -> Result<()> {
    if host.is_empty() {
        return Err(TunnelError::invalid_target(raw, "empty host"));
    }
    Host::parse(host)
        .map(|_| ())
        .map_err(|e| TunnelError::invalid_target(raw, format!("invalid host: {}", e)))
}

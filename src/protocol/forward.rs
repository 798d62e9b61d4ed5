//! SSH-style local forwarding rules (`-L [bind_address:]port:host:hostport`).

use std::fmt;
use std::str::FromStr;

use super::target::{split_host_port, TargetDescriptor};
use crate::error::{Result, TunnelError};

const DEFAULT_BIND_ADDRESS: &str = "127.0.0.1";

/// One local listener and the remote target its connections are tunnelled to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardSpec {
    pub bind_address: String,
    pub bind_port: u16,
    pub target: TargetDescriptor,
}

impl ForwardSpec {
    /// Address to hand to `TcpListener::bind`
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.bind_port)
    }
}

impl FromStr for ForwardSpec {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        // The target always occupies the last `host:hostport`; everything
        // before it is `[bind_address:]port`.
        let (local, target) = split_local_and_target(s)
            .ok_or_else(|| TunnelError::invalid_forward(s, "expected [bind_address:]port:host:hostport"))?;

        let target: TargetDescriptor = target
            .parse()
            .map_err(|e: TunnelError| TunnelError::invalid_forward(s, e.to_string()))?;

        let (bind_address, port) = match split_host_port(local) {
            Some((addr, port)) => (addr, port),
            None if !local.contains(':') => (DEFAULT_BIND_ADDRESS, local),
            None => return Err(TunnelError::invalid_forward(s, "invalid bind address")),
        };
        if bind_address.is_empty() {
            return Err(TunnelError::invalid_forward(s, "empty bind address"));
        }

        let bind_port = port
            .parse()
            .map_err(|_| TunnelError::invalid_forward(s, format!("invalid local port {:?}", port)))?;

        Ok(Self {
            bind_address: bind_address.to_string(),
            bind_port,
            target,
        })
    }
}

impl fmt::Display for ForwardSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.bind_address, self.bind_port, self.target)
    }
}

/// Split off the trailing `host:hostport`, honouring a bracketed IPv6 host.
fn split_local_and_target(s: &str) -> Option<(&str, &str)> {
    let (rest, _port) = s.rsplit_once(':')?;
    let host_start = if rest.ends_with(']') {
        rest.rfind('[')?
    } else {
        rest.rfind(':')? + 1
    };
    if host_start == 0 {
        return None;
    }
    let local = s[..host_start].strip_suffix(':')?;
    Some((local, &s[host_start..]))
}

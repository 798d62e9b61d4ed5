//! Tunnel endpoints and the relay between them.
//!
//! Every local connection gets its own session: a [`FrameChannel`] to the
//! server, a dialed connection on the far side, and a [`relay`] pumping
//! bytes between them until one side ends. Sessions never share state
//! beyond the [`SessionRegistry`] used for accounting.

mod channel;
mod client;
mod relay;
mod server;
mod session;
mod stdio;

#[cfg(test)]
pub(crate) mod testutil;

pub use client::TunnelClient;
pub use server::{ServerSettings, TunnelServer};
pub use stdio::StdioConn;

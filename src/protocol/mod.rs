//! Wire-level types shared by both tunnel endpoints.
//!
//! - [`TargetDescriptor`] - validated `host:port` carried in the `addr` header
//! - [`ForwardSpec`] - SSH-style `-L` forwarding rule
//! - [`SessionId`] - identifier for one tunnel session
//!
//! The channel itself is a WebSocket: the upgrade request on [`TUNNEL_PATH`]
//! is the call setup, [`TARGET_HEADER`] is its only metadata, and every binary
//! message is one frame of at most [`FRAME_BUFFER_SIZE`] bytes.

mod forward;
mod ids;
mod target;

pub use forward::*;
pub use ids::*;
pub use target::*;

/// Path the server accepts tunnel channels on
pub const TUNNEL_PATH: &str = "/tunnel";

/// Call-level metadata key holding the target descriptor
pub const TARGET_HEADER: &str = "addr";

/// Largest payload carried by a single frame (one read buffer)
pub const FRAME_BUFFER_SIZE: usize = 1 << 20;

//! Tunnel session lifecycle and the shared session registry.
//!
//! Every session moves through
//! `Created -> AwaitingTarget (server only) -> Connecting -> Relaying -> Closed`.
//! Any open state may fail straight to `Closed(Error)`; only a relaying
//! session can close cleanly. A [`Session`] that is dropped without being
//! finished is recorded as aborted, so the registry never leaks entries.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use chrono::{DateTime, Local};
use tracing::{debug, info, warn};

use super::relay::{Termination, TrafficCounters};
use crate::error::{ErrorKind, Result, TunnelError};
use crate::protocol::{SessionId, TargetDescriptor};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => write!(f, "client"),
            Role::Server => write!(f, "server"),
        }
    }
}

/// How a session ended; exactly one per session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Closure {
    Clean(Termination),
    Error { kind: ErrorKind, message: String },
}

impl fmt::Display for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Closure::Clean(termination) => write!(f, "clean ({})", termination),
            Closure::Error { kind, message } => write!(f, "{} error: {}", kind, message),
        }
    }
}

impl From<&TunnelError> for Closure {
    fn from(err: &TunnelError) -> Self {
        Closure::Error {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Created,
    AwaitingTarget,
    Connecting,
    Relaying,
    Closed(Closure),
}

impl SessionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed(_))
    }

    /// Whether `self -> next` is a legal move for a session playing `role`
    pub fn can_transition(&self, role: Role, next: &SessionState) -> bool {
        use SessionState::*;
        match (self, next) {
            (Closed(_), _) => false,
            (_, Closed(Closure::Error { .. })) => true,
            (Relaying, Closed(Closure::Clean(_))) => true,
            (Created, AwaitingTarget) => role == Role::Server,
            (Created, Connecting) => role == Role::Client,
            (AwaitingTarget, Connecting) => true,
            (Connecting, Relaying) => true,
            _ => false,
        }
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::Created => write!(f, "created"),
            SessionState::AwaitingTarget => write!(f, "awaiting-target"),
            SessionState::Connecting => write!(f, "connecting"),
            SessionState::Relaying => write!(f, "relaying"),
            SessionState::Closed(closure) => write!(f, "closed: {}", closure),
        }
    }
}

/// Point-in-time view of one active session
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub role: Role,
    pub peer: Option<SocketAddr>,
    pub target: Option<TargetDescriptor>,
    pub state: SessionState,
    pub started_at: DateTime<Local>,
    pub counters: Arc<TrafficCounters>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryStats {
    pub opened: u64,
    pub active: u64,
    pub clean: u64,
    pub failed: u64,
}

#[derive(Default)]
struct RegistryInner {
    sessions: RwLock<HashMap<SessionId, SessionInfo>>,
    opened: AtomicU64,
    active: AtomicU64,
    clean: AtomicU64,
    failed: AtomicU64,
}

/// Active sessions plus lifetime counters, shared by every session task
#[derive(Clone, Default)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session in the `Created` state
    pub fn open(&self, role: Role, peer: Option<SocketAddr>) -> Session {
        let id = SessionId::next();
        let counters = Arc::new(TrafficCounters::default());
        let info = SessionInfo {
            id,
            role,
            peer,
            target: None,
            state: SessionState::Created,
            started_at: Local::now(),
            counters: counters.clone(),
        };

        self.inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id, info);
        self.inner.opened.fetch_add(1, Ordering::Relaxed);
        self.inner.active.fetch_add(1, Ordering::Relaxed);
        info!(session = %id, role = %role, peer = ?peer, "Session started");

        Session {
            id,
            role,
            peer,
            target: None,
            state: SessionState::Created,
            started: Instant::now(),
            counters,
            registry: self.clone(),
        }
    }

    pub fn stats(&self) -> RegistryStats {
        RegistryStats {
            opened: self.inner.opened.load(Ordering::Relaxed),
            active: self.inner.active.load(Ordering::Relaxed),
            clean: self.inner.clean.load(Ordering::Relaxed),
            failed: self.inner.failed.load(Ordering::Relaxed),
        }
    }

    /// Active sessions ordered by id
    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let sessions = self
            .inner
            .sessions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let mut list: Vec<SessionInfo> = sessions.values().cloned().collect();
        list.sort_by_key(|s| s.id);
        list
    }

    /// Log every live session at debug level
    pub fn log_active(&self) {
        for info in self.snapshot() {
            debug!(
                session = %info.id,
                role = %info.role,
                peer = ?info.peer,
                target = ?info.target.as_ref().map(ToString::to_string),
                state = %info.state,
                since = %info.started_at.format("%H:%M:%S"),
                bytes_down = info.counters.downlink(),
                bytes_up = info.counters.uplink(),
                "Active session"
            );
        }
    }

    fn update(&self, id: SessionId, f: impl FnOnce(&mut SessionInfo)) {
        let mut sessions = self
            .inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(info) = sessions.get_mut(&id) {
            f(info);
        }
    }

    fn close(&self, id: SessionId, closure: &Closure) {
        self.inner
            .sessions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        self.inner.active.fetch_sub(1, Ordering::Relaxed);
        match closure {
            Closure::Clean(_) => self.inner.clean.fetch_add(1, Ordering::Relaxed),
            Closure::Error { .. } => self.inner.failed.fetch_add(1, Ordering::Relaxed),
        };
    }
}

/// One tunnel session, owned by the task that runs it
pub struct Session {
    id: SessionId,
    role: Role,
    peer: Option<SocketAddr>,
    target: Option<TargetDescriptor>,
    state: SessionState,
    started: Instant,
    counters: Arc<TrafficCounters>,
    registry: SessionRegistry,
}

impl Session {
    pub fn counters(&self) -> &TrafficCounters {
        &self.counters
    }

    pub fn set_target(&mut self, target: TargetDescriptor) {
        self.registry
            .update(self.id, |info| info.target = Some(target.clone()));
        self.target = Some(target);
    }

    /// Move to `next`, rejecting moves the lifecycle does not allow
    pub fn advance(&mut self, next: SessionState) -> Result<()> {
        if !self.state.can_transition(self.role, &next) {
            return Err(TunnelError::protocol(format!(
                "{} session {} cannot move from {} to {}",
                self.role, self.id, self.state, next
            )));
        }

        debug!(session = %self.id, from = %self.state, to = %next, "Session state change");
        if let SessionState::Closed(closure) = next {
            self.close(closure);
            return Ok(());
        }
        if next == SessionState::Relaying {
            info!(
                session = %self.id,
                role = %self.role,
                peer = ?self.peer,
                target = ?self.target.as_ref().map(ToString::to_string),
                "Session relaying"
            );
        }

        self.registry.update(self.id, |info| info.state = next.clone());
        self.state = next;
        Ok(())
    }

    /// Record the session outcome and remove it from the registry
    pub fn finish(mut self, outcome: &Result<Termination>) -> Closure {
        let closure = match outcome {
            Ok(termination) => Closure::Clean(*termination),
            Err(e) => Closure::from(e),
        };
        self.close(closure)
    }

    fn close(&mut self, closure: Closure) -> Closure {
        if let SessionState::Closed(existing) = &self.state {
            return existing.clone();
        }
        let closure = match (&self.state, closure) {
            // A clean end before relaying means the session never started
            (state, Closure::Clean(termination)) if *state != SessionState::Relaying => {
                Closure::Error {
                    kind: ErrorKind::Setup,
                    message: format!("ended before relaying ({})", termination),
                }
            }
            // Failures before relaying are setup failures, during it transport
            (state, Closure::Error { message, .. }) => Closure::Error {
                kind: if *state == SessionState::Relaying {
                    ErrorKind::Transport
                } else {
                    ErrorKind::Setup
                },
                message,
            },
            (_, closure) => closure,
        };

        let elapsed = self.started.elapsed();
        let target = self.target.as_ref().map(ToString::to_string);
        match &closure {
            Closure::Clean(termination) => info!(
                session = %self.id,
                role = %self.role,
                target = ?target,
                cause = %termination,
                bytes_down = self.counters.downlink(),
                bytes_up = self.counters.uplink(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Session ended"
            ),
            Closure::Error { kind, message } => warn!(
                session = %self.id,
                role = %self.role,
                target = ?target,
                kind = %kind,
                error = %message,
                bytes_down = self.counters.downlink(),
                bytes_up = self.counters.uplink(),
                elapsed_ms = elapsed.as_millis() as u64,
                "Session failed"
            ),
        }

        self.registry.close(self.id, &closure);
        self.state = SessionState::Closed(closure.clone());
        closure
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if !self.state.is_closed() {
            let _ = self.close(Closure::Error {
                kind: ErrorKind::Setup,
                message: "session aborted".to_string(),
            });
        }
    }
}

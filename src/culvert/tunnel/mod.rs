//! Reverse TCP tunneling: a server that fronts public ports and a client
//! that forwards accepted connections to a local service.
//!
//! One persistent control connection per tunnel negotiates the public port
//! and announces incoming connections; each announced connection is carried
//! by a dedicated data connection the client dials back.

pub mod auth;
pub mod client;
pub mod ports;
pub mod protocol;
pub mod relay;
pub mod server;

use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::culvert::tunnel::protocol::{ProtocolError, RejectReason};

/// Handshake must complete (through `Bind` or `Attach`) within this window.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between outbound `Heartbeat` frames on an idle control connection.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);

/// A control connection with no inbound frame for this long is considered dead.
pub const LIVENESS_TIMEOUT: Duration = Duration::from_secs(60);

/// How long in-flight relay pairs may drain after a session starts tearing
/// down before they are force-closed.
pub const STOP_GRACE: Duration = Duration::from_secs(5);

/// A parked public connection is dropped if the client's data connection does
/// not attach within this window.
pub const PENDING_CONN_TTL: Duration = Duration::from_secs(10);

/// Control port the server listens on and clients dial unless configured
/// otherwise.
pub const DEFAULT_CONTROL_PORT: u16 = 7835;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("config: {0}")]
    Config(String),
    #[error("authentication failed")]
    Auth,
    #[error("requested port is outside the server's port range")]
    NotAllowed,
    #[error("requested port is unavailable")]
    PortUnavailable,
    #[error("control connection lost")]
    Disconnected,
    #[error("timed out waiting for {0}")]
    TimedOut(&'static str),
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl From<RejectReason> for TunnelError {
    fn from(reason: RejectReason) -> Self {
        match reason {
            RejectReason::AuthFailed => TunnelError::Auth,
            RejectReason::PortUnavailable => TunnelError::PortUnavailable,
            RejectReason::NotAllowed => TunnelError::NotAllowed,
        }
    }
}

/// Externally visible lifecycle of one tunnel task, published through a
/// `watch` channel so callers poll state instead of sleeping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TunnelStatus {
    Starting,
    Ready { port: u16 },
    Reconnecting { attempt: u32 },
    Failed { reason: String },
    Stopped,
}

/// Resolves once `rx` observes `true` or its sender is gone.
pub(crate) async fn shutdown_requested(rx: &mut tokio::sync::watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

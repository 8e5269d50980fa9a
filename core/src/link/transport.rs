//! Transport seam — the consumed radio driver and the shared link types
//!
//! The physical transport (discovery, pairing, raw characteristic I/O) lives
//! behind the `TransportLink` trait. Everything above it only sees four
//! primitive operations plus a handful of explicit capability calls, and an
//! event stream for the things that arrive asynchronously (link up, auth
//! prompts, disconnects, notifications).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

/// Characteristic-like destinations on the link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// Peer-to-host data (read/notify)
    Inbound,
    /// Host-to-peer data (write)
    Outbound,
    /// Configuration/handshake endpoint
    Config,
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Inbound => write!(f, "inbound"),
            Target::Outbound => write!(f, "outbound"),
            Target::Config => write!(f, "config"),
        }
    }
}

/// The peer endpoint a link is established against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTarget {
    /// Transport-level address (opaque to this layer)
    pub address: String,
    /// Advertised device name, when known
    pub name: Option<String>,
}

impl LinkTarget {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: None,
        }
    }

    pub fn named(address: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            name: Some(name.into()),
        }
    }
}

/// Characteristic set discovered during service resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServiceMap {
    resolved: HashSet<Target>,
}

impl ServiceMap {
    pub fn new(targets: impl IntoIterator<Item = Target>) -> Self {
        Self {
            resolved: targets.into_iter().collect(),
        }
    }

    pub fn has(&self, target: Target) -> bool {
        self.resolved.contains(&target)
    }

    /// First missing target from `required`, if any.
    pub fn missing(&self, required: &[Target]) -> Option<Target> {
        required.iter().copied().find(|t| !self.has(*t))
    }
}

/// Disconnect reason categories mapped from the transport's raw codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Cached attribute table went stale; reconnect after invalidation
    StaleCache,
    /// Ordinary link loss (range, interference, peer reboot)
    LostConnection,
    /// Stack wedged in a way a plain reconnect cannot clear
    PersistentStackFault,
    /// Pairing/authorization declined by the user or peer
    AuthDeclined,
    /// Anything else, raw code preserved
    Other(i32),
}

impl DisconnectReason {
    /// Map a raw transport status code onto a named category.
    pub fn from_code(code: i32) -> Self {
        match code {
            // connection timeout / remote terminated / LMP timeout
            8 | 19 | 22 => DisconnectReason::LostConnection,
            // insufficient authentication / encryption
            5 | 15 => DisconnectReason::AuthDeclined,
            // the notorious unrecoverable stack error
            133 => DisconnectReason::PersistentStackFault,
            257 => DisconnectReason::StaleCache,
            other => DisconnectReason::Other(other),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::StaleCache => write!(f, "stale attribute cache"),
            DisconnectReason::LostConnection => write!(f, "connection lost"),
            DisconnectReason::PersistentStackFault => write!(f, "persistent stack fault"),
            DisconnectReason::AuthDeclined => write!(f, "authorization declined"),
            DisconnectReason::Other(code) => write!(f, "disconnect (code {})", code),
        }
    }
}

/// Asynchronous events surfaced by the transport driver.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    /// Low-level link is up; resolution/negotiation may begin
    LinkUp,
    /// Pairing/authorization prompt is pending out-of-band
    AuthRequired,
    /// Outcome of the pending authorization
    AuthResult { accepted: bool },
    /// Link dropped, with the mapped reason
    Disconnected { reason: DisconnectReason },
    /// Unsolicited inbound frame on a subscribed topic
    Notification { topic: String, data: Vec<u8> },
}

/// Authoritative high-level state of one link, broadcast to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected { endpoint: String },
    Failed { reason: String },
}

/// Fine-grained bring-up phase, observable alongside `ConnectionState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkPhase {
    Idle,
    Connecting,
    LinkEstablished,
    ParameterNegotiation,
    ServiceResolution,
    BacklogDrain,
    HandshakeInProgress,
    Ready,
    Disconnected,
    Failed,
}

/// Bring-up stage names used in `HandshakeFailed` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandshakeStage {
    Connect,
    Authorization,
    ParameterNegotiation,
    ServiceResolution,
    BacklogDrain,
    Handshake,
}

impl fmt::Display for HandshakeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeStage::Connect => write!(f, "connect"),
            HandshakeStage::Authorization => write!(f, "authorization"),
            HandshakeStage::ParameterNegotiation => write!(f, "parameter negotiation"),
            HandshakeStage::ServiceResolution => write!(f, "service resolution"),
            HandshakeStage::BacklogDrain => write!(f, "backlog drain"),
            HandshakeStage::Handshake => write!(f, "handshake"),
        }
    }
}

/// Errors produced by the link and messaging layers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("transport endpoint or characteristic unavailable")]
    TransportUnavailable,
    #[error("operation timed out")]
    OperationTimeout,
    #[error("operation failed (code {0})")]
    OperationFailed(i32),
    #[error("handshake failed during {0}")]
    HandshakeFailed(HandshakeStage),
    #[error("message delivery failed")]
    MessageDeliveryFailed,
    #[error("link reset")]
    LinkReset,
    #[error("queue closed")]
    QueueClosed,
    #[error("capability not supported: {0}")]
    Unsupported(&'static str),
}

/// The physical transport driver, as consumed by this subsystem.
///
/// One callback-per-operation semantics: each method completes exactly once.
/// `events()`-style delivery is a separate `mpsc` stream handed to
/// [`MeshLink::start`](crate::MeshLink::start) so scripted fakes stay easy
/// to build.
#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait TransportLink: Send + Sync {
    /// Initiate connection; link-up/auth arrive on the event stream.
    async fn connect(&self, target: &LinkTarget) -> Result<(), LinkError>;

    /// Tear the link down. Best effort; a Disconnected event may follow.
    async fn disconnect(&self) -> Result<(), LinkError>;

    /// Plain write to a characteristic.
    async fn perform_write(&self, dest: Target, data: &[u8]) -> Result<(), LinkError>;

    /// Read a buffered frame; an empty vec means nothing is pending.
    async fn perform_read(&self, dest: Target) -> Result<Vec<u8>, LinkError>;

    /// Enable or disable notifications on a characteristic.
    async fn set_notify(&self, dest: Target, enabled: bool) -> Result<(), LinkError>;

    /// Multi-step acknowledged write (begin, write, confirm, execute).
    async fn perform_reliable_write(&self, dest: Target, data: &[u8]) -> Result<(), LinkError>;

    /// Request a larger transfer unit; returns the granted value.
    async fn negotiate_mtu(&self, requested: u16) -> Result<u16, LinkError>;

    /// Discover the expected service/characteristic set.
    async fn resolve_services(&self) -> Result<ServiceMap, LinkError>;

    /// Explicitly drop any cached attribute table for this peer.
    /// Drivers without the capability return `Unsupported`.
    async fn invalidate_cache(&self) -> Result<(), LinkError>;

    /// Full adapter restart (disable/re-enable). Used when a reconnect
    /// alone is known not to clear the fault category.
    async fn restart_stack(&self) -> Result<(), LinkError>;
}

/// Event stream type handed to the subsystem at startup.
pub type LinkEventReceiver = mpsc::UnboundedReceiver<LinkEvent>;

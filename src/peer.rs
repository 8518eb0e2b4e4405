//! Peer identity and lifecycle events.
//!
//! The connection layer (transport, multiplexing, protocol negotiation) lives
//! outside this crate. What crosses the boundary is small: an opaque peer
//! identity, an ordered inbound byte stream per connected peer, and a stream
//! of lifecycle transitions the control plane reacts to.

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;

/// Opaque identity of a peer in the overlay.
///
/// The control plane never interprets the contents; it only compares, hashes,
/// and displays them. Transports typically put a base58 key fingerprint or a
/// hex-encoded public key here.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::fmt::Debug for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerId({})", self.0)
    }
}

/// Ordered inbound byte stream of one connected peer.
///
/// The control plane pulls length-delimited frames from it until it ends or
/// errors; either terminates that peer's pipeline.
pub type InboundStream = Box<dyn AsyncRead + Send + Unpin>;

/// Lifecycle transition reported by the peer registry.
///
/// The registry owns connections; the control plane consumes these events on
/// an mpsc channel and keeps its own per-peer state records, torn down
/// explicitly on [`PeerEvent::Closed`].
pub enum PeerEvent {
    /// A peer finished connecting and its inbound stream is ready.
    Connected { peer: PeerId, stream: InboundStream },
    /// The peer's outbound channel became writable.
    Writable { peer: PeerId },
    /// The peer disconnected.
    Closed { peer: PeerId },
}

impl std::fmt::Debug for PeerEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerEvent::Connected { peer, .. } => write!(f, "Connected({peer})"),
            PeerEvent::Writable { peer } => write!(f, "Writable({peer})"),
            PeerEvent::Closed { peer } => write!(f, "Closed({peer})"),
        }
    }
}

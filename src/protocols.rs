//! Trait seams between the control plane and its collaborators.
//!
//! The control plane depends on three externally-supplied capabilities:
//!
//! | Trait | Supplied by | Purpose |
//! |-------|-------------|---------|
//! | [`PeerRouter`] | peer registry | outbound sends and writability |
//! | [`PropagationStrategy`] | overlay strategy | topology reactions and fan-out |
//! | [`MessageValidator`] | application | accept/reject inbound messages |
//!
//! Traits are defined here separately from the orchestrator so concrete
//! strategies (flood, gossip-mesh) can depend only on the seams, not on the
//! actor internals.

use anyhow::Result;
use async_trait::async_trait;

use crate::messages::{Message, MessageId, default_message_id};
use crate::peer::PeerId;
use crate::pubsub::PubsubError;

/// Outbound side of the peer registry.
///
/// The registry owns connections and liveness; the control plane only asks
/// whether a peer can take a frame right now, hands frames over, and reports
/// streams it had to give up on.
#[async_trait]
pub trait PeerRouter: Send + Sync + 'static {
    /// Whether the peer's outbound channel can accept a frame right now.
    /// A false answer defers delivery until the registry reports a
    /// writable transition for that peer.
    fn is_writable(&self, peer: &PeerId) -> bool;

    /// Send an encoded RPC frame to a peer.
    async fn send(&self, peer: &PeerId, frame: Vec<u8>) -> Result<()>;

    /// Tear down the peer's connection after an unrecoverable inbound
    /// stream failure. The registry is expected to follow up with a
    /// [`PeerEvent::Closed`](crate::peer::PeerEvent::Closed).
    async fn disconnect(&self, peer: &PeerId);
}

/// Propagation policy plugged into the control plane.
///
/// The control plane handles the shared mechanics (subscription state,
/// dedup, validation, local dispatch); a strategy decides which peers
/// actually receive messages and how topic membership shapes the overlay.
///
/// `join`, `leave`, and `publish` have no useful default: a strategy that
/// leaves one out gets a [`PubsubError::Unimplemented`] at call time, which
/// is a caller programming error, never retried.
#[async_trait]
pub trait PropagationStrategy: Send + Sync + 'static {
    /// The local node started caring about `topics`.
    async fn join(&self, topics: &[String]) -> Result<()> {
        let _ = topics;
        Err(PubsubError::Unimplemented("join").into())
    }

    /// The local node stopped caring about `topics`.
    async fn leave(&self, topics: &[String]) -> Result<()> {
        let _ = topics;
        Err(PubsubError::Unimplemented("leave").into())
    }

    /// Distribute a batch of locally-published messages to the network.
    /// The batch preserves the publisher's input order.
    async fn publish(&self, messages: Vec<Message>) -> Result<()> {
        let _ = messages;
        Err(PubsubError::Unimplemented("publish").into())
    }

    /// Assemble the wire record for a local publish. Strategies that sign
    /// or otherwise decorate messages override this.
    fn build_message(
        &self,
        origin: PeerId,
        seqno: u64,
        data: Vec<u8>,
        topics: Vec<String>,
    ) -> Message {
        Message { origin, seqno, data, topics }
    }

    /// Deduplication identity of a message. Both the inbound pipeline and
    /// the publish path use this; defaults to `blake3(origin || seqno)`.
    fn message_id(&self, message: &Message) -> MessageId {
        default_message_id(&message.origin, message.seqno)
    }
}

/// Application-level acceptance check for inbound messages.
///
/// May suspend (e.g. await a remote check). Returning `Ok(false)` or any
/// error both mean the message is dropped locally; neither affects the
/// peer's connection.
#[async_trait]
pub trait MessageValidator: Send + Sync + 'static {
    async fn validate(&self, message: &Message) -> Result<bool>;
}

/// Validator that accepts everything.
pub struct AcceptAll;

#[async_trait]
impl MessageValidator for AcceptAll {
    async fn validate(&self, _message: &Message) -> Result<bool> {
        Ok(true)
    }
}

//! # Meshcast - Pub/Sub Control Plane for P2P Overlays
//!
//! Meshcast implements the control-plane mechanics every topic-based
//! publish/subscribe overlay needs, independent of how messages actually
//! propagate:
//!
//! - **Subscriptions**: the local node's topic interest and a table of which
//!   remote peers care about which topics
//! - **Deduplication**: a time-bounded cache of message identities for
//!   exactly-once local delivery in a best-effort overlay
//! - **Inbound pipeline**: per-peer frame decoding, subscription-state
//!   updates, dedup, pluggable validation, and local dispatch
//! - **Announcements**: subscribe/unsubscribe control frames pushed to
//!   peers, deferred until their connection is writable
//!
//! The propagation policy itself (flood-to-all, gossip-to-a-mesh, ...) is a
//! [`PropagationStrategy`] implementation supplied by the embedder; the
//! transport and peer registry are likewise abstract (an inbound byte stream
//! per peer plus a [`PeerRouter`] for outbound frames).
//!
//! ## Architecture
//!
//! The control plane uses the **Actor Pattern** for safe concurrent state:
//! the public [`Pubsub`] handle is cheap to clone and talks to a private
//! actor over async channels; the actor owns control-plane state and
//! processes commands sequentially. Each connected peer gets an independent
//! pipeline task, so one peer's slow validator or dead stream never stalls
//! another's.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `pubsub` | Control-plane orchestrator: lifecycle, subscribe/publish, announcements |
//! | `pipeline` | Per-peer inbound frame processing |
//! | `subscriptions` | Remote topic-interest table |
//! | `seen` | Time-bounded message-identity cache |
//! | `messages` | Wire records, bincode codec, framing |
//! | `protocols` | Trait seams: router, strategy, validator |
//! | `peer` | Peer identity and lifecycle events |

mod messages;
mod peer;
mod pipeline;
mod protocols;
mod pubsub;
mod seen;
mod subscriptions;

pub use messages::{
    MAX_FRAME_SIZE, Message, MessageId, RpcFrame, SubscriptionAction, decode_frame,
    default_message_id, encode_frame, read_frame, write_frame,
};
pub use peer::{InboundStream, PeerEvent, PeerId};
pub use protocols::{AcceptAll, MessageValidator, PeerRouter, PropagationStrategy};
pub use pubsub::{
    DEFAULT_MAX_MESSAGE_SIZE, MAX_SUBSCRIPTIONS, MAX_TOPIC_LENGTH, Pubsub, PubsubConfig,
    PubsubError, ReceivedMessage, is_valid_topic,
};
pub use seen::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL, SeenCache};
pub use subscriptions::{
    MAX_PEERS_PER_TOPIC, MAX_TRACKED_TOPICS, SubscriptionChange, SubscriptionTable,
};

//! Wire protocol records and framing.
//!
//! One RPC frame is the unit of the control protocol: a length-delimited blob
//! carrying zero or more subscription actions and zero or more messages,
//! serialized with bincode under a hard size limit.
//!
//! ## Framing
//!
//! Frames on the inbound byte stream are `u32` big-endian length followed by
//! the bincode body. [`read_frame`] enforces [`MAX_FRAME_SIZE`] before
//! allocating. Outbound frames are handed to the peer registry already
//! encoded; the transport applies its own framing on the way out, and
//! [`write_frame`] is the matching helper for transports (and tests) that
//! frame the same way.
//!
//! ## Message IDs
//!
//! Messages are identified by a 32-byte [`MessageId`] computed by default as
//! `blake3(origin || seqno)`. The identity function is overridable through
//! [`PropagationStrategy::message_id`](crate::protocols::PropagationStrategy::message_id).

use anyhow::Context;
use bincode::Options;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::peer::PeerId;

/// Maximum size of one encoded RPC frame (1 MiB).
/// SECURITY: Prevents memory exhaustion from hostile length prefixes.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Maximum buffer size for deserialization.
/// Set slightly larger than MAX_FRAME_SIZE to allow for encoding overhead.
const MAX_DESERIALIZE_SIZE: u64 = (MAX_FRAME_SIZE as u64) + 4096;

/// Deduplication identity of a message.
pub type MessageId = [u8; 32];

/// One subscribe/unsubscribe declaration inside an RPC frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriptionAction {
    pub topic: String,
    /// True to declare interest in the topic, false to withdraw it.
    pub subscribe: bool,
}

/// A published message as carried on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Identity of the node that authored the message.
    pub origin: PeerId,
    /// Sequence number minted by the origin; random per publish, so message
    /// identities do not collide across process restarts.
    pub seqno: u64,
    pub data: Vec<u8>,
    /// Topics the message is published to, in the order the publisher gave.
    pub topics: Vec<String>,
}

/// One decoded unit of the control protocol.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcFrame {
    pub subscriptions: Vec<SubscriptionAction>,
    pub messages: Vec<Message>,
}

impl RpcFrame {
    /// Frame announcing one subscribe/unsubscribe action per topic.
    pub fn announcing<I, T>(topics: I, subscribe: bool) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        Self {
            subscriptions: topics
                .into_iter()
                .map(|topic| SubscriptionAction { topic: topic.into(), subscribe })
                .collect(),
            messages: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.subscriptions.is_empty() && self.messages.is_empty()
    }
}

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_DESERIALIZE_SIZE)
        .with_fixint_encoding()
}

pub fn encode_frame(frame: &RpcFrame) -> Result<Vec<u8>, bincode::Error> {
    bincode::serialize(frame)
}

/// Decode with size bounds enforced. A well-formed empty frame decodes
/// successfully; anything unparseable is an error.
pub fn decode_frame(bytes: &[u8]) -> Result<RpcFrame, bincode::Error> {
    bincode_options().deserialize(bytes)
}

/// Pull the next length-delimited frame body off an inbound stream.
///
/// Returns `Ok(None)` when the stream ends cleanly at a frame boundary.
/// Oversized length prefixes, short reads, and transport errors all surface
/// as errors; the caller treats every error as a peer disconnect.
pub async fn read_frame<R>(stream: &mut R) -> anyhow::Result<Option<Vec<u8>>>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    match stream.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("failed to read frame length"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME_SIZE {
        anyhow::bail!("frame too large: {} bytes (max {})", len, MAX_FRAME_SIZE);
    }

    let mut body = vec![0u8; len];
    stream
        .read_exact(&mut body)
        .await
        .context("failed to read frame body")?;
    Ok(Some(body))
}

/// Write one length-delimited frame. Counterpart of [`read_frame`] for
/// transports that frame outbound bytes the same way.
pub async fn write_frame<W>(stream: &mut W, bytes: &[u8]) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let len = bytes.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(bytes).await?;
    Ok(())
}

/// Default message identity: `blake3(origin || seqno)`.
pub fn default_message_id(origin: &PeerId, seqno: u64) -> MessageId {
    let mut id_input = Vec::with_capacity(origin.as_str().len() + 8);
    id_input.extend_from_slice(origin.as_str().as_bytes());
    id_input.extend_from_slice(&seqno.to_le_bytes());
    *blake3::hash(&id_input).as_bytes()
}

//! Topic pub/sub control plane.
//!
//! This module is the orchestrator: it owns the lifecycle, the local
//! subscription set, per-peer state records, and the announcement protocol.
//! The concrete propagation policy (who actually receives published
//! messages) is injected as a [`PropagationStrategy`].
//!
//! ## Architecture
//!
//! The public [`Pubsub`] handle is cheap to clone and talks to a private
//! actor over a command channel; the actor owns all control-plane state and
//! processes commands sequentially. Each connected peer additionally gets an
//! independent pipeline task (see [`crate::pipeline`]) for its inbound
//! frames.
//!
//! ## Announcement delivery
//!
//! Control announcements (the full subscription set on connect, deltas on
//! local subscribe/unsubscribe) are sent immediately when the peer is
//! writable. Otherwise the encoded frame parks in that peer's pending queue
//! and is flushed on the registry's writable transition; a disconnect
//! discards the queue. Both announcement kinds go through the same queue.
//!
//! ## Lifecycle
//!
//! `stopped → start() → started → stop() → stopped`. Operations other than
//! `start`/`stop` require the started state and fail fast otherwise. `stop`
//! aborts peer pipelines, releases pending announcements, and clears the
//! local subscription set.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace, warn};

use crate::messages::{MessageId, RpcFrame, encode_frame};
use crate::peer::{PeerEvent, PeerId};
use crate::pipeline::PeerPipeline;
use crate::protocols::{MessageValidator, PeerRouter, PropagationStrategy};
use crate::seen::{DEFAULT_SEEN_CAPACITY, DEFAULT_SEEN_TTL, SeenCache};
use crate::subscriptions::{SubscriptionChange, SubscriptionTable};

// ============================================================================
// Limits
// ============================================================================

/// Maximum topic name length.
pub const MAX_TOPIC_LENGTH: usize = 256;

/// Maximum topics the local node can subscribe to at once.
pub const MAX_SUBSCRIPTIONS: usize = 100;

/// Maximum message payload size (64 KiB).
/// SECURITY: Prevents memory exhaustion from large messages.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Capacity of the delivery and subscription-change channels.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Maximum announcements parked for one unwritable peer.
/// SECURITY: Bounds memory held for peers that never become writable.
const MAX_PENDING_ANNOUNCEMENTS: usize = 64;

#[inline]
pub fn is_valid_topic(topic: &str) -> bool {
    !topic.is_empty()
        && topic.len() <= MAX_TOPIC_LENGTH
        && topic.chars().all(|c| c.is_ascii_graphic() || c == ' ')
}

// ============================================================================
// Configuration
// ============================================================================

/// Control-plane configuration.
#[derive(Clone, Debug)]
pub struct PubsubConfig {
    /// Whether locally-published messages are delivered to local
    /// subscribers of the targeted topics.
    pub emit_self: bool,
    /// Retention window of the seen-message cache.
    pub seen_ttl: std::time::Duration,
    /// Entry bound of the seen-message cache.
    pub seen_capacity: usize,
    /// Maximum message payload size accepted on either path.
    pub max_message_size: usize,
    /// Capacity of the delivery and subscription-change channels.
    pub channel_capacity: usize,
}

impl Default for PubsubConfig {
    fn default() -> Self {
        Self {
            emit_self: false,
            seen_ttl: DEFAULT_SEEN_TTL,
            seen_capacity: DEFAULT_SEEN_CAPACITY,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Caller-programming errors surfaced by control-plane operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PubsubError {
    /// Operation requires the control plane to be started.
    NotStarted,
    /// A propagation-strategy capability was left unimplemented.
    Unimplemented(&'static str),
    /// Topic name is empty or contains non-printable characters.
    InvalidTopic,
    /// Topic name exceeds the maximum length.
    TopicTooLong,
    /// Local subscription limit reached.
    SubscriptionLimit,
    /// Message payload exceeds the maximum size.
    MessageTooLarge,
}

impl std::fmt::Display for PubsubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PubsubError::NotStarted => write!(f, "pubsub is not started"),
            PubsubError::Unimplemented(op) => {
                write!(f, "propagation strategy does not implement {op}")
            }
            PubsubError::InvalidTopic => {
                write!(f, "topic name is invalid (empty or contains non-printable characters)")
            }
            PubsubError::TopicTooLong => {
                write!(f, "topic name exceeds maximum length of {MAX_TOPIC_LENGTH}")
            }
            PubsubError::SubscriptionLimit => {
                write!(f, "subscription limit reached (max {MAX_SUBSCRIPTIONS})")
            }
            PubsubError::MessageTooLarge => write!(f, "message size exceeds maximum allowed"),
        }
    }
}

impl std::error::Error for PubsubError {}

// ============================================================================
// Delivered messages
// ============================================================================

/// A validated message delivered to local subscribers of one topic.
///
/// A message targeting several locally-subscribed topics is delivered once
/// per topic.
#[derive(Clone, Debug)]
pub struct ReceivedMessage {
    pub topic: String,
    pub origin: PeerId,
    pub seqno: u64,
    pub data: Vec<u8>,
    pub msg_id: MessageId,
    pub received_at: Instant,
}

// ============================================================================
// Commands sent from Handle to Actor
// ============================================================================

enum Command {
    Start(oneshot::Sender<anyhow::Result<()>>),
    Stop(oneshot::Sender<anyhow::Result<()>>),
    Subscribe(Vec<String>, oneshot::Sender<anyhow::Result<()>>),
    Unsubscribe(Vec<String>, oneshot::Sender<anyhow::Result<()>>),
    Publish {
        topics: Vec<String>,
        payloads: Vec<Vec<u8>>,
        reply: oneshot::Sender<anyhow::Result<()>>,
    },
    Topics(oneshot::Sender<anyhow::Result<Vec<String>>>),
}

// ============================================================================
// Pubsub Handle (public API - cheap to clone)
// ============================================================================

#[derive(Clone)]
pub struct Pubsub {
    cmd_tx: mpsc::Sender<Command>,
}

impl Pubsub {
    /// Spawn the control-plane actor.
    ///
    /// The subscription table is injected so the concrete strategy can share
    /// it (its `interested_peers` view drives peer selection). Returns the
    /// handle plus the delivery and subscription-change receivers.
    pub fn spawn<R, S, V>(
        local: PeerId,
        router: Arc<R>,
        strategy: Arc<S>,
        validator: Arc<V>,
        table: Arc<SubscriptionTable>,
        config: PubsubConfig,
        peer_events: mpsc::Receiver<PeerEvent>,
    ) -> (
        Self,
        mpsc::Receiver<ReceivedMessage>,
        mpsc::Receiver<SubscriptionChange>,
    )
    where
        R: PeerRouter,
        S: PropagationStrategy,
        V: MessageValidator,
    {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.channel_capacity);
        let (delivery_tx, delivery_rx) = mpsc::channel(config.channel_capacity);
        let (change_tx, change_rx) = mpsc::channel(config.channel_capacity);
        let (closed_tx, closed_rx) = mpsc::channel(config.channel_capacity);

        let seen = Arc::new(SeenCache::new(config.seen_ttl, config.seen_capacity));
        let actor = PubsubActor {
            local,
            router,
            strategy,
            validator,
            config,
            started: Arc::new(AtomicBool::new(false)),
            local_topics: Arc::new(RwLock::new(HashSet::new())),
            table,
            seen,
            peers: HashMap::new(),
            deliveries: delivery_tx,
            changes: change_tx,
            closed_tx,
        };
        tokio::spawn(actor.run(cmd_rx, peer_events, closed_rx));

        (Self { cmd_tx }, delivery_rx, change_rx)
    }

    pub async fn start(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Start(tx))
            .await
            .map_err(|_| anyhow::anyhow!("pubsub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("pubsub actor closed"))?
    }

    pub async fn stop(&self) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Stop(tx))
            .await
            .map_err(|_| anyhow::anyhow!("pubsub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("pubsub actor closed"))?
    }

    /// Subscribe to topics not yet subscribed, announce the delta to every
    /// known peer, and hand the delta to the strategy's `join`.
    pub async fn subscribe<I, T>(&self, topics: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Subscribe(topics, tx))
            .await
            .map_err(|_| anyhow::anyhow!("pubsub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("pubsub actor closed"))?
    }

    /// Structural mirror of [`subscribe`](Self::subscribe), with `leave`.
    pub async fn unsubscribe<I, T>(&self, topics: I) -> anyhow::Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<String>,
    {
        let topics: Vec<String> = topics.into_iter().map(Into::into).collect();
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Unsubscribe(topics, tx))
            .await
            .map_err(|_| anyhow::anyhow!("pubsub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("pubsub actor closed"))?
    }

    /// Publish one payload to one topic.
    pub async fn publish(&self, topic: &str, data: Vec<u8>) -> anyhow::Result<()> {
        self.publish_batch(vec![topic.to_string()], vec![data]).await
    }

    /// Publish every payload to every topic. Each payload becomes its own
    /// message record; the batch handed to the strategy preserves input
    /// order.
    pub async fn publish_batch(
        &self,
        topics: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> anyhow::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Publish { topics, payloads, reply: tx })
            .await
            .map_err(|_| anyhow::anyhow!("pubsub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("pubsub actor closed"))?
    }

    /// The local subscription set. Order is not significant.
    pub async fn topics(&self) -> anyhow::Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.cmd_tx
            .send(Command::Topics(tx))
            .await
            .map_err(|_| anyhow::anyhow!("pubsub actor closed"))?;
        rx.await.map_err(|_| anyhow::anyhow!("pubsub actor closed"))?
    }
}

// ============================================================================
// Pubsub Actor (owns state)
// ============================================================================

/// Per-peer state record: the peer's pipeline task and announcements parked
/// until the peer becomes writable. Torn down explicitly on disconnect,
/// which is what cancels pending deliveries.
struct PeerState {
    pipeline: tokio::task::JoinHandle<()>,
    pending: VecDeque<Vec<u8>>,
}

struct PubsubActor<R, S, V> {
    local: PeerId,
    router: Arc<R>,
    strategy: Arc<S>,
    validator: Arc<V>,
    config: PubsubConfig,
    /// Shared with pipelines so stale validator results are discarded after
    /// a stop.
    started: Arc<AtomicBool>,
    /// Topics the local node wants to receive. Shared with pipelines, which
    /// use it as the dispatch filter.
    local_topics: Arc<RwLock<HashSet<String>>>,
    table: Arc<SubscriptionTable>,
    seen: Arc<SeenCache>,
    peers: HashMap<PeerId, PeerState>,
    deliveries: mpsc::Sender<ReceivedMessage>,
    changes: mpsc::Sender<SubscriptionChange>,
    closed_tx: mpsc::Sender<PeerId>,
}

impl<R, S, V> PubsubActor<R, S, V>
where
    R: PeerRouter,
    S: PropagationStrategy,
    V: MessageValidator,
{
    async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<Command>,
        mut peer_rx: mpsc::Receiver<PeerEvent>,
        mut closed_rx: mpsc::Receiver<PeerId>,
    ) {
        let mut peer_events_open = true;
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => {
                    match cmd {
                        Some(Command::Start(reply)) => {
                            let _ = reply.send(self.handle_start());
                        }
                        Some(Command::Stop(reply)) => {
                            let _ = reply.send(self.handle_stop());
                        }
                        Some(Command::Subscribe(topics, reply)) => {
                            let _ = reply.send(self.handle_subscribe(topics).await);
                        }
                        Some(Command::Unsubscribe(topics, reply)) => {
                            let _ = reply.send(self.handle_unsubscribe(topics).await);
                        }
                        Some(Command::Publish { topics, payloads, reply }) => {
                            let _ = reply.send(self.handle_publish(topics, payloads).await);
                        }
                        Some(Command::Topics(reply)) => {
                            let _ = reply.send(self.handle_topics());
                        }
                        None => {
                            debug!("pubsub handle dropped, actor quitting");
                            let _ = self.handle_stop();
                            break;
                        }
                    }
                }
                event = peer_rx.recv(), if peer_events_open => {
                    match event {
                        Some(event) => self.handle_peer_event(event).await,
                        None => {
                            debug!("peer event stream closed");
                            peer_events_open = false;
                        }
                    }
                }
                Some(peer) = closed_rx.recv() => {
                    self.remove_peer(&peer);
                }
            }
        }
    }

    fn started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    fn handle_start(&mut self) -> anyhow::Result<()> {
        if self.started() {
            return Ok(());
        }
        self.started.store(true, Ordering::SeqCst);
        debug!(local = %self.local, "pubsub started");
        Ok(())
    }

    /// Tear everything down: peer pipelines, pending announcements, the
    /// local subscription set, and remote subscription state.
    fn handle_stop(&mut self) -> anyhow::Result<()> {
        if !self.started() {
            return Ok(());
        }
        self.started.store(false, Ordering::SeqCst);

        for (peer, state) in self.peers.drain() {
            state.pipeline.abort();
            trace!(peer = %peer, pending = state.pending.len(), "dropped peer state on stop");
        }
        self.local_topics
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.table.clear();
        debug!(local = %self.local, "pubsub stopped");
        Ok(())
    }

    fn validate_topics(topics: &[String]) -> Result<(), PubsubError> {
        for topic in topics {
            if topic.len() > MAX_TOPIC_LENGTH {
                return Err(PubsubError::TopicTooLong);
            }
            if !is_valid_topic(topic) {
                return Err(PubsubError::InvalidTopic);
            }
        }
        Ok(())
    }

    async fn handle_subscribe(&mut self, topics: Vec<String>) -> anyhow::Result<()> {
        if !self.started() {
            return Err(PubsubError::NotStarted.into());
        }
        Self::validate_topics(&topics)?;

        let fresh: Vec<String> = {
            let subscribed = self
                .local_topics
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            let mut fresh = Vec::new();
            for topic in topics {
                if !subscribed.contains(&topic) && !fresh.contains(&topic) {
                    fresh.push(topic);
                }
            }
            fresh
        };
        if fresh.is_empty() {
            return Ok(());
        }

        {
            let mut subscribed = self
                .local_topics
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if subscribed.len() + fresh.len() > MAX_SUBSCRIPTIONS {
                return Err(PubsubError::SubscriptionLimit.into());
            }
            subscribed.extend(fresh.iter().cloned());
        }

        self.announce_to_all(RpcFrame::announcing(fresh.clone(), true))
            .await;
        self.strategy.join(&fresh).await?;

        debug!(topics = ?fresh, "subscribed to topics");
        Ok(())
    }

    async fn handle_unsubscribe(&mut self, topics: Vec<String>) -> anyhow::Result<()> {
        if !self.started() {
            return Err(PubsubError::NotStarted.into());
        }
        Self::validate_topics(&topics)?;

        let departing: Vec<String> = {
            let mut subscribed = self
                .local_topics
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            let mut departing = Vec::new();
            for topic in topics {
                if subscribed.remove(&topic) {
                    departing.push(topic);
                }
            }
            departing
        };
        if departing.is_empty() {
            return Ok(());
        }

        self.announce_to_all(RpcFrame::announcing(departing.clone(), false))
            .await;
        self.strategy.leave(&departing).await?;

        debug!(topics = ?departing, "unsubscribed from topics");
        Ok(())
    }

    async fn handle_publish(
        &mut self,
        topics: Vec<String>,
        payloads: Vec<Vec<u8>>,
    ) -> anyhow::Result<()> {
        if !self.started() {
            return Err(PubsubError::NotStarted.into());
        }
        Self::validate_topics(&topics)?;
        for data in &payloads {
            if data.len() > self.config.max_message_size {
                return Err(PubsubError::MessageTooLarge.into());
            }
        }

        let self_targets: Vec<String> = if self.config.emit_self {
            let subscribed = self
                .local_topics
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            topics
                .iter()
                .filter(|topic| subscribed.contains(*topic))
                .cloned()
                .collect()
        } else {
            Vec::new()
        };

        let mut batch = Vec::with_capacity(payloads.len());
        for data in payloads {
            let seqno: u64 = rand::random();
            let message =
                self.strategy
                    .build_message(self.local.clone(), seqno, data, topics.clone());
            let msg_id = self.strategy.message_id(&message);

            // Seed the seen cache so an echo of this exact message arriving
            // from the network is dropped as a duplicate.
            self.seen.insert_if_absent(msg_id);

            for topic in &self_targets {
                let received = ReceivedMessage {
                    topic: topic.clone(),
                    origin: message.origin.clone(),
                    seqno: message.seqno,
                    data: message.data.clone(),
                    msg_id,
                    received_at: Instant::now(),
                };
                if self.deliveries.send(received).await.is_err() {
                    warn!("message delivery channel closed");
                }
            }

            trace!(
                msg_id = %hex::encode(&msg_id[..8]),
                topics = message.topics.len(),
                "built message for publication"
            );
            batch.push(message);
        }

        self.strategy.publish(batch).await?;
        Ok(())
    }

    fn handle_topics(&self) -> anyhow::Result<Vec<String>> {
        if !self.started() {
            return Err(PubsubError::NotStarted.into());
        }
        Ok(self
            .local_topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect())
    }

    async fn handle_peer_event(&mut self, event: PeerEvent) {
        match event {
            PeerEvent::Connected { peer, stream } => {
                if !self.started() {
                    trace!(peer = %peer, "ignoring connection while stopped");
                    return;
                }
                // A reconnect replaces any stale pipeline for the peer.
                if let Some(old) = self.peers.remove(&peer) {
                    old.pipeline.abort();
                    debug!(peer = %peer, "replacing existing peer state on reconnect");
                }

                let pipeline = PeerPipeline {
                    peer: peer.clone(),
                    local: self.local.clone(),
                    emit_self: self.config.emit_self,
                    max_message_size: self.config.max_message_size,
                    started: self.started.clone(),
                    router: self.router.clone(),
                    strategy: self.strategy.clone(),
                    validator: self.validator.clone(),
                    seen: self.seen.clone(),
                    table: self.table.clone(),
                    local_topics: self.local_topics.clone(),
                    deliveries: self.deliveries.clone(),
                    changes: self.changes.clone(),
                    closed: self.closed_tx.clone(),
                };
                let handle = tokio::spawn(pipeline.run(stream));
                self.peers
                    .insert(peer.clone(), PeerState { pipeline: handle, pending: VecDeque::new() });
                debug!(peer = %peer, "peer connected, pipeline mounted");

                // Push the full current subscription set without waiting for
                // any RPC data from the peer.
                let current: Vec<String> = {
                    let subscribed = self
                        .local_topics
                        .read()
                        .unwrap_or_else(PoisonError::into_inner);
                    subscribed.iter().cloned().collect()
                };
                if !current.is_empty() {
                    let frame = RpcFrame::announcing(current, true);
                    self.deliver_or_queue(&peer, frame).await;
                }
            }
            PeerEvent::Writable { peer } => {
                self.flush_pending(&peer).await;
            }
            PeerEvent::Closed { peer } => {
                self.remove_peer(&peer);
            }
        }
    }

    /// Send the announcement to every known peer, deferring per peer until
    /// writable.
    async fn announce_to_all(&mut self, frame: RpcFrame) {
        if self.peers.is_empty() {
            return;
        }
        let peers: Vec<PeerId> = self.peers.keys().cloned().collect();
        for peer in peers {
            self.deliver_or_queue(&peer, frame.clone()).await;
        }
    }

    /// Deliver a control frame now if the peer is writable, otherwise park
    /// it in the peer's pending queue until the writable transition.
    async fn deliver_or_queue(&mut self, peer: &PeerId, frame: RpcFrame) {
        let bytes = match encode_frame(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(peer = %peer, error = %e, "failed to encode announcement");
                return;
            }
        };

        if self.router.is_writable(peer) {
            if let Err(e) = self.router.send(peer, bytes).await {
                warn!(peer = %peer, error = %e, "failed to send announcement");
            }
            return;
        }

        if let Some(state) = self.peers.get_mut(peer) {
            if state.pending.len() >= MAX_PENDING_ANNOUNCEMENTS {
                state.pending.pop_front();
                debug!(peer = %peer, "pending announcement queue full, dropping oldest");
            }
            state.pending.push_back(bytes);
            trace!(peer = %peer, queued = state.pending.len(), "peer not writable, announcement deferred");
        }
    }

    async fn flush_pending(&mut self, peer: &PeerId) {
        let Some(state) = self.peers.get_mut(peer) else {
            return;
        };
        if state.pending.is_empty() {
            return;
        }
        let pending: Vec<Vec<u8>> = state.pending.drain(..).collect();
        debug!(peer = %peer, count = pending.len(), "peer writable, flushing deferred announcements");
        for bytes in pending {
            if let Err(e) = self.router.send(peer, bytes).await {
                warn!(peer = %peer, error = %e, "failed to flush deferred announcement");
            }
        }
    }

    /// Tear down a peer's state record: abort its pipeline, discard pending
    /// announcements, and clear its subscription entries.
    fn remove_peer(&mut self, peer: &PeerId) {
        if let Some(state) = self.peers.remove(peer) {
            state.pipeline.abort();
            if !state.pending.is_empty() {
                trace!(peer = %peer, dropped = state.pending.len(), "cancelled pending announcements");
            }
        }
        let removed = self.table.remove_peer(peer);
        if !removed.is_empty() {
            debug!(peer = %peer, topics = removed.len(), "peer disconnected, cleared subscriptions");
        }
    }
}

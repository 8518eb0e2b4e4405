//! Per-peer inbound frame pipeline.
//!
//! One pipeline task runs per connected peer, owning that peer's inbound
//! byte stream. Frames are processed one at a time in arrival order, so a
//! peer's subscription state is always consistent with the most recent frame
//! it sent. Pipelines of different peers make progress independently; the
//! shared caches they touch are safe under that concurrency.
//!
//! Suspension points are the stream read and the validator call. A hung
//! validator therefore stalls only its own peer.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::messages::{self, Message, RpcFrame};
use crate::peer::{InboundStream, PeerId};
use crate::protocols::{MessageValidator, PeerRouter, PropagationStrategy};
use crate::pubsub::ReceivedMessage;
use crate::seen::SeenCache;
use crate::subscriptions::{SubscriptionChange, SubscriptionTable};

pub(crate) struct PeerPipeline<R, S, V> {
    pub peer: PeerId,
    pub local: PeerId,
    pub emit_self: bool,
    pub max_message_size: usize,
    pub started: Arc<AtomicBool>,
    pub router: Arc<R>,
    pub strategy: Arc<S>,
    pub validator: Arc<V>,
    pub seen: Arc<SeenCache>,
    pub table: Arc<SubscriptionTable>,
    pub local_topics: Arc<RwLock<HashSet<String>>>,
    pub deliveries: mpsc::Sender<ReceivedMessage>,
    pub changes: mpsc::Sender<SubscriptionChange>,
    /// Reports this pipeline's termination back to the actor.
    pub closed: mpsc::Sender<PeerId>,
}

impl<R, S, V> PeerPipeline<R, S, V>
where
    R: PeerRouter,
    S: PropagationStrategy,
    V: MessageValidator,
{
    /// Pull frames off the stream until it ends or errors. Every exit path
    /// is a peer disconnect: the registry is informed and the actor tears
    /// the peer's state down.
    pub(crate) async fn run(self, mut stream: InboundStream) {
        loop {
            let body = match messages::read_frame(&mut stream).await {
                Ok(Some(body)) => body,
                Ok(None) => {
                    debug!(peer = %self.peer, "inbound stream ended");
                    break;
                }
                Err(e) => {
                    debug!(peer = %self.peer, error = %e, "inbound stream failed");
                    break;
                }
            };

            let frame = match messages::decode_frame(&body) {
                Ok(frame) => frame,
                Err(e) => {
                    warn!(peer = %self.peer, error = %e, "undecodable frame, dropping peer");
                    break;
                }
            };

            self.process_frame(frame).await;
        }

        self.router.disconnect(&self.peer).await;
        let _ = self.closed.send(self.peer.clone()).await;
    }

    async fn process_frame(&self, frame: RpcFrame) {
        if !frame.subscriptions.is_empty() {
            for action in &frame.subscriptions {
                self.table.apply(&self.peer, &action.topic, action.subscribe);
            }
            let change = SubscriptionChange {
                peer: self.peer.clone(),
                topics: self.table.peer_topics(&self.peer),
                actions: frame.subscriptions,
            };
            trace!(
                peer = %change.peer,
                topics = change.topics.len(),
                actions = change.actions.len(),
                "peer subscription state updated"
            );
            if self.changes.send(change).await.is_err() {
                trace!("subscription change channel closed");
            }
        }

        for message in frame.messages {
            self.process_message(message).await;
        }
    }

    async fn process_message(&self, message: Message) {
        if message.data.len() > self.max_message_size {
            debug!(
                peer = %self.peer,
                size = message.data.len(),
                "dropping oversized message"
            );
            return;
        }

        let msg_id = self.strategy.message_id(&message);

        // Insert before validating: a slow or failing validation must never
        // let the same identity be reprocessed by another frame.
        if !self.seen.insert_if_absent(msg_id) {
            trace!(
                peer = %self.peer,
                msg_id = %hex::encode(&msg_id[..8]),
                "duplicate message, dropping"
            );
            return;
        }

        match self.validator.validate(&message).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    peer = %self.peer,
                    origin = %message.origin,
                    msg_id = %hex::encode(&msg_id[..8]),
                    "message rejected by validator"
                );
                return;
            }
            Err(e) => {
                debug!(
                    peer = %self.peer,
                    origin = %message.origin,
                    msg_id = %hex::encode(&msg_id[..8]),
                    error = %e,
                    "message validation errored"
                );
                return;
            }
        }

        // The validator may have suspended across a stop; stale results are
        // discarded.
        if !self.started.load(Ordering::SeqCst) {
            trace!(peer = %self.peer, "control plane stopped, discarding validated message");
            return;
        }

        if message.origin == self.local && !self.emit_self {
            trace!(msg_id = %hex::encode(&msg_id[..8]), "own message echoed back, dropping");
            return;
        }

        let targets: Vec<String> = {
            let subscribed = self
                .local_topics
                .read()
                .unwrap_or_else(PoisonError::into_inner);
            message
                .topics
                .iter()
                .filter(|topic| subscribed.contains(*topic))
                .cloned()
                .collect()
        };

        for topic in targets {
            let received = ReceivedMessage {
                topic,
                origin: message.origin.clone(),
                seqno: message.seqno,
                data: message.data.clone(),
                msg_id,
                received_at: Instant::now(),
            };
            if self.deliveries.send(received).await.is_err() {
                warn!("message delivery channel closed");
                return;
            }
        }
    }
}

//! Subscriber state and registry management.
//!
//! Uses lock-free DashMap so connections can come and go while a broadcast
//! is iterating a snapshot of the members.

use crate::error::{GatewayError, Result};
use crate::protocol::ServerMessage;
use axum::extract::ws::Message;
use dashmap::DashMap;
use metrics::gauge;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{
    self,
    error::{TryRecvError, TrySendError},
};
use tracing::{debug, info};
use uuid::Uuid;

/// Unique subscriber identifier.
pub type SubscriberId = Uuid;

/// Outcome of handing one change to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// Queued for the subscriber's socket.
    Sent,
    /// Already delivered, or the subscriber is no longer registered.
    Skipped,
    /// The subscriber cannot take the change and must be removed.
    Failed(DeliveryFailure),
}

/// Why a delivery failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// Outbound queue is full: the socket is not keeping up.
    Lagged,
    /// Outbound queue is closed: the socket writer is gone.
    Closed,
}

impl DeliveryFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryFailure::Lagged => "lagged",
            DeliveryFailure::Closed => "closed",
        }
    }
}

impl<T> From<TrySendError<T>> for DeliveryFailure {
    fn from(err: TrySendError<T>) -> Self {
        match err {
            TrySendError::Full(_) => DeliveryFailure::Lagged,
            TrySendError::Closed(_) => DeliveryFailure::Closed,
        }
    }
}

/// A queued frame and whether it counts against the live-lag limit.
struct Queued {
    frame: Message,
    live: bool,
}

/// Create a subscriber queue holding up to `capacity` frames, of which at
/// most `live_limit` may be live changes.
///
/// Sync notices and replayed changes use the remaining headroom, so a long
/// replay never counts against the live limit.
pub fn subscriber_queue(capacity: usize, live_limit: usize) -> (QueueSender, FrameReceiver) {
    let live_limit = live_limit.max(1);
    let (tx, rx) = mpsc::channel(capacity.max(live_limit));
    let live_queued = Arc::new(AtomicUsize::new(0));
    (
        QueueSender {
            tx,
            live_queued: live_queued.clone(),
            live_limit,
        },
        FrameReceiver { rx, live_queued },
    )
}

/// Sending half of a subscriber queue, owned by the registry.
pub struct QueueSender {
    tx: mpsc::Sender<Queued>,
    live_queued: Arc<AtomicUsize>,
    live_limit: usize,
}

impl QueueSender {
    fn send_live(&self, frame: Message) -> std::result::Result<(), DeliveryFailure> {
        if self.live_queued.fetch_add(1, Ordering::AcqRel) >= self.live_limit {
            self.live_queued.fetch_sub(1, Ordering::AcqRel);
            return Err(DeliveryFailure::Lagged);
        }
        self.tx.try_send(Queued { frame, live: true }).map_err(|e| {
            self.live_queued.fetch_sub(1, Ordering::AcqRel);
            DeliveryFailure::from(e)
        })
    }

    fn send_backlog(&self, frame: Message) -> std::result::Result<(), DeliveryFailure> {
        self.tx
            .try_send(Queued { frame, live: false })
            .map_err(DeliveryFailure::from)
    }

    /// Live changes queued and not yet taken by the writer.
    pub fn live_queued(&self) -> usize {
        self.live_queued.load(Ordering::Acquire)
    }
}

/// Receiving half of a subscriber queue, drained by the socket writer.
pub struct FrameReceiver {
    rx: mpsc::Receiver<Queued>,
    live_queued: Arc<AtomicUsize>,
}

impl FrameReceiver {
    /// Next frame, or `None` once the registry dropped the subscriber and
    /// everything queued has been taken.
    pub async fn recv(&mut self) -> Option<Message> {
        let queued = self.rx.recv().await?;
        Some(self.take(queued))
    }

    pub fn try_recv(&mut self) -> std::result::Result<Message, TryRecvError> {
        let queued = self.rx.try_recv()?;
        Ok(self.take(queued))
    }

    fn take(&self, queued: Queued) -> Message {
        if queued.live {
            self.live_queued.fetch_sub(1, Ordering::AcqRel);
        }
        queued.frame
    }
}

/// State for a single connected push channel.
pub struct Subscriber {
    /// Unique subscriber identifier.
    pub id: SubscriberId,
    /// Queue drained by the connection's socket writer.
    queue: QueueSender,
    /// Highest sequence handed to the queue. Only ever increases.
    last_delivered: AtomicU64,
    /// Cleared on unregister so in-flight broadcasts stop sending.
    active: AtomicBool,
}

impl Subscriber {
    fn new(queue: QueueSender, start_sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue,
            last_delivered: AtomicU64::new(start_sequence),
            active: AtomicBool::new(true),
        }
    }

    /// Highest sequence delivered to this subscriber.
    pub fn last_delivered(&self) -> u64 {
        self.last_delivered.load(Ordering::Acquire)
    }

    /// Whether the subscriber is still registered.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Live changes waiting in the subscriber's queue.
    pub fn live_queued(&self) -> usize {
        self.queue.live_queued()
    }

    /// Hand a live change frame to the subscriber without waiting.
    ///
    /// Sequences at or below `last_delivered` are skipped, so a change is
    /// never queued twice. Fails with `Lagged` once the live limit is queued.
    pub fn deliver(&self, sequence: u64, frame: &Message) -> Delivery {
        self.enqueue(sequence, frame, true)
    }

    /// Hand a replayed change frame to the subscriber. Replays use the
    /// queue's backlog headroom rather than the live limit.
    pub fn deliver_replayed(&self, sequence: u64, frame: &Message) -> Delivery {
        self.enqueue(sequence, frame, false)
    }

    fn enqueue(&self, sequence: u64, frame: &Message, live: bool) -> Delivery {
        if !self.is_active() || sequence <= self.last_delivered() {
            return Delivery::Skipped;
        }

        let sent = if live {
            self.queue.send_live(frame.clone())
        } else {
            self.queue.send_backlog(frame.clone())
        };
        match sent {
            Ok(()) => {
                self.last_delivered.fetch_max(sequence, Ordering::AcqRel);
                Delivery::Sent
            }
            Err(reason) => Delivery::Failed(reason),
        }
    }

    /// Send an unsequenced control message (sync, resync-required).
    pub fn notify(&self, msg: &ServerMessage) -> Result<()> {
        let frame = msg.to_frame()?;
        self.queue
            .send_backlog(frame)
            .map_err(|_| GatewayError::ChannelSend)
    }

    fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }
}

/// Lock-free registry of connected subscribers.
pub struct SubscriberRegistry {
    subscribers: DashMap<SubscriberId, Arc<Subscriber>>,
}

impl SubscriberRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            subscribers: DashMap::new(),
        }
    }

    /// Register a push channel whose subscriber has seen everything up to
    /// `start_sequence`.
    pub fn register(&self, queue: QueueSender, start_sequence: u64) -> Arc<Subscriber> {
        let subscriber = Arc::new(Subscriber::new(queue, start_sequence));
        self.subscribers.insert(subscriber.id, subscriber.clone());
        gauge!("gateway_active_subscribers").set(self.subscribers.len() as f64);
        info!("Subscriber {} registered at sequence {}", subscriber.id, start_sequence);
        subscriber
    }

    /// Remove a subscriber. Returns false if it was already gone.
    ///
    /// Dropping the registry's handle closes the subscriber's queue once any
    /// in-flight broadcast snapshot releases it.
    pub fn unregister(&self, id: &SubscriberId) -> bool {
        match self.subscribers.remove(id) {
            Some((_, subscriber)) => {
                subscriber.deactivate();
                gauge!("gateway_active_subscribers").set(self.subscribers.len() as f64);
                info!("Subscriber {} unregistered", id);
                true
            }
            None => {
                debug!("Subscriber {} already unregistered", id);
                false
            }
        }
    }

    /// Get a subscriber by ID.
    pub fn get(&self, id: &SubscriberId) -> Option<Arc<Subscriber>> {
        self.subscribers.get(id).map(|r| r.clone())
    }

    /// Copy out the current members.
    pub fn snapshot(&self) -> Vec<Arc<Subscriber>> {
        self.subscribers.iter().map(|r| r.value().clone()).collect()
    }

    /// Visit every live subscriber.
    ///
    /// Iterates a snapshot, so `f` may register or unregister freely.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Subscriber>),
    {
        for subscriber in self.snapshot() {
            if subscriber.is_active() {
                f(&subscriber);
            }
        }
    }

    /// Number of connected subscribers.
    pub fn len(&self) -> usize {
        self.subscribers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::decode_frame;

    fn change_frame(sequence: u64) -> Message {
        ServerMessage::Change {
            sequence,
            key: "k".into(),
            value: sequence.to_string(),
        }
        .to_frame()
        .unwrap()
    }

    #[test]
    fn test_register_and_unregister() {
        let registry = SubscriberRegistry::new();
        let (tx, _rx) = subscriber_queue(4, 4);
        let sub = registry.register(tx, 5);

        assert_eq!(registry.len(), 1);
        assert_eq!(sub.last_delivered(), 5);
        assert!(registry.get(&sub.id).is_some());

        assert!(registry.unregister(&sub.id));
        assert!(!registry.unregister(&sub.id));
        assert!(registry.is_empty());
        assert!(!sub.is_active());
    }

    #[test]
    fn test_deliver_is_monotonic() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = subscriber_queue(4, 4);
        let sub = registry.register(tx, 0);

        assert_eq!(sub.deliver(1, &change_frame(1)), Delivery::Sent);
        assert_eq!(sub.deliver(1, &change_frame(1)), Delivery::Skipped);
        assert_eq!(sub.deliver(2, &change_frame(2)), Delivery::Sent);
        assert_eq!(sub.last_delivered(), 2);

        assert!(matches!(decode_frame(rx.try_recv().unwrap()), ServerMessage::Change { sequence: 1, .. }));
        assert!(matches!(decode_frame(rx.try_recv().unwrap()), ServerMessage::Change { sequence: 2, .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_deliver_reports_full_and_closed_queues() {
        let registry = SubscriberRegistry::new();

        let (tx, _rx) = subscriber_queue(1, 1);
        let slow = registry.register(tx, 0);
        assert_eq!(slow.deliver(1, &change_frame(1)), Delivery::Sent);
        assert_eq!(
            slow.deliver(2, &change_frame(2)),
            Delivery::Failed(DeliveryFailure::Lagged)
        );
        assert_eq!(slow.last_delivered(), 1);

        let (tx, rx) = subscriber_queue(1, 1);
        let gone = registry.register(tx, 0);
        drop(rx);
        assert_eq!(
            gone.deliver(1, &change_frame(1)),
            Delivery::Failed(DeliveryFailure::Closed)
        );
    }

    #[test]
    fn test_live_limit_is_independent_of_queue_capacity() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = subscriber_queue(32, 2);
        let sub = registry.register(tx, 0);

        assert!(sub.notify(&ServerMessage::Sync { sequence: 0 }).is_ok());
        assert_eq!(sub.deliver(1, &change_frame(1)), Delivery::Sent);
        assert_eq!(sub.deliver(2, &change_frame(2)), Delivery::Sent);
        assert_eq!(sub.live_queued(), 2);
        assert_eq!(
            sub.deliver(3, &change_frame(3)),
            Delivery::Failed(DeliveryFailure::Lagged)
        );

        // Replayed changes do not count against the live limit.
        let (tx, _rx2) = subscriber_queue(32, 2);
        let resumed = registry.register(tx, 0);
        for seq in 1..=10 {
            assert_eq!(resumed.deliver_replayed(seq, &change_frame(seq)), Delivery::Sent);
        }
        assert_eq!(resumed.live_queued(), 0);
        assert_eq!(resumed.deliver(11, &change_frame(11)), Delivery::Sent);

        // Taking frames frees live slots.
        assert!(matches!(decode_frame(rx.try_recv().unwrap()), ServerMessage::Sync { .. }));
        assert!(matches!(decode_frame(rx.try_recv().unwrap()), ServerMessage::Change { sequence: 1, .. }));
        assert_eq!(sub.live_queued(), 1);
        assert_eq!(sub.deliver(3, &change_frame(3)), Delivery::Sent);
    }

    #[test]
    fn test_notify_reports_closed_queue() {
        let registry = SubscriberRegistry::new();
        let (tx, rx) = subscriber_queue(4, 4);
        let sub = registry.register(tx, 0);
        drop(rx);

        let err = sub.notify(&ServerMessage::Sync { sequence: 0 }).unwrap_err();
        assert!(matches!(err, GatewayError::ChannelSend));
    }

    #[test]
    fn test_unregistered_subscriber_gets_nothing() {
        let registry = SubscriberRegistry::new();
        let (tx, mut rx) = subscriber_queue(4, 4);
        let sub = registry.register(tx, 0);

        // Simulates a broadcast that snapshotted before the disconnect.
        let snapshot = registry.snapshot();
        registry.unregister(&sub.id);
        for s in &snapshot {
            assert_eq!(s.deliver(1, &change_frame(1)), Delivery::Skipped);
        }
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_for_each_tolerates_unregister_during_iteration() {
        let registry = SubscriberRegistry::new();
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let (tx, rx) = subscriber_queue(4, 4);
            registry.register(tx, 0);
            receivers.push(rx);
        }

        let mut visited = 0;
        registry.for_each(|sub| {
            visited += 1;
            registry.unregister(&sub.id);
        });

        assert_eq!(visited, 3);
        assert!(registry.is_empty());
    }
}

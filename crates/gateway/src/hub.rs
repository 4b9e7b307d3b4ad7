//! The mutation-ordering critical section.
//!
//! [`FanoutHub`] owns the [`Sequencer`] behind a single lock. Two paths take
//! it, and neither awaits while holding it:
//!
//! - `commit`: sequence an acknowledged write and enqueue it to every
//!   subscriber
//! - `connect`: snapshot the current sequence, register a subscriber and
//!   enqueue its replay
//!
//! Because both run under the same lock, a new subscriber either sees a
//! change in its replay or in live delivery, never both and never neither.

use crate::broadcaster::{Broadcaster, PublishReport};
use crate::protocol::{ResyncReason, ServerMessage};
use crate::registry::{subscriber_queue, FrameReceiver, SubscriberId, SubscriberRegistry};
use crate::sequencer::{ChangeEvent, Replay, Sequencer};
use parking_lot::Mutex;
use std::sync::Arc;
use store_client::Ack;
use tracing::{debug, info, warn};

/// Default number of live messages a subscriber may have queued.
pub const DEFAULT_SUBSCRIBER_BUFFER: usize = 256;

/// How a new connection was brought up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// No resume point requested; starts at the current sequence.
    Live,
    /// Missed changes were replayed from the backlog.
    Replayed(usize),
    /// The resume point could not be served; the client must re-fetch.
    ResyncRequired,
}

/// A registered push channel and the queue feeding its socket.
pub struct Connection {
    pub subscriber_id: SubscriberId,
    /// Sequence announced in the initial `sync` message.
    pub start_sequence: u64,
    pub outcome: ConnectOutcome,
    /// Frames to write to the socket, in order.
    pub frames: FrameReceiver,
}

/// Sequencer, registry and broadcaster tied together by the ordering lock.
pub struct FanoutHub {
    sequencer: Mutex<Sequencer>,
    broadcaster: Broadcaster,
    subscriber_buffer: usize,
}

impl FanoutHub {
    /// Create a hub retaining `backlog_capacity` events and allowing each
    /// subscriber `subscriber_buffer` queued live messages.
    pub fn new(backlog_capacity: usize, subscriber_buffer: usize) -> Self {
        Self {
            sequencer: Mutex::new(Sequencer::new(backlog_capacity)),
            broadcaster: Broadcaster::new(Arc::new(SubscriberRegistry::new())),
            subscriber_buffer: subscriber_buffer.max(1),
        }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        self.broadcaster.registry()
    }

    /// Last assigned sequence number.
    pub fn current_sequence(&self) -> u64 {
        self.sequencer.lock().current()
    }

    /// Sequence an acknowledged write and hand it to every subscriber.
    ///
    /// Must only be called after the store confirmed the write.
    pub fn commit(&self, ack: Ack) -> (ChangeEvent, PublishReport) {
        let mut sequencer = self.sequencer.lock();
        let event = sequencer.record(ack.key, ack.value);
        let report = self.broadcaster.publish(&event);
        drop(sequencer);

        debug!("Committed change {} for key '{}'", event.sequence, event.key);
        (event, report)
    }

    /// Register a new push channel.
    ///
    /// With `since = None` the subscriber starts caught up at the current
    /// sequence. With `since = Some(n)` every retained change after `n` is
    /// replayed first; if any of them has been evicted the subscriber is told
    /// to resync instead.
    pub fn connect(&self, since: Option<u64>) -> Connection {
        let sequencer = self.sequencer.lock();
        let current = sequencer.current();

        // Room for the sync message, a full replay and one resync notice on
        // top of the live buffer. Only live changes count toward the lag limit.
        let (queue, frames) = subscriber_queue(
            self.subscriber_buffer + sequencer.capacity() + 2,
            self.subscriber_buffer,
        );

        let (start_sequence, replay) = match since {
            None => (current, Replay::Events(Vec::new())),
            Some(after) => match sequencer.replay_after(after) {
                Replay::Events(events) => (after, Replay::Events(events)),
                Replay::Gap => (current, Replay::Gap),
            },
        };

        let subscriber = self.registry().register(queue, start_sequence);
        if let Err(e) = subscriber.notify(&ServerMessage::Sync {
            sequence: start_sequence,
        }) {
            warn!("Failed to queue sync for {}: {}", subscriber.id, e);
        }

        let outcome = match (since, replay) {
            (None, _) => ConnectOutcome::Live,
            (Some(_), Replay::Events(events)) => match self.broadcaster.replay(&subscriber, &events) {
                Ok(queued) => ConnectOutcome::Replayed(queued),
                Err(reason) => {
                    self.broadcaster.evict(&subscriber, reason);
                    ConnectOutcome::ResyncRequired
                }
            },
            (Some(after), Replay::Gap) => {
                warn!(
                    "Subscriber {} asked to resume after {} but backlog holds {:?}..={}",
                    subscriber.id,
                    after,
                    sequencer.oldest(),
                    current
                );
                if let Err(e) = subscriber.notify(&ServerMessage::ResyncRequired {
                    sequence: current,
                    reason: ResyncReason::BacklogGap,
                }) {
                    warn!("Failed to queue resync notice for {}: {}", subscriber.id, e);
                }
                ConnectOutcome::ResyncRequired
            }
        };
        drop(sequencer);

        info!(
            "Subscriber {} connected at sequence {} ({:?})",
            subscriber.id, start_sequence, outcome
        );

        Connection {
            subscriber_id: subscriber.id,
            start_sequence,
            outcome,
            frames,
        }
    }

    /// Remove a subscriber whose push channel closed.
    pub fn disconnect(&self, id: &SubscriberId) -> bool {
        self.registry().unregister(id)
    }
}

impl Default for FanoutHub {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_BACKLOG_CAPACITY, DEFAULT_SUBSCRIBER_BUFFER)
    }
}

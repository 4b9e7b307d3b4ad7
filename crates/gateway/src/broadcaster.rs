//! Change fan-out: sequenced events → every registered subscriber.
//!
//! Delivery is a non-blocking enqueue per subscriber, so one slow or dead
//! socket never holds up the others. Subscribers that cannot take a change
//! are removed on the spot.

use crate::protocol::ServerMessage;
use crate::registry::{Delivery, DeliveryFailure, Subscriber, SubscriberRegistry};
use crate::sequencer::ChangeEvent;
use metrics::counter;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-publish delivery counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub delivered: usize,
    pub skipped: usize,
    pub dropped: usize,
}

/// Delivers change events to the members of a [`SubscriberRegistry`].
pub struct Broadcaster {
    registry: Arc<SubscriberRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SubscriberRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SubscriberRegistry> {
        &self.registry
    }

    /// Deliver `event` to every subscriber that has not seen it.
    pub fn publish(&self, event: &ChangeEvent) -> PublishReport {
        // Pre-serialize once
        let frame = match ServerMessage::from(event).to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize change {}: {}", event.sequence, e);
                return PublishReport::default();
            }
        };

        let mut report = PublishReport::default();
        self.registry.for_each(|subscriber| match subscriber.deliver(event.sequence, &frame) {
            Delivery::Sent => report.delivered += 1,
            Delivery::Skipped => report.skipped += 1,
            Delivery::Failed(reason) => {
                report.dropped += 1;
                self.evict(subscriber, reason);
            }
        });

        counter!("gateway_changes_published_total").increment(1);
        debug!(
            "Published change {} ({}) to {} subscribers, {} skipped, {} dropped",
            event.sequence, event.key, report.delivered, report.skipped, report.dropped
        );
        report
    }

    /// Replay missed events to one subscriber, ascending.
    ///
    /// Returns how many were queued, or the failure that stopped the replay.
    pub fn replay(&self, subscriber: &Subscriber, events: &[ChangeEvent]) -> Result<usize, DeliveryFailure> {
        let mut queued = 0;
        for event in events {
            let frame = match ServerMessage::from(event).to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("Failed to serialize change {}: {}", event.sequence, e);
                    continue;
                }
            };
            match subscriber.deliver_replayed(event.sequence, &frame) {
                Delivery::Sent => queued += 1,
                Delivery::Skipped => {}
                Delivery::Failed(reason) => return Err(reason),
            }
        }

        counter!("gateway_replayed_changes_total").increment(queued as u64);
        debug!("Replayed {} changes to {}", queued, subscriber.id);
        Ok(queued)
    }

    /// Remove a subscriber that failed delivery.
    pub fn evict(&self, subscriber: &Subscriber, reason: DeliveryFailure) {
        warn!(
            "Dropping subscriber {} at sequence {}: {}",
            subscriber.id,
            subscriber.last_delivered(),
            reason.as_str()
        );
        counter!("gateway_subscriber_drops_total", "reason" => reason.as_str()).increment(1);
        self.registry.unregister(&subscriber.id);
    }
}

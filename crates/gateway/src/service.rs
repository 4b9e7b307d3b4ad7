//! Request/response façade over the store and the fan-out hub.
//!
//! A mutation moves `Received → Forwarding → Acked | Failed`. Only `Acked`
//! reaches the hub, and it does so before the caller gets its response, so a
//! client that sees its own success has already had the change queued for
//! every subscriber. Reads go straight to the store.

use crate::hub::FanoutHub;
use crate::sequencer::ChangeEvent;
use metrics::counter;
use std::sync::Arc;
use store_client::{Entry, Result, StoreClient};
use tracing::{debug, info, warn};

/// Lifecycle of one mutation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
    Received,
    Forwarding,
    Acked,
    Failed,
}

impl MutationPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            MutationPhase::Received => "received",
            MutationPhase::Forwarding => "forwarding",
            MutationPhase::Acked => "acked",
            MutationPhase::Failed => "failed",
        }
    }
}

/// Translates client requests into store calls and sequenced changes.
pub struct GatewayService {
    store: Arc<dyn StoreClient>,
    hub: Arc<FanoutHub>,
}

impl GatewayService {
    pub fn new(store: Arc<dyn StoreClient>, hub: Arc<FanoutHub>) -> Self {
        Self { store, hub }
    }

    pub fn hub(&self) -> &Arc<FanoutHub> {
        &self.hub
    }

    /// Write `value` under `key` and fan the change out.
    ///
    /// Store failures return before the sequencer is touched, so every
    /// sequence number stands for a write the store acknowledged.
    pub async fn set(&self, key: &str, value: &str) -> Result<ChangeEvent> {
        let mut phase = MutationPhase::Received;
        debug!("Mutation for '{}': {}", key, phase.as_str());

        phase = MutationPhase::Forwarding;
        debug!("Mutation for '{}': {}", key, phase.as_str());
        let result = self.store.write(key, value).await;

        match result {
            Ok(ack) => {
                phase = MutationPhase::Acked;
                let (event, report) = self.hub.commit(ack);
                counter!("gateway_mutations_total", "outcome" => phase.as_str()).increment(1);
                info!(
                    "Key '{}' set at sequence {} ({} subscribers notified)",
                    key, event.sequence, report.delivered
                );
                Ok(event)
            }
            Err(e) => {
                phase = MutationPhase::Failed;
                counter!("gateway_mutations_total", "outcome" => phase.as_str()).increment(1);
                warn!("Mutation for '{}' failed: {}", key, e);
                Err(e)
            }
        }
    }

    /// Read one key.
    pub async fn get(&self, key: &str) -> Result<String> {
        self.store.read(key).await
    }

    /// List every entry in the store.
    pub async fn list(&self) -> Result<Vec<Entry>> {
        self.store.list().await
    }
}

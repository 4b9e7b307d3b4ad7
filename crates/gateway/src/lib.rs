//! Key/value sync gateway.
//!
//! This service:
//! - Forwards reads and writes to an authoritative key/value store
//! - Stamps every acknowledged write with a gap-free sequence number
//! - Pushes each change to all connected WebSocket subscribers
//! - Replays missed changes to subscribers that reconnect with `?since=N`
//!
//! ## Architecture
//!
//! ```text
//! HTTP POST /entries/{key}
//!         ↓
//! GatewayService ──→ StoreClient (authoritative store)
//!         ↓ ack
//! FanoutHub (Sequencer + backlog, one lock)
//!         ↓
//! SubscriberRegistry (DashMap, bounded queue per subscriber)
//!         ↓
//! WebSocket clients
//! ```
//!
//! ## Backpressure
//!
//! - Each change is serialized once and cloned into every queue
//! - Queues are bounded; a subscriber that fills its queue is dropped and
//!   told to resync rather than slowing the publisher
//! - Socket writes are bounded by the delivery timeout

pub mod api;
pub mod broadcaster;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod sequencer;
pub mod service;
pub mod ws_server;

pub use api::{create_router, AppState};
pub use broadcaster::{Broadcaster, PublishReport};
pub use config::GatewayConfig;
pub use error::{GatewayError, Result};
pub use hub::{ConnectOutcome, Connection, FanoutHub};
pub use protocol::{ClientMessage, ResyncReason, ServerMessage};
pub use registry::{Subscriber, SubscriberId, SubscriberRegistry};
pub use sequencer::{ChangeEvent, ChangeKind, Sequencer};
pub use service::GatewayService;

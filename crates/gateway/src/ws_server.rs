//! WebSocket push channel handler using Axum.
//!
//! Each connection has two halves:
//! - a writer task draining the subscriber's queue into the socket, every
//!   write bounded by the delivery timeout
//! - the read loop, which answers client frames, sends heartbeats and
//!   unregisters the subscriber as soon as the socket closes

use crate::api::AppState;
use crate::error::Result;
use crate::hub::{Connection, FanoutHub};
use crate::protocol::{ClientMessage, ResyncReason, ServerMessage};
use crate::registry::FrameReceiver;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use metrics::counter;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Buffer for pings, pongs and error replies to one client.
const CONTROL_CHANNEL_SIZE: usize = 16;

/// Query parameters for `GET /ws`.
#[derive(Debug, Deserialize)]
pub struct ConnectParams {
    /// Last sequence the client saw; requests a replay of everything after it.
    pub since: Option<u64>,
}

/// WebSocket upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params.since))
}

/// Handle a WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<AppState>, since: Option<u64>) {
    let (ws_tx, mut ws_rx) = socket.split();
    let hub = state.service.hub().clone();

    let Connection {
        subscriber_id,
        start_sequence,
        outcome,
        frames,
    } = hub.connect(since);

    counter!("gateway_connections_total").increment(1);
    info!(
        "Client {} connected (since {:?}, starting at {}, {:?})",
        subscriber_id, since, start_sequence, outcome
    );

    let (control_tx, control_rx) = mpsc::channel::<Message>(CONTROL_CHANNEL_SIZE);
    let mut send_task = tokio::spawn(write_loop(
        ws_tx,
        frames,
        control_rx,
        hub.clone(),
        state.config.delivery_timeout,
    ));

    let mut heartbeat = interval(state.config.ping_interval);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_seen = Instant::now();

    loop {
        tokio::select! {
            biased;

            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(msg)) => {
                        last_seen = Instant::now();
                        if let Err(e) = handle_message(&control_tx, msg) {
                            warn!("Error handling message from {}: {:?}", subscriber_id, e);
                            let reply = ServerMessage::Error {
                                message: e.to_string(),
                                code: "PROCESSING_ERROR".to_string(),
                            };
                            if let Ok(frame) = reply.to_frame() {
                                let _ = control_tx.try_send(frame);
                            }
                        }
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {:?}", subscriber_id, e);
                        break;
                    }
                }
            }

            // Writer gave up: socket write failed, timed out, or we were dropped.
            _ = &mut send_task => {
                debug!("Writer for {} finished", subscriber_id);
                break;
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > state.config.idle_timeout {
                    warn!("Client {} heartbeat failed, disconnecting", subscriber_id);
                    break;
                }
                if let Err(TrySendError::Closed(_)) = control_tx.try_send(Message::Ping(Vec::new().into())) {
                    break;
                }
            }
        }
    }

    // Cleanup. The writer goes first so closing the queue is not mistaken
    // for a lag eviction.
    send_task.abort();
    hub.disconnect(&subscriber_id);

    counter!("gateway_disconnections_total").increment(1);
    info!("Client {} disconnected", subscriber_id);
}

/// Drain queued frames into the socket.
///
/// Control frames go first. When the subscriber queue closes while the
/// socket is still up, the registry dropped this subscriber for falling
/// behind, so it gets a final `resync-required` before the socket closes.
async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut frames: FrameReceiver,
    mut control_rx: mpsc::Receiver<Message>,
    hub: Arc<FanoutHub>,
    delivery_timeout: Duration,
) {
    loop {
        let frame = tokio::select! {
            biased;

            Some(frame) = control_rx.recv() => frame,

            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => {
                    let notice = ServerMessage::ResyncRequired {
                        sequence: hub.current_sequence(),
                        reason: ResyncReason::Lagged,
                    };
                    if let Ok(frame) = notice.to_frame() {
                        let _ = timeout(delivery_timeout, ws_tx.send(frame)).await;
                    }
                    break;
                }
            },
        };

        match timeout(delivery_timeout, ws_tx.send(frame)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                debug!("Socket write failed: {}", e);
                break;
            }
            Err(_) => {
                warn!("Socket write exceeded {:?}, dropping client", delivery_timeout);
                counter!("gateway_delivery_timeouts_total").increment(1);
                break;
            }
        }
    }

    let _ = timeout(delivery_timeout, ws_tx.close()).await;
}

/// Handle a single WebSocket message.
fn handle_message(control_tx: &mpsc::Sender<Message>, msg: Message) -> Result<()> {
    match msg {
        Message::Text(text) => {
            let client_msg: ClientMessage = serde_json::from_str(text.as_str())?;
            handle_client_message(control_tx, client_msg)
        }
        Message::Binary(data) => {
            let client_msg: ClientMessage = serde_json::from_slice(&data)?;
            handle_client_message(control_tx, client_msg)
        }
        // Protocol pings are answered by the WebSocket layer itself.
        Message::Ping(_) | Message::Pong(_) => Ok(()),
        // Will be handled by the connection loop
        Message::Close(_) => Ok(()),
    }
}

/// Handle a parsed client message.
fn handle_client_message(control_tx: &mpsc::Sender<Message>, msg: ClientMessage) -> Result<()> {
    match msg {
        ClientMessage::Ping => {
            control_tx.try_send(ServerMessage::Pong.to_frame()?)?;
            Ok(())
        }
    }
}

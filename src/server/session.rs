//! Per-connection reader/writer tasks: frames a WebSocket as JSON
//! envelopes, enforces size and liveness limits, and wires each inbound
//! frame into the Sync Coordinator.

use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;

use crate::hub::{SessionHandle, SEND_QUEUE_CAPACITY};
use crate::logging::{info, warn};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::server::coordinator::SyncCoordinator;

pub const MAX_FRAME_BYTES: usize = 50 * 1024 * 1024;
const PING_INTERVAL: Duration = Duration::from_secs(30);
const READ_DEADLINE: Duration = Duration::from_secs(60);
const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Drive one accepted WebSocket connection for `device_id` until it closes,
/// times out, or is displaced by a newer session for the same device.
pub async fn run(socket: WebSocket, device_id: String, coordinator: SyncCoordinator) {
	let (mut sink, mut stream) = socket.split();
	let (outbox_tx, mut outbox_rx) = mpsc::channel::<ServerMessage>(SEND_QUEUE_CAPACITY);
	let (close_tx, mut close_rx) = tokio::sync::oneshot::channel();

	let generation = coordinator.hub().next_generation();
	coordinator.hub().register(&device_id, SessionHandle::new(outbox_tx, close_tx, generation)).await;
	info!(device_id = %device_id, "session registered");

	let mut ping_interval = tokio::time::interval(PING_INTERVAL);
	ping_interval.tick().await; // first tick fires immediately; consume it

	loop {
		tokio::select! {
			biased;

			_ = &mut close_rx => {
				let _ = sink.send(Message::Close(Some(CloseFrame {
					code: 4000,
					reason: "displaced by a newer session".into(),
				}))).await;
				break;
			}

			frame = timeout(READ_DEADLINE, stream.next()) => {
				match frame {
					Err(_) => {
						warn!(device_id = %device_id, "read deadline exceeded, closing session");
						break;
					}
					Ok(None) => break,
					Ok(Some(Err(e))) => {
						warn!(device_id = %device_id, error = %e, "transport error, closing session");
						break;
					}
					Ok(Some(Ok(Message::Close(_)))) => break,
					Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {}
					Ok(Some(Ok(Message::Text(text)))) => {
						if text.len() > MAX_FRAME_BYTES {
							warn!(device_id = %device_id, "dropping oversized text frame");
							continue;
						}
						handle_inbound_text(&coordinator, &device_id, &text).await;
					}
					Ok(Some(Ok(Message::Binary(bytes)))) => {
						if bytes.len() > MAX_FRAME_BYTES {
							warn!(device_id = %device_id, "dropping oversized binary frame");
							continue;
						}
						match std::str::from_utf8(&bytes) {
							Ok(text) => handle_inbound_text(&coordinator, &device_id, text).await,
							Err(_) => warn!(device_id = %device_id, "dropping non-UTF-8 binary frame"),
						}
					}
				}
			}

			outbound = outbox_rx.recv() => {
				match outbound {
					Some(msg) => {
						if send_frame(&mut sink, &msg).await.is_err() {
							warn!(device_id = %device_id, "write deadline exceeded, closing session");
							break;
						}
					}
					None => break,
				}
			}

			_ = ping_interval.tick() => {
				if timeout(WRITE_DEADLINE, sink.send(Message::Ping(Vec::new().into()))).await.is_err() {
					warn!(device_id = %device_id, "ping write deadline exceeded, closing session");
					break;
				}
			}
		}
	}

	coordinator.hub().unregister(&device_id, generation).await;
	info!(device_id = %device_id, "session unregistered");
}

async fn handle_inbound_text(coordinator: &SyncCoordinator, device_id: &str, text: &str) {
	match serde_json::from_str::<ClientMessage>(text) {
		Ok(msg) => {
			if msg.device_id() != device_id {
				warn!(device_id = %device_id, claimed = %msg.device_id(), "dropping frame with mismatched device_id");
				return;
			}
			coordinator.dispatch(msg).await;
		}
		Err(e) => {
			warn!(device_id = %device_id, error = %e, "dropping unparseable frame");
		}
	}
}

async fn send_frame(sink: &mut (impl SinkExt<Message, Error = axum::Error> + Unpin), msg: &ServerMessage) -> Result<(), ()> {
	let text = match serde_json::to_string(msg) {
		Ok(text) => text,
		Err(_) => return Ok(()), // un-serializable outbound message is a bug, not a transport failure
	};
	match timeout(WRITE_DEADLINE, sink.send(Message::Text(text.into()))).await {
		Ok(Ok(())) => Ok(()),
		_ => Err(()),
	}
}

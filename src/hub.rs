//! Per-device session registry. Enforces at most one live session per
//! device and fans outbound messages out to sessions over bounded,
//! per-destination queues.

use std::collections::HashMap;

use tokio::sync::{mpsc, oneshot, RwLock};

use crate::error::HubError;
use crate::logging::warn;
use crate::protocol::ServerMessage;

pub const SEND_QUEUE_CAPACITY: usize = 256;

/// A session's outbound handle, as seen by the hub. The session task owns
/// the receiving end of `outbox` and the sending end of `close`.
pub struct SessionHandle {
	generation: u64,
	outbox: mpsc::Sender<ServerMessage>,
	close: Option<oneshot::Sender<()>>,
}

impl SessionHandle {
	pub fn new(outbox: mpsc::Sender<ServerMessage>, close: oneshot::Sender<()>, generation: u64) -> Self {
		SessionHandle { generation, outbox, close: Some(close) }
	}
}

pub struct ConnectionHub {
	sessions: RwLock<HashMap<String, SessionHandle>>,
	next_generation: std::sync::atomic::AtomicU64,
}

impl Default for ConnectionHub {
	fn default() -> Self {
		Self::new()
	}
}

impl ConnectionHub {
	pub fn new() -> Self {
		ConnectionHub { sessions: RwLock::new(HashMap::new()), next_generation: std::sync::atomic::AtomicU64::new(1) }
	}

	/// Allocate a generation id for a new session about to register. Doing
	/// this ahead of `register` lets the caller build its reader/writer
	/// tasks with the generation already known, for use in `unregister`.
	pub fn next_generation(&self) -> u64 {
		self.next_generation.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
	}

	/// Install a session for `device_id`, closing any existing session for
	/// the same device first. Guarantees at most one live session per
	/// device at any time.
	pub async fn register(&self, device_id: &str, handle: SessionHandle) {
		let mut sessions = self.sessions.write().await;
		if let Some(mut previous) = sessions.remove(device_id) {
			if let Some(close) = previous.close.take() {
				let _ = close.send(());
			}
		}
		sessions.insert(device_id.to_string(), handle);
	}

	/// Remove the session for `device_id`, but only if it is still the same
	/// one identified by `generation` — protects a freshly-registered
	/// session from being unregistered by the teardown of the one it just
	/// displaced.
	pub async fn unregister(&self, device_id: &str, generation: u64) {
		let mut sessions = self.sessions.write().await;
		if let Some(current) = sessions.get(device_id) {
			if current.generation == generation {
				sessions.remove(device_id);
			}
		}
	}

	/// Send to every connected device except `origin_device`. A full queue
	/// drops the message for that destination and is logged, not
	/// propagated as an error — the destination catches up on its next
	/// full sync.
	pub async fn broadcast(&self, origin_device: &str, msg: ServerMessage) {
		let sessions = self.sessions.read().await;
		for (device_id, handle) in sessions.iter() {
			if device_id == origin_device {
				continue;
			}
			if let Err(mpsc::error::TrySendError::Full(_)) = handle.outbox.try_send(msg.clone()) {
				warn!(device_id = %device_id, "hub send queue full, dropping broadcast message");
			}
		}
	}

	/// Send to exactly one device. Non-blocking; drops on a full queue.
	pub async fn send_to(&self, device_id: &str, msg: ServerMessage) -> Result<(), HubError> {
		let sessions = self.sessions.read().await;
		let handle = sessions
			.get(device_id)
			.ok_or_else(|| HubError::NoSuchDevice { device_id: device_id.to_string() })?;
		match handle.outbox.try_send(msg) {
			Ok(()) => Ok(()),
			Err(mpsc::error::TrySendError::Full(_)) => {
				Err(HubError::BackPressureDrop { device_id: device_id.to_string() })
			}
			Err(mpsc::error::TrySendError::Closed(_)) => {
				Err(HubError::NoSuchDevice { device_id: device_id.to_string() })
			}
		}
	}

	pub async fn connected_devices(&self) -> Vec<String> {
		let sessions = self.sessions.read().await;
		let mut devices: Vec<_> = sessions.keys().cloned().collect();
		devices.sort();
		devices
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn handle(hub: &ConnectionHub, capacity: usize) -> (SessionHandle, mpsc::Receiver<ServerMessage>, oneshot::Receiver<()>) {
		let (tx, rx) = mpsc::channel(capacity);
		let (close_tx, close_rx) = oneshot::channel();
		let generation = hub.next_generation();
		(SessionHandle::new(tx, close_tx, generation), rx, close_rx)
	}

	#[tokio::test]
	async fn register_then_connected_devices_lists_it() {
		let hub = ConnectionHub::new();
		let (h, _rx, _close_rx) = handle(&hub, SEND_QUEUE_CAPACITY);
		hub.register("d1", h).await;
		assert_eq!(hub.connected_devices().await, vec!["d1".to_string()]);
	}

	#[tokio::test]
	async fn registering_again_closes_the_previous_session() {
		let hub = ConnectionHub::new();
		let (h1, _rx1, close_rx1) = handle(&hub, SEND_QUEUE_CAPACITY);
		hub.register("d1", h1).await;
		let (h2, _rx2, _close_rx2) = handle(&hub, SEND_QUEUE_CAPACITY);
		hub.register("d1", h2).await;
		assert!(close_rx1.await.is_ok());
	}

	#[tokio::test]
	async fn unregister_with_stale_generation_is_noop() {
		let hub = ConnectionHub::new();
		let (h1, _rx1, _close_rx1) = handle(&hub, SEND_QUEUE_CAPACITY);
		let stale_generation = h1.generation;
		hub.register("d1", h1).await;

		// A second registration bumps the slot to a new generation.
		let (h2, _rx2, _close_rx2) = handle(&hub, SEND_QUEUE_CAPACITY);
		hub.register("d1", h2).await;

		hub.unregister("d1", stale_generation).await;
		assert_eq!(hub.connected_devices().await, vec!["d1".to_string()]);
	}

	#[tokio::test]
	async fn unregister_with_current_generation_removes_it() {
		let hub = ConnectionHub::new();
		let (h1, _rx1, _close_rx1) = handle(&hub, SEND_QUEUE_CAPACITY);
		let generation = h1.generation;
		hub.register("d1", h1).await;
		hub.unregister("d1", generation).await;
		assert!(hub.connected_devices().await.is_empty());
	}

	#[tokio::test]
	async fn broadcast_skips_origin_device() {
		let hub = ConnectionHub::new();
		let (h1, mut rx1, _c1) = handle(&hub, SEND_QUEUE_CAPACITY);
		let (h2, mut rx2, _c2) = handle(&hub, SEND_QUEUE_CAPACITY);
		hub.register("origin", h1).await;
		hub.register("other", h2).await;

		hub.broadcast("origin", ServerMessage::Pong { origin_device: "origin".into() }).await;

		assert!(rx1.try_recv().is_err());
		assert!(rx2.try_recv().is_ok());
	}

	#[tokio::test]
	async fn send_to_unknown_device_errors() {
		let hub = ConnectionHub::new();
		let err = hub.send_to("ghost", ServerMessage::Pong { origin_device: "server".into() }).await;
		assert!(matches!(err, Err(HubError::NoSuchDevice { .. })));
	}

	#[tokio::test]
	async fn send_to_full_queue_drops_with_back_pressure_error() {
		let hub = ConnectionHub::new();
		let (h, _rx, _close_rx) = handle(&hub, 1);
		hub.register("d1", h).await;
		hub.send_to("d1", ServerMessage::Pong { origin_device: "server".into() }).await.unwrap();
		let err = hub.send_to("d1", ServerMessage::Pong { origin_device: "server".into() }).await;
		assert!(matches!(err, Err(HubError::BackPressureDrop { .. })));
	}
}

//! Inbound message dispatch: conflict resolution, tombstone bookkeeping,
//! and fan-out through the connection hub.

use std::sync::Arc;

use tokio::sync::RwLock;

use crate::auth::AuthGate;
use crate::config::ConflictResolution;
use crate::hub::ConnectionHub;
use crate::logging::{info, warn};
use crate::protocol::{
	ClientMessage, ConflictPayload, FileChangePayload, FileDeletePayload, FileMovePayload, FileRecord,
	FullSyncPayload, ServerMessage,
};
use crate::store::ContentStore;
use crate::tombstone::TombstoneRegistry;
use crate::vector_clock::VectorClock;

/// The server's own slot in the global vector clock.
pub const SERVER_CLOCK_SLOT: &str = "server";

#[derive(Clone)]
pub struct SyncCoordinator {
	inner: Arc<Inner>,
}

struct Inner {
	store: ContentStore,
	tombstones: TombstoneRegistry,
	hub: ConnectionHub,
	auth: AuthGate,
	clock: RwLock<VectorClock>,
	conflict_resolution: ConflictResolution,
	empty_write_guard: bool,
}

impl SyncCoordinator {
	pub fn new(
		store: ContentStore,
		tombstones: TombstoneRegistry,
		hub: ConnectionHub,
		auth: AuthGate,
		conflict_resolution: ConflictResolution,
		empty_write_guard: bool,
	) -> Self {
		SyncCoordinator {
			inner: Arc::new(Inner {
				store,
				tombstones,
				hub,
				auth,
				clock: RwLock::new(VectorClock::new()),
				conflict_resolution,
				empty_write_guard,
			}),
		}
	}

	pub fn store(&self) -> &ContentStore {
		&self.inner.store
	}

	pub fn hub(&self) -> &ConnectionHub {
		&self.inner.hub
	}

	pub fn auth(&self) -> &AuthGate {
		&self.inner.auth
	}

	pub fn tombstones(&self) -> &TombstoneRegistry {
		&self.inner.tombstones
	}

	pub async fn clock_snapshot(&self) -> VectorClock {
		self.inner.clock.read().await.clone()
	}

	async fn accept_mutation(&self, incoming: &VectorClock) -> VectorClock {
		let mut clock = self.inner.clock.write().await;
		clock.merge(incoming);
		clock.bump(SERVER_CLOCK_SLOT);
		clock.clone()
	}

	/// Handle one decoded client frame. Any reply required by the protocol
	/// (targeted or broadcast) is sent directly through the hub; this
	/// function returns nothing because every outcome is either a hub send
	/// or a no-op.
	pub async fn dispatch(&self, msg: ClientMessage) {
		match msg {
			ClientMessage::FileChange { device_id, vector_clock, payload, .. } => {
				self.handle_file_change(&device_id, vector_clock, payload).await;
			}
			ClientMessage::FileDelete { device_id, vector_clock, payload, .. } => {
				self.handle_file_delete(&device_id, vector_clock, payload).await;
			}
			ClientMessage::FileMove { device_id, vector_clock, payload, .. } => {
				self.handle_file_move(&device_id, vector_clock, payload).await;
			}
			ClientMessage::RequestFullSync { device_id, .. } => {
				self.handle_request_full_sync(&device_id).await;
			}
			ClientMessage::RequestFile { device_id, payload, .. } => {
				self.handle_request_file(&device_id, payload.path).await;
			}
			ClientMessage::Ping { device_id, .. } => {
				let _ = self.inner.hub.send_to(&device_id, ServerMessage::Pong { origin_device: ServerMessage::SERVER_ORIGIN.to_string() }).await;
			}
		}
	}

	async fn handle_file_change(&self, device_id: &str, vector_clock: VectorClock, payload: FileChangePayload) {
		let bytes = match crate::protocol::decode_content(&payload.content_b64) {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(device_id, path = %payload.path, error = %e, "dropping file_change with unreadable content");
				return;
			}
		};

		if let Some(tombstone) = self.inner.tombstones.get(&payload.path).await {
			if tombstone.vector_clock.dominates(&vector_clock) {
				let _ = self
					.inner
					.hub
					.send_to(
						device_id,
						ServerMessage::FileDeleted {
							origin_device: ServerMessage::SERVER_ORIGIN.to_string(),
							payload: FileDeletePayload { path: payload.path.clone() },
						},
					)
					.await;
				return;
			}
		}

		let current_hash = self.inner.store.hash_of(&payload.path).await;
		let has_current = !current_hash.is_empty();

		if has_current {
			if let (true, Some(previous_hash)) = (has_current, payload.previous_hash.as_deref()) {
				if previous_hash != current_hash {
					self.resolve_conflict(device_id, vector_clock, payload).await;
					return;
				}
			}

			if self.inner.empty_write_guard && bytes.is_empty() {
				self.echo_current(device_id, &payload.path).await;
				return;
			}
		}

		self.commit_file_change(device_id, vector_clock, payload, bytes).await;
	}

	async fn resolve_conflict(&self, device_id: &str, vector_clock: VectorClock, payload: FileChangePayload) {
		let current = match self.server_file_record(&payload.path).await {
			Some(record) => record,
			None => return,
		};

		match self.inner.conflict_resolution {
			ConflictResolution::LastWriteWins => {
				if payload.mtime_ms > current.mtime_ms {
					let bytes = crate::protocol::decode_content(&payload.content_b64).unwrap_or_default();
					self.commit_file_change(device_id, vector_clock, payload, bytes).await;
				} else {
					self.echo_current(device_id, &payload.path).await;
				}
			}
			ConflictResolution::Manual => {
				let _ = self
					.inner
					.hub
					.send_to(
						device_id,
						ServerMessage::Conflict {
							origin_device: ServerMessage::SERVER_ORIGIN.to_string(),
							payload: ConflictPayload {
								path: payload.path.clone(),
								server_version: current,
								client_version: payload,
								resolution: "manual".to_string(),
							},
						},
					)
					.await;
			}
		}
	}

	async fn commit_file_change(
		&self,
		device_id: &str,
		vector_clock: VectorClock,
		payload: FileChangePayload,
		bytes: Vec<u8>,
	) {
		if let Err(e) = self.inner.store.write(&payload.path, &bytes, payload.mtime_ms).await {
			warn!(device_id, path = %payload.path, error = %e, "failed to persist file_change");
			return;
		}
		let _ = self.inner.tombstones.remove(&payload.path).await;
		self.accept_mutation(&vector_clock).await;

		self.inner
			.hub
			.broadcast(
				device_id,
				ServerMessage::FileChanged { origin_device: device_id.to_string(), payload },
			)
			.await;
	}

	async fn echo_current(&self, device_id: &str, path: &str) {
		let bytes = match self.inner.store.read(path).await {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(device_id, path, error = %e, "could not read current bytes to echo back");
				return;
			}
		};
		let info = match self.inner.store.info(path).await {
			Ok(info) => info,
			Err(_) => return,
		};
		let _ = self
			.inner
			.hub
			.send_to(
				device_id,
				ServerMessage::FileChanged {
					origin_device: ServerMessage::SERVER_ORIGIN.to_string(),
					payload: FileChangePayload {
						path: path.to_string(),
						content_b64: crate::protocol::encode_content(&bytes),
						mtime_ms: info.mtime_ms,
						hash: info.hash.clone(),
						previous_hash: None,
					},
				},
			)
			.await;
	}

	async fn server_file_record(&self, path: &str) -> Option<FileRecord> {
		let info = self.inner.store.info(path).await.ok()?;
		Some(FileRecord { path: path.to_string(), hash: info.hash.clone(), size: info.size, mtime_ms: info.mtime_ms })
	}

	async fn handle_file_delete(&self, device_id: &str, vector_clock: VectorClock, payload: FileDeletePayload) {
		if let Err(e) = self.inner.store.delete(&payload.path).await {
			warn!(device_id, path = %payload.path, error = %e, "failed to delete file");
			return;
		}
		let server_clock = self.accept_mutation(&vector_clock).await;
		if let Err(e) = self.inner.tombstones.create(&payload.path, device_id, server_clock).await {
			warn!(device_id, path = %payload.path, error = %e, "failed to persist tombstone");
		}

		self.inner
			.hub
			.broadcast(device_id, ServerMessage::FileDeleted { origin_device: device_id.to_string(), payload })
			.await;
	}

	async fn handle_file_move(&self, device_id: &str, vector_clock: VectorClock, payload: FileMovePayload) {
		let bytes = match crate::protocol::decode_content(&payload.content_b64) {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(device_id, error = %e, "dropping file_move with unreadable content");
				return;
			}
		};
		if let Err(e) = self.inner.store.delete(&payload.old_path).await {
			warn!(device_id, path = %payload.old_path, error = %e, "failed to delete old path during move");
		}
		if let Err(e) = self.inner.store.write(&payload.new_path, &bytes, payload.mtime_ms).await {
			warn!(device_id, path = %payload.new_path, error = %e, "failed to write new path during move");
			return;
		}
		let _ = self.inner.tombstones.remove(&payload.new_path).await;
		self.accept_mutation(&vector_clock).await;

		self.inner
			.hub
			.broadcast(device_id, ServerMessage::FileMoved { origin_device: device_id.to_string(), payload })
			.await;
	}

	async fn handle_request_full_sync(&self, device_id: &str) {
		let files = match self.inner.store.list().await {
			Ok(files) => files,
			Err(e) => {
				warn!(device_id, error = %e, "failed to assemble file listing for full sync");
				return;
			}
		};
		let tombstones = self.inner.tombstones.list().await;
		let vector_clock = self.clock_snapshot().await;

		let _ = self
			.inner
			.hub
			.send_to(
				device_id,
				ServerMessage::FullSync {
					origin_device: ServerMessage::SERVER_ORIGIN.to_string(),
					payload: FullSyncPayload { files, tombstones, vector_clock },
				},
			)
			.await;
	}

	async fn handle_request_file(&self, device_id: &str, path: String) {
		let bytes = match self.inner.store.read(&path).await {
			Ok(bytes) => bytes,
			Err(e) => {
				info!(device_id, path = %path, error = %e, "requested file not found");
				return;
			}
		};
		let info = match self.inner.store.info(&path).await {
			Ok(info) => info,
			Err(_) => return,
		};

		let _ = self
			.inner
			.hub
			.send_to(
				device_id,
				ServerMessage::FileChanged {
					origin_device: ServerMessage::SERVER_ORIGIN.to_string(),
					payload: FileChangePayload {
						path,
						content_b64: crate::protocol::encode_content(&bytes),
						mtime_ms: info.mtime_ms,
						hash: info.hash.clone(),
						previous_hash: None,
					},
				},
			)
			.await;
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn coordinator(root: &std::path::Path, resolution: ConflictResolution) -> SyncCoordinator {
		SyncCoordinator::new(
			ContentStore::new(root.join("data"), 50 * 1024 * 1024),
			TombstoneRegistry::new(root.join("tombstones.log"), crate::tombstone::DEFAULT_TTL_SECS),
			ConnectionHub::new(),
			AuthGate::new("master"),
			resolution,
			true,
		)
	}

	fn clock(device: &str, n: u64) -> VectorClock {
		let mut c = VectorClock::new();
		for _ in 0..n {
			c.bump(device);
		}
		c
	}

	async fn register(coordinator: &SyncCoordinator, device_id: &str) -> tokio::sync::mpsc::Receiver<ServerMessage> {
		let (tx, rx) = tokio::sync::mpsc::channel(crate::hub::SEND_QUEUE_CAPACITY);
		let (close_tx, _close_rx) = tokio::sync::oneshot::channel();
		let generation = coordinator.hub().next_generation();
		coordinator
			.hub()
			.register(device_id, crate::hub::SessionHandle::new(tx, close_tx, generation))
			.await;
		rx
	}

	fn change_msg(device: &str, path: &str, content: &[u8], mtime_ms: u64, previous_hash: Option<&str>) -> ClientMessage {
		ClientMessage::FileChange {
			device_id: device.to_string(),
			timestamp_ms: mtime_ms,
			vector_clock: clock(device, 1),
			payload: FileChangePayload {
				path: path.to_string(),
				content_b64: crate::protocol::encode_content(content),
				mtime_ms,
				hash: "irrelevant".to_string(),
				previous_hash: previous_hash.map(|h| h.to_string()),
			},
		}
	}

	#[tokio::test]
	async fn file_change_writes_and_broadcasts_to_others() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let mut rx_a = register(&coordinator, "a").await;
		let mut rx_b = register(&coordinator, "b").await;

		coordinator.dispatch(change_msg("a", "note.md", b"hello", 1000, None)).await;

		assert!(rx_a.try_recv().is_err());
		let msg = rx_b.try_recv().unwrap();
		assert!(matches!(msg, ServerMessage::FileChanged { .. }));
		assert_eq!(coordinator.store().read("note.md").await.unwrap(), b"hello");
	}

	#[tokio::test]
	async fn stale_previous_hash_triggers_last_write_wins_conflict() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let _rx_a = register(&coordinator, "a").await;
		let mut rx_b = register(&coordinator, "b").await;

		coordinator.dispatch(change_msg("a", "note.md", b"first", 1000, None)).await;
		rx_b.try_recv().unwrap();

		// b edits based on a stale hash, but with a newer mtime: b should win.
		coordinator.dispatch(change_msg("b", "note.md", b"second", 2000, Some("deadbeef"))).await;
		assert_eq!(coordinator.store().read("note.md").await.unwrap(), b"second");
	}

	#[tokio::test]
	async fn stale_previous_hash_with_older_mtime_loses_and_echoes() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let mut rx_a = register(&coordinator, "a").await;

		coordinator.dispatch(change_msg("a", "note.md", b"first", 2000, None)).await;
		rx_a.try_recv().unwrap();

		coordinator.dispatch(change_msg("a", "note.md", b"second", 1000, Some("deadbeef"))).await;
		let echoed = rx_a.try_recv().unwrap();
		match echoed {
			ServerMessage::FileChanged { payload, .. } => {
				assert_eq!(crate::protocol::decode_content(&payload.content_b64).unwrap(), b"first");
			}
			_ => panic!("expected echoed file_changed"),
		}
		assert_eq!(coordinator.store().read("note.md").await.unwrap(), b"first");
	}

	#[tokio::test]
	async fn manual_conflict_resolution_sends_conflict_frame_without_mutating() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::Manual);
		let mut rx_a = register(&coordinator, "a").await;

		coordinator.dispatch(change_msg("a", "note.md", b"first", 1000, None)).await;
		rx_a.try_recv().unwrap();

		coordinator.dispatch(change_msg("a", "note.md", b"second", 2000, Some("deadbeef"))).await;
		let msg = rx_a.try_recv().unwrap();
		assert!(matches!(msg, ServerMessage::Conflict { .. }));
		assert_eq!(coordinator.store().read("note.md").await.unwrap(), b"first");
	}

	#[tokio::test]
	async fn empty_write_guard_rejects_blank_overwrite_of_nonempty_file() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let mut rx_a = register(&coordinator, "a").await;

		coordinator.dispatch(change_msg("a", "note.md", b"first", 1000, None)).await;
		rx_a.try_recv().unwrap();

		coordinator.dispatch(change_msg("a", "note.md", b"", 2000, None)).await;
		let echoed = rx_a.try_recv().unwrap();
		assert!(matches!(echoed, ServerMessage::FileChanged { .. }));
		assert_eq!(coordinator.store().read("note.md").await.unwrap(), b"first");
	}

	#[tokio::test]
	async fn file_delete_creates_tombstone_and_broadcasts() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let _rx_a = register(&coordinator, "a").await;
		let mut rx_b = register(&coordinator, "b").await;

		coordinator.dispatch(change_msg("a", "note.md", b"hello", 1000, None)).await;
		rx_b.try_recv().unwrap();

		coordinator
			.dispatch(ClientMessage::FileDelete {
				device_id: "a".to_string(),
				timestamp_ms: 1100,
				vector_clock: clock("a", 2),
				payload: FileDeletePayload { path: "note.md".to_string() },
			})
			.await;

		assert!(matches!(rx_b.try_recv().unwrap(), ServerMessage::FileDeleted { .. }));
		assert!(coordinator.inner.tombstones.get("note.md").await.is_some());
	}

	#[tokio::test]
	async fn dominant_tombstone_suppresses_resurrection() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let mut rx_a = register(&coordinator, "a").await;

		coordinator
			.dispatch(ClientMessage::FileDelete {
				device_id: "a".to_string(),
				timestamp_ms: 1000,
				vector_clock: clock("a", 5),
				payload: FileDeletePayload { path: "note.md".to_string() },
			})
			.await;
		rx_a.try_recv().unwrap_err();

		// a's own stale clock (from before the delete) tries to recreate it.
		coordinator.dispatch(change_msg("a", "note.md", b"stale write", 500, None)).await;
		let msg = rx_a.try_recv().unwrap();
		assert!(matches!(msg, ServerMessage::FileDeleted { .. }));
	}

	#[tokio::test]
	async fn request_full_sync_replies_with_snapshot() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let mut rx_a = register(&coordinator, "a").await;

		coordinator.dispatch(change_msg("a", "note.md", b"hello", 1000, None)).await;
		rx_a.try_recv().unwrap();

		coordinator
			.dispatch(ClientMessage::RequestFullSync { device_id: "a".to_string(), timestamp_ms: 2000, vector_clock: VectorClock::new() })
			.await;
		let msg = rx_a.try_recv().unwrap();
		match msg {
			ServerMessage::FullSync { payload, .. } => assert_eq!(payload.files.len(), 1),
			_ => panic!("expected full_sync reply"),
		}
	}

	#[tokio::test]
	async fn ping_replies_pong_to_requester_only() {
		let dir = tempdir().unwrap();
		let coordinator = coordinator(dir.path(), ConflictResolution::LastWriteWins);
		let mut rx_a = register(&coordinator, "a").await;
		let mut rx_b = register(&coordinator, "b").await;

		coordinator
			.dispatch(ClientMessage::Ping { device_id: "a".to_string(), timestamp_ms: 1, vector_clock: VectorClock::new() })
			.await;

		assert!(matches!(rx_a.try_recv().unwrap(), ServerMessage::Pong { .. }));
		assert!(rx_b.try_recv().is_err());
	}
}

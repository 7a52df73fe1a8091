//! Client-side Sync Coordinator (§4.9): a debounced outbound queue, inbound
//! frame application against the host filesystem, and full-sync
//! reconciliation (§4.9a). Runs single-threaded and cooperative — every
//! mutation and every send happens on the host's own event loop, which
//! here is just "whatever task polls the futures this module returns".

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};

use crate::client::host::HostFilesystem;
use crate::logging::warn;
use crate::protocol::{
	self, ClientMessage, FileChangePayload, FileDeletePayload, FileMovePayload, FileRecord, FullSyncPayload,
	RequestFilePayload, ServerMessage, TombstoneRecord,
};
use crate::store;
use crate::vector_clock::VectorClock;

pub const FULL_SYNC_YIELD_EVERY: usize = 50;

/// Transient, user-facing status the host application may surface
/// ("connected / disconnected / reconnecting in Xs / sync failed /
/// conflict detected"), per §7. Successful sync is otherwise silent aside
/// from the file count carried on `SyncComplete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientNotice {
	Connected,
	Disconnected,
	ReconnectingIn { seconds: u64 },
	SyncFailed { reason: String },
	ConflictDetected { path: String },
	SyncComplete { files: usize },
}

/// What a debounce timer does when it fires, keyed by path in `pending`.
#[derive(Debug, Clone)]
enum QueuedOp {
	Change { path: String },
	Delete { path: String },
	Move { old_path: String, new_path: String },
}

struct ClientState {
	/// Path (or, for a move, the new path) → generation. A timer fires only
	/// if its captured generation still matches; anything newer — another
	/// queue_* call for the same path, or a move that swallows it — has
	/// already bumped the counter, making the stale timer a no-op.
	pending_generation: HashMap<String, u64>,
	local_hashes: HashMap<String, String>,
	clock: VectorClock,
	applying_remote: bool,
}

/// Debounced, reconciling sync coordinator for one client device.
pub struct ClientCoordinator {
	host: Arc<dyn HostFilesystem>,
	device_id: String,
	debounce: Duration,
	outbound: mpsc::Sender<ClientMessage>,
	notices: mpsc::UnboundedSender<ClientNotice>,
	state: Mutex<ClientState>,
}

impl ClientCoordinator {
	pub fn new(
		host: Arc<dyn HostFilesystem>,
		device_id: String,
		debounce: Duration,
		outbound: mpsc::Sender<ClientMessage>,
		notices: mpsc::UnboundedSender<ClientNotice>,
	) -> Arc<Self> {
		Arc::new(ClientCoordinator {
			host,
			device_id,
			debounce,
			outbound,
			notices,
			state: Mutex::new(ClientState {
				pending_generation: HashMap::new(),
				local_hashes: HashMap::new(),
				clock: VectorClock::new(),
				applying_remote: false,
			}),
		})
	}

	pub fn device_id(&self) -> &str {
		&self.device_id
	}

	/// Surface a transient status notice to the host application (§7).
	pub fn notify(&self, notice: ClientNotice) {
		let _ = self.notices.send(notice);
	}

	async fn is_applying_remote(&self) -> bool {
		self.state.lock().await.applying_remote
	}

	async fn set_applying_remote(&self, value: bool) {
		self.state.lock().await.applying_remote = value;
	}

	/// Bump this device's own clock slot and return the resulting snapshot.
	async fn bump_clock(&self) -> VectorClock {
		let mut state = self.state.lock().await;
		state.clock.bump(&self.device_id);
		state.clock.clone()
	}

	async fn clock_snapshot(&self) -> VectorClock {
		self.state.lock().await.clock.clone()
	}

	async fn next_generation(&self, key: &str) -> u64 {
		let mut state = self.state.lock().await;
		let slot = state.pending_generation.entry(key.to_string()).or_insert(0);
		*slot += 1;
		*slot
	}

	async fn generation_is_current(&self, key: &str, generation: u64) -> bool {
		self.state.lock().await.pending_generation.get(key).copied() == Some(generation)
	}

	// ---- Outbound: host-observed events -> debounced wire frames ----

	/// The host reports a file was created or modified at `path`.
	pub async fn queue_change(self: &Arc<Self>, path: String) {
		if self.is_applying_remote().await {
			return;
		}
		let generation = self.next_generation(&path).await;
		self.schedule(QueuedOp::Change { path }, generation);
	}

	/// The host reports a file was removed at `path`.
	pub async fn queue_delete(self: &Arc<Self>, path: String) {
		if self.is_applying_remote().await {
			return;
		}
		let generation = self.next_generation(&path).await;
		self.schedule(QueuedOp::Delete { path }, generation);
	}

	/// The host reports an atomic rename. Cancels any scheduled send for
	/// either endpoint and schedules a single `file_move`, keyed on the new
	/// path, never a delete+change pair.
	pub async fn queue_move(self: &Arc<Self>, old_path: String, new_path: String) {
		if self.is_applying_remote().await {
			return;
		}
		// Cancel whatever was pending for both paths.
		let _ = self.next_generation(&old_path).await;
		let generation = self.next_generation(&new_path).await;
		self.schedule(QueuedOp::Move { old_path, new_path }, generation);
	}

	fn schedule(self: &Arc<Self>, op: QueuedOp, generation: u64) {
		let this = Arc::clone(self);
		tokio::spawn(async move {
			tokio::time::sleep(this.debounce).await;
			this.fire(op, generation).await;
		});
	}

	async fn fire(self: &Arc<Self>, op: QueuedOp, generation: u64) {
		let key = match &op {
			QueuedOp::Change { path } | QueuedOp::Delete { path } => path.clone(),
			QueuedOp::Move { new_path, .. } => new_path.clone(),
		};
		if !self.generation_is_current(&key, generation).await {
			return; // superseded by a newer queue_* call for this path
		}

		match op {
			QueuedOp::Change { path } => self.fire_change(&path).await,
			QueuedOp::Delete { path } => self.fire_delete(&path).await,
			QueuedOp::Move { old_path, new_path } => self.fire_move(&old_path, &new_path).await,
		}
	}

	async fn fire_change(&self, path: &str) {
		let bytes = match self.host.read(native(path).as_path()).await {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(path, error = %e, "host read failed while firing debounced change");
				return;
			}
		};
		let hash = store::content_hash(&bytes);
		let mtime_ms = now_ms();
		let previous_hash = {
			let mut state = self.state.lock().await;
			let previous = state.local_hashes.insert(path.to_string(), hash.clone());
			state.clock.bump(&self.device_id);
			previous
		};
		let vector_clock = self.clock_snapshot().await;
		self.send(ClientMessage::FileChange {
			device_id: self.device_id.clone(),
			timestamp_ms: mtime_ms,
			vector_clock,
			payload: FileChangePayload {
				path: path.to_string(),
				content_b64: protocol::encode_content(&bytes),
				mtime_ms,
				hash,
				previous_hash,
			},
		})
		.await;
	}

	async fn fire_delete(&self, path: &str) {
		let vector_clock = self.bump_clock().await;
		self.state.lock().await.local_hashes.remove(path);
		self.send(ClientMessage::FileDelete {
			device_id: self.device_id.clone(),
			timestamp_ms: now_ms(),
			vector_clock,
			payload: FileDeletePayload { path: path.to_string() },
		})
		.await;
	}

	async fn fire_move(&self, old_path: &str, new_path: &str) {
		let bytes = match self.host.read(native(new_path).as_path()).await {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(new_path, error = %e, "host read failed while firing debounced move");
				return;
			}
		};
		let hash = store::content_hash(&bytes);
		let mtime_ms = now_ms();
		{
			let mut state = self.state.lock().await;
			state.local_hashes.remove(old_path);
			state.local_hashes.insert(new_path.to_string(), hash.clone());
			state.clock.bump(&self.device_id);
		}
		let vector_clock = self.clock_snapshot().await;
		self.send(ClientMessage::FileMove {
			device_id: self.device_id.clone(),
			timestamp_ms: mtime_ms,
			vector_clock,
			payload: FileMovePayload {
				old_path: old_path.to_string(),
				new_path: new_path.to_string(),
				content_b64: protocol::encode_content(&bytes),
				mtime_ms,
				hash,
			},
		})
		.await;
	}

	/// Ask the server for a full reconciliation snapshot.
	pub async fn request_full_sync(&self) {
		let vector_clock = self.clock_snapshot().await;
		self.send(ClientMessage::RequestFullSync {
			device_id: self.device_id.clone(),
			timestamp_ms: now_ms(),
			vector_clock,
		})
		.await;
	}

	async fn send(&self, msg: ClientMessage) {
		if self.outbound.send(msg).await.is_err() {
			warn!("outbound channel closed, dropping client frame");
		}
	}

	// ---- Inbound: wire frames -> local filesystem mutations ----

	/// Apply one decoded server frame. Frames whose `origin_device` is this
	/// device are dropped (echo suppression).
	pub async fn handle_inbound(self: &Arc<Self>, msg: ServerMessage) {
		if msg.origin_device() == self.device_id {
			return;
		}

		self.set_applying_remote(true).await;
		match msg {
			ServerMessage::FileChanged { payload, .. } => self.apply_file_changed(payload).await,
			ServerMessage::FileDeleted { payload, .. } => self.apply_file_deleted(payload).await,
			ServerMessage::FileMoved { payload, .. } => self.apply_file_moved(payload).await,
			ServerMessage::FullSync { payload, .. } => {
				// reconcile_full_sync manages its own applying_remote guard
				// around the (much longer) reconciliation pass, so release
				// it here first to avoid double-guarding.
				self.set_applying_remote(false).await;
				self.reconcile_full_sync(payload).await;
				return;
			}
			ServerMessage::Conflict { payload, .. } => {
				self.notify(ClientNotice::ConflictDetected { path: payload.path });
			}
			ServerMessage::Pong { .. } => {}
		}
		self.set_applying_remote(false).await;
	}

	async fn apply_file_changed(&self, payload: FileChangePayload) {
		let bytes = match protocol::decode_content(&payload.content_b64) {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(path = %payload.path, error = %e, "dropping file_changed with unreadable content");
				return;
			}
		};
		if let Err(e) = self.host.write(native(&payload.path).as_path(), &bytes).await {
			warn!(path = %payload.path, error = %e, "failed to apply inbound file_changed");
			return;
		}
		self.state.lock().await.local_hashes.insert(payload.path, payload.hash);
	}

	async fn apply_file_deleted(&self, payload: FileDeletePayload) {
		if let Err(e) = self.host.delete(native(&payload.path).as_path()).await {
			warn!(path = %payload.path, error = %e, "failed to apply inbound file_deleted");
			return;
		}
		self.state.lock().await.local_hashes.remove(&payload.path);
	}

	async fn apply_file_moved(&self, payload: FileMovePayload) {
		let bytes = match protocol::decode_content(&payload.content_b64) {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(new_path = %payload.new_path, error = %e, "dropping file_moved with unreadable content");
				return;
			}
		};
		if let Err(e) = self.host.delete(native(&payload.old_path).as_path()).await {
			warn!(path = %payload.old_path, error = %e, "failed to delete old path during inbound move");
		}
		if let Err(e) = self.host.write(native(&payload.new_path).as_path(), &bytes).await {
			warn!(path = %payload.new_path, error = %e, "failed to write new path during inbound move");
			return;
		}
		let mut state = self.state.lock().await;
		state.local_hashes.remove(&payload.old_path);
		state.local_hashes.insert(payload.new_path, payload.hash);
	}

	// ---- Full-sync reconciliation (§4.9a) ----

	async fn reconcile_full_sync(self: &Arc<Self>, payload: FullSyncPayload) {
		self.set_applying_remote(true).await;
		{
			let mut state = self.state.lock().await;
			state.clock.merge(&payload.vector_clock);
		}

		let server_files: HashMap<String, FileRecord> =
			payload.files.iter().map(|f| (f.path.clone(), f.clone())).collect();
		let tombstones: HashMap<String, TombstoneRecord> =
			payload.tombstones.iter().map(|t| (t.path.clone(), t.clone())).collect();

		let (local_by_path, local_by_hash) = self.scan_local_files().await;

		let mut file_count = server_files.len();

		for (path, record) in &server_files {
			if let Some(local_mtime) = local_by_path.get(path) {
				match local_mtime.cmp(&record.mtime_ms) {
					std::cmp::Ordering::Greater => self.send_change_from_local(path, *local_mtime).await,
					std::cmp::Ordering::Less => self.send_request_file(path).await,
					std::cmp::Ordering::Equal => {}
				}
			} else if let Some(local_path_with_same_hash) = local_by_hash.get(&record.hash) {
				if local_path_with_same_hash != path {
					// The file already lives at a different local path with
					// identical content: a move already applied locally.
					// Tell the server to drop the stale path; the new path
					// re-uploads via the local-only pass below.
					self.send_delete(path).await;
				}
			} else {
				self.send_request_file(path).await;
			}
		}

		for (path, mtime_ms) in &local_by_path {
			if server_files.contains_key(path) {
				continue;
			}
			if tombstones.contains_key(path) {
				if let Err(e) = self.host.delete(native(path).as_path()).await {
					warn!(path, error = %e, "failed to apply tombstone during full-sync reconciliation");
					continue;
				}
				self.state.lock().await.local_hashes.remove(path);
			} else {
				// Either a move the server doesn't know about yet, or a file
				// the server has simply never seen. Either way: upload it.
				// Never delete a local-only file without an explicit
				// tombstone — that is the invariant this pass exists to
				// protect.
				self.send_change_from_local(path, *mtime_ms).await;
				file_count += 1;
			}
		}

		self.notify(ClientNotice::SyncComplete { files: file_count });
		self.set_applying_remote(false).await;
	}

	/// Walk the host filesystem, hashing every non-hidden file. Yields
	/// every `FULL_SYNC_YIELD_EVERY` files so a single-threaded host event
	/// loop is never blocked for the whole walk. Updates `local_hashes` as
	/// a side effect so the debounced path and the reconciliation path
	/// agree on what was last seen.
	async fn scan_local_files(&self) -> (HashMap<String, u64>, HashMap<String, String>) {
		let entries = self.host.list().await.unwrap_or_default();
		let mut by_path = HashMap::new();
		let mut by_hash = HashMap::new();

		for (i, (relative, mtime_ms)) in entries.into_iter().enumerate() {
			let wire = crate::path::to_wire_path(&relative);
			if crate::path::has_hidden_segment(&wire) {
				continue;
			}
			let bytes = match self.host.read(&relative).await {
				Ok(bytes) => bytes,
				Err(e) => {
					warn!(path = %wire, error = %e, "skipping unreadable file during full-sync scan");
					continue;
				}
			};
			let hash = store::content_hash(&bytes);
			by_path.insert(wire.clone(), mtime_ms);
			by_hash.entry(hash.clone()).or_insert_with(|| wire.clone());
			self.state.lock().await.local_hashes.insert(wire, hash);

			if (i + 1) % FULL_SYNC_YIELD_EVERY == 0 {
				tokio::task::yield_now().await;
			}
		}

		(by_path, by_hash)
	}

	async fn send_change_from_local(&self, path: &str, mtime_ms: u64) {
		let bytes = match self.host.read(native(path).as_path()).await {
			Ok(bytes) => bytes,
			Err(e) => {
				warn!(path, error = %e, "failed to read local file for full-sync upload");
				return;
			}
		};
		let hash = store::content_hash(&bytes);
		let vector_clock = self.bump_clock().await;
		self.send(ClientMessage::FileChange {
			device_id: self.device_id.clone(),
			timestamp_ms: now_ms(),
			vector_clock,
			payload: FileChangePayload {
				path: path.to_string(),
				content_b64: protocol::encode_content(&bytes),
				mtime_ms,
				hash,
				previous_hash: None,
			},
		})
		.await;
	}

	async fn send_request_file(&self, path: &str) {
		let vector_clock = self.clock_snapshot().await;
		self.send(ClientMessage::RequestFile {
			device_id: self.device_id.clone(),
			timestamp_ms: now_ms(),
			vector_clock,
			payload: RequestFilePayload { path: path.to_string() },
		})
		.await;
	}

	async fn send_delete(&self, path: &str) {
		let vector_clock = self.bump_clock().await;
		self.send(ClientMessage::FileDelete {
			device_id: self.device_id.clone(),
			timestamp_ms: now_ms(),
			vector_clock,
			payload: FileDeletePayload { path: path.to_string() },
		})
		.await;
	}
}

fn native(wire_path: &str) -> PathBuf {
	PathBuf::from(wire_path.replace('/', std::path::MAIN_SEPARATOR_STR))
}

fn now_ms() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::client::host::LocalFilesystem;
	use tempfile::tempdir;

	fn coordinator(
		root: &Path,
	) -> (Arc<ClientCoordinator>, mpsc::Receiver<ClientMessage>, mpsc::UnboundedReceiver<ClientNotice>) {
		let host: Arc<dyn HostFilesystem> = Arc::new(LocalFilesystem::new(root));
		let (tx, rx) = mpsc::channel(256);
		let (notice_tx, notice_rx) = mpsc::unbounded_channel();
		let coordinator = ClientCoordinator::new(host, "laptop".to_string(), Duration::from_millis(20), tx, notice_tx);
		(coordinator, rx, notice_rx)
	}

	#[tokio::test]
	async fn queue_change_debounces_and_sends_once() {
		let dir = tempdir().unwrap();
		let (coordinator, mut rx, _notices) = coordinator(dir.path());
		coordinator.host.write(Path::new("a.md"), b"v1").await.unwrap();

		coordinator.queue_change("a.md".to_string()).await;
		coordinator.queue_change("a.md".to_string()).await; // cancels the first timer

		tokio::time::sleep(Duration::from_millis(60)).await;
		let msg = rx.try_recv().unwrap();
		assert!(matches!(msg, ClientMessage::FileChange { .. }));
		assert!(rx.try_recv().is_err(), "only one frame should have been sent");
	}

	#[tokio::test]
	async fn queue_move_cancels_pending_entries_for_both_paths() {
		let dir = tempdir().unwrap();
		let (coordinator, mut rx, _notices) = coordinator(dir.path());
		coordinator.host.write(Path::new("b.md"), b"moved").await.unwrap();

		coordinator.queue_change("a.md".to_string()).await;
		coordinator.queue_move("a.md".to_string(), "b.md".to_string()).await;

		tokio::time::sleep(Duration::from_millis(60)).await;
		let msg = rx.try_recv().unwrap();
		assert!(matches!(msg, ClientMessage::FileMove { .. }));
		assert!(rx.try_recv().is_err(), "the superseded change must not also fire");
	}

	#[tokio::test]
	async fn echo_suppression_drops_frames_from_self() {
		let dir = tempdir().unwrap();
		let (coordinator, _rx, _notices) = coordinator(dir.path());
		coordinator
			.handle_inbound(ServerMessage::FileChanged {
				origin_device: "laptop".to_string(),
				payload: FileChangePayload {
					path: "a.md".to_string(),
					content_b64: protocol::encode_content(b"x"),
					mtime_ms: 0,
					hash: "irrelevant".to_string(),
					previous_hash: None,
				},
			})
			.await;
		assert!(coordinator.host.read(Path::new("a.md")).await.is_err());
	}

	#[tokio::test]
	async fn inbound_file_changed_writes_through_host() {
		let dir = tempdir().unwrap();
		let (coordinator, _rx, _notices) = coordinator(dir.path());
		coordinator
			.handle_inbound(ServerMessage::FileChanged {
				origin_device: "other".to_string(),
				payload: FileChangePayload {
					path: "a.md".to_string(),
					content_b64: protocol::encode_content(b"hello"),
					mtime_ms: 0,
					hash: store::content_hash(b"hello"),
					previous_hash: None,
				},
			})
			.await;
		assert_eq!(coordinator.host.read(Path::new("a.md")).await.unwrap(), b"hello");
	}

	#[tokio::test]
	async fn full_sync_never_deletes_local_only_file_without_tombstone() {
		let dir = tempdir().unwrap();
		let (coordinator, mut rx, _notices) = coordinator(dir.path());
		coordinator.host.write(Path::new("foo.md"), b"keep me").await.unwrap();
		coordinator.host.write(Path::new("bar.md"), b"keep me too").await.unwrap();

		coordinator
			.reconcile_full_sync(FullSyncPayload { files: vec![], tombstones: vec![], vector_clock: VectorClock::new() })
			.await;

		assert!(coordinator.host.read(Path::new("foo.md")).await.is_ok());
		assert!(coordinator.host.read(Path::new("bar.md")).await.is_ok());

		let mut uploaded = Vec::new();
		while let Ok(msg) = rx.try_recv() {
			if let ClientMessage::FileChange { payload, .. } = msg {
				uploaded.push(payload.path);
			}
		}
		uploaded.sort();
		assert_eq!(uploaded, vec!["bar.md".to_string(), "foo.md".to_string()]);
	}

	#[tokio::test]
	async fn full_sync_deletes_local_file_covered_by_tombstone() {
		let dir = tempdir().unwrap();
		let (coordinator, _rx, _notices) = coordinator(dir.path());
		coordinator.host.write(Path::new("gone.md"), b"stale").await.unwrap();

		coordinator
			.reconcile_full_sync(FullSyncPayload {
				files: vec![],
				tombstones: vec![TombstoneRecord {
					path: "gone.md".to_string(),
					deleted_at_s: 0,
					deleted_by_device: "other".to_string(),
					vector_clock: VectorClock::new(),
					ttl_expires_at_s: u64::MAX,
				}],
				vector_clock: VectorClock::new(),
			})
			.await;

		assert!(coordinator.host.read(Path::new("gone.md")).await.is_err());
	}

	#[tokio::test]
	async fn full_sync_detects_already_applied_move_via_hash() {
		let dir = tempdir().unwrap();
		let (coordinator, mut rx, _notices) = coordinator(dir.path());
		// Locally, the file already lives at b.md; the server still thinks
		// it's at a.md.
		coordinator.host.write(Path::new("b.md"), b"moved content").await.unwrap();

		coordinator
			.reconcile_full_sync(FullSyncPayload {
				files: vec![FileRecord {
					path: "a.md".to_string(),
					hash: store::content_hash(b"moved content"),
					size: 13,
					mtime_ms: 0,
				}],
				tombstones: vec![],
				vector_clock: VectorClock::new(),
			})
			.await;

		let mut saw_delete_of_a = false;
		while let Ok(msg) = rx.try_recv() {
			if let ClientMessage::FileDelete { payload, .. } = msg {
				if payload.path == "a.md" {
					saw_delete_of_a = true;
				}
			}
		}
		assert!(saw_delete_of_a);
	}
}

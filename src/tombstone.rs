//! Tracks deletions with causal metadata and a TTL. The in-memory map is
//! the source of truth at runtime; it is backed by an append-only
//! JSON-lines log so that deletions survive a server restart — see
//! DESIGN.md for why JSON-lines rather than an embedded database.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

use crate::error::TombstoneError;
use crate::protocol::TombstoneRecord;
use crate::vector_clock::VectorClock;

pub const DEFAULT_TTL_SECS: u64 = 30 * 86_400;

/// A single logged record: either a tombstone being created, or a path's
/// tombstone being removed (resurrection, or gc compaction).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum LogRecord {
	Create(TombstoneRecord),
	Remove { path: String },
}

pub struct TombstoneRegistry {
	ttl_secs: u64,
	log_path: PathBuf,
	entries: RwLock<HashMap<String, TombstoneRecord>>,
}

impl TombstoneRegistry {
	pub fn new(log_path: impl Into<PathBuf>, ttl_secs: u64) -> Self {
		TombstoneRegistry { ttl_secs, log_path: log_path.into(), entries: RwLock::new(HashMap::new()) }
	}

	/// Replay the durable log into the in-memory map on startup. Entries
	/// already past TTL are skipped rather than re-inserted; compaction of
	/// the log itself happens lazily, at the next `gc()`.
	pub async fn load(&self) -> Result<usize, TombstoneError> {
		let contents = match tokio::fs::read_to_string(&self.log_path).await {
			Ok(c) => c,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
			Err(e) => return Err(TombstoneError::Io(e)),
		};

		let now = now_secs();
		let mut entries = self.entries.write().await;
		entries.clear();
		for (line_no, line) in contents.lines().enumerate() {
			if line.trim().is_empty() {
				continue;
			}
			let record: LogRecord = serde_json::from_str(line)
				.map_err(|e| TombstoneError::Corrupted { line: line_no + 1, message: e.to_string() })?;
			match record {
				LogRecord::Create(tombstone) => {
					if tombstone.ttl_expires_at_s >= now {
						entries.insert(tombstone.path.clone(), tombstone);
					}
				}
				LogRecord::Remove { path } => {
					entries.remove(&path);
				}
			}
		}
		Ok(entries.len())
	}

	async fn append(&self, record: &LogRecord) -> Result<(), TombstoneError> {
		if let Some(parent) = self.log_path.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		let mut line = serde_json::to_string(record)
			.map_err(|e| TombstoneError::Corrupted { line: 0, message: e.to_string() })?;
		line.push('\n');
		let mut file = tokio::fs::OpenOptions::new()
			.create(true)
			.append(true)
			.open(&self.log_path)
			.await?;
		file.write_all(line.as_bytes()).await?;
		Ok(())
	}

	/// Create a tombstone for `path`, attributed to `device_id` at the given
	/// vector clock. `deleted_at_s` is `now`; the TTL is `now + ttl_secs`.
	pub async fn create(
		&self,
		path: &str,
		device_id: &str,
		clock: VectorClock,
	) -> Result<TombstoneRecord, TombstoneError> {
		let now = now_secs();
		let record = TombstoneRecord {
			path: path.to_string(),
			deleted_at_s: now,
			deleted_by_device: device_id.to_string(),
			vector_clock: clock,
			ttl_expires_at_s: now + self.ttl_secs,
		};
		self.append(&LogRecord::Create(record.clone())).await?;
		self.entries.write().await.insert(path.to_string(), record.clone());
		Ok(record)
	}

	pub async fn get(&self, path: &str) -> Option<TombstoneRecord> {
		self.entries.read().await.get(path).cloned()
	}

	pub async fn list(&self) -> Vec<TombstoneRecord> {
		let mut out: Vec<_> = self.entries.read().await.values().cloned().collect();
		out.sort_by(|a, b| a.path.cmp(&b.path));
		out
	}

	/// Remove a path's tombstone, e.g. on resurrection (a write to a
	/// previously-deleted path).
	pub async fn remove(&self, path: &str) -> Result<(), TombstoneError> {
		let removed = self.entries.write().await.remove(path).is_some();
		if removed {
			self.append(&LogRecord::Remove { path: path.to_string() }).await?;
		}
		Ok(())
	}

	/// Drop entries whose TTL has expired; returns the count removed.
	/// Compacts the durable log to just the surviving entries so the log
	/// doesn't grow unbounded across many gc cycles.
	pub async fn gc(&self) -> Result<usize, TombstoneError> {
		let now = now_secs();
		let mut entries = self.entries.write().await;
		let before = entries.len();
		entries.retain(|_, tombstone| tombstone.ttl_expires_at_s >= now);
		let removed = before - entries.len();
		if removed > 0 {
			self.rewrite_log(&entries).await?;
		}
		Ok(removed)
	}

	async fn rewrite_log(&self, entries: &HashMap<String, TombstoneRecord>) -> Result<(), TombstoneError> {
		let mut body = String::new();
		for tombstone in entries.values() {
			let line = serde_json::to_string(&LogRecord::Create(tombstone.clone()))
				.map_err(|e| TombstoneError::Corrupted { line: 0, message: e.to_string() })?;
			body.push_str(&line);
			body.push('\n');
		}
		let tmp = tmp_log_path(&self.log_path);
		tokio::fs::write(&tmp, body).await?;
		tokio::fs::rename(&tmp, &self.log_path).await?;
		Ok(())
	}
}

fn tmp_log_path(path: &Path) -> PathBuf {
	let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".compacting");
	path.with_file_name(name)
}

fn now_secs() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}

#[cfg(test)]
mod tests {
	use super::*;
	use tempfile::tempdir;

	fn clock(device: &str, n: u64) -> VectorClock {
		let mut c = VectorClock::new();
		for _ in 0..n {
			c.bump(device);
		}
		c
	}

	#[tokio::test]
	async fn create_then_get_round_trips() {
		let dir = tempdir().unwrap();
		let reg = TombstoneRegistry::new(dir.path().join("tombstones.log"), DEFAULT_TTL_SECS);
		reg.create("y.md", "d1", clock("d1", 5)).await.unwrap();
		let t = reg.get("y.md").await.unwrap();
		assert_eq!(t.deleted_by_device, "d1");
		assert_eq!(t.vector_clock.get("d1"), 5);
	}

	#[tokio::test]
	async fn remove_clears_entry_resurrection() {
		let dir = tempdir().unwrap();
		let reg = TombstoneRegistry::new(dir.path().join("tombstones.log"), DEFAULT_TTL_SECS);
		reg.create("y.md", "d1", clock("d1", 1)).await.unwrap();
		reg.remove("y.md").await.unwrap();
		assert!(reg.get("y.md").await.is_none());
	}

	#[tokio::test]
	async fn gc_drops_expired_entries_only() {
		let dir = tempdir().unwrap();
		let reg = TombstoneRegistry::new(dir.path().join("tombstones.log"), 0);
		reg.create("expired.md", "d1", clock("d1", 1)).await.unwrap();
		let reg_live = TombstoneRegistry::new(dir.path().join("live.log"), DEFAULT_TTL_SECS);
		reg_live.create("live.md", "d1", clock("d1", 1)).await.unwrap();

		// expired.md's ttl_expires_at_s == now, which is already <= now on the
		// next tick, so a gc some time later removes it.
		tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
		let removed = reg.gc().await.unwrap();
		assert_eq!(removed, 1);
		assert!(reg.get("expired.md").await.is_none());

		let removed_live = reg_live.gc().await.unwrap();
		assert_eq!(removed_live, 0);
		assert!(reg_live.get("live.md").await.is_some());
	}

	#[tokio::test]
	async fn load_replays_log_and_skips_expired() {
		let dir = tempdir().unwrap();
		let log_path = dir.path().join("tombstones.log");
		{
			let reg = TombstoneRegistry::new(&log_path, DEFAULT_TTL_SECS);
			reg.create("a.md", "d1", clock("d1", 1)).await.unwrap();
			reg.create("b.md", "d2", clock("d2", 1)).await.unwrap();
			reg.remove("b.md").await.unwrap();
		}

		let reloaded = TombstoneRegistry::new(&log_path, DEFAULT_TTL_SECS);
		let count = reloaded.load().await.unwrap();
		assert_eq!(count, 1);
		assert!(reloaded.get("a.md").await.is_some());
		assert!(reloaded.get("b.md").await.is_none());
	}

	#[tokio::test]
	async fn load_on_missing_log_is_empty_not_error() {
		let dir = tempdir().unwrap();
		let reg = TombstoneRegistry::new(dir.path().join("nonexistent.log"), DEFAULT_TTL_SECS);
		assert_eq!(reg.load().await.unwrap(), 0);
	}
}

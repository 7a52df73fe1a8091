//! Durable path→bytes storage with an in-memory hash cache. The hash
//! cache is the only shared mutable structure: reads take a read lock,
//! writes/deletes take a write lock, and disk I/O happens without the
//! lock held except for the hash-cache update step itself.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};
use tokio::sync::RwLock;

use crate::error::{StoreError, SyncError};
use crate::path;
use crate::protocol::FileRecord;

/// `{ hash, size, mtime_ms }` for a single stored file (§3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
	pub hash: String,
	pub size: u64,
	pub mtime_ms: u64,
}

pub struct ContentStore {
	root_dir: PathBuf,
	max_file_size_bytes: usize,
	hash_cache: RwLock<HashMap<String, FileInfo>>,
}

impl ContentStore {
	pub fn new(root_dir: impl Into<PathBuf>, max_file_size_bytes: usize) -> Self {
		ContentStore {
			root_dir: root_dir.into(),
			max_file_size_bytes,
			hash_cache: RwLock::new(HashMap::new()),
		}
	}

	pub fn root_dir(&self) -> &Path {
		&self.root_dir
	}

	fn resolve(&self, wire_path: &str) -> Result<PathBuf, SyncError> {
		path::validate(wire_path, &self.root_dir)
	}

	/// Validate, size-check, write the bytes, set the mtime, and refresh
	/// the hash cache entry. Readers never observe a partial file after a
	/// successful write: the bytes land via a temp file in the same
	/// directory followed by a rename, which is atomic on the same
	/// filesystem.
	pub async fn write(
		&self,
		wire_path: &str,
		bytes: &[u8],
		mtime_ms: u64,
	) -> Result<FileInfo, SyncError> {
		if bytes.len() > self.max_file_size_bytes {
			return Err(SyncError::TooLarge { size: bytes.len(), max: self.max_file_size_bytes });
		}
		let dest = self.resolve(wire_path)?;
		let hash = hex_sha256(bytes);
		let size = bytes.len() as u64;

		let dest_owned = dest.clone();
		let bytes_owned = bytes.to_vec();
		tokio::task::spawn_blocking(move || write_atomic(&dest_owned, &bytes_owned, mtime_ms))
			.await
			.map_err(|e| SyncError::Other { message: format!("write task panicked: {}", e) })?
			.map_err(|e| StoreError::Io { path: dest.display().to_string(), source: e })?;

		let info = FileInfo { hash, size, mtime_ms };
		self.hash_cache.write().await.insert(wire_path.to_string(), info.clone());
		Ok(info)
	}

	/// Validated read of the current on-disk bytes.
	pub async fn read(&self, wire_path: &str) -> Result<Vec<u8>, SyncError> {
		let src = self.resolve(wire_path)?;
		tokio::fs::read(&src)
			.await
			.map_err(|e| StoreError::Io { path: src.display().to_string(), source: e }.into())
	}

	/// Validated remove; a missing file counts as success. Evicts the hash
	/// cache entry and sweeps empty ancestor directories up to, but not
	/// including, `root_dir`.
	pub async fn delete(&self, wire_path: &str) -> Result<(), SyncError> {
		let target = self.resolve(wire_path)?;
		match tokio::fs::remove_file(&target).await {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => return Err(StoreError::Io { path: target.display().to_string(), source: e }.into()),
		}
		self.hash_cache.write().await.remove(wire_path);
		self.sweep_empty_ancestors(&target).await;
		Ok(())
	}

	async fn sweep_empty_ancestors(&self, deleted: &Path) {
		let mut dir = deleted.parent().map(Path::to_path_buf);
		while let Some(d) = dir {
			if d == self.root_dir || !d.starts_with(&self.root_dir) {
				break;
			}
			match tokio::fs::remove_dir(&d).await {
				Ok(()) => dir = d.parent().map(Path::to_path_buf),
				Err(_) => break, // not empty, or already gone: stop sweeping
			}
		}
	}

	/// `{ hash, size, mtime_ms }` for a path, read from disk (unlike
	/// `hash_of`, which never touches disk).
	pub async fn info(&self, wire_path: &str) -> Result<FileInfo, SyncError> {
		if let Some(info) = self.hash_cache.read().await.get(wire_path) {
			return Ok(info.clone());
		}
		let target = self.resolve(wire_path)?;
		let bytes = tokio::fs::read(&target)
			.await
			.map_err(|e| StoreError::Io { path: target.display().to_string(), source: e })?;
		let meta = tokio::fs::metadata(&target)
			.await
			.map_err(|e| StoreError::Io { path: target.display().to_string(), source: e })?;
		Ok(FileInfo { hash: hex_sha256(&bytes), size: meta.len(), mtime_ms: mtime_of(&meta) })
	}

	/// Cache-only hash lookup; never hits disk. Returns `""` if unknown.
	pub async fn hash_of(&self, wire_path: &str) -> String {
		self.hash_cache.read().await.get(wire_path).map(|i| i.hash.clone()).unwrap_or_default()
	}

	/// Walk `root_dir`, skipping any directory or entry whose basename
	/// begins with `.`, returning forward-slash paths.
	pub async fn list(&self) -> Result<Vec<FileRecord>, SyncError> {
		let cache = self.hash_cache.read().await;
		let mut records: Vec<FileRecord> = cache
			.iter()
			.filter(|(wire_path, _)| !path::has_hidden_segment(wire_path))
			.map(|(wire_path, info)| FileRecord {
				path: wire_path.clone(),
				hash: info.hash.clone(),
				size: info.size,
				mtime_ms: info.mtime_ms,
			})
			.collect();
		records.sort_by(|a, b| a.path.cmp(&b.path));
		Ok(records)
	}

	/// Run on startup: walk and hash every non-hidden file. Unreadable
	/// files are skipped with a warning rather than failing the walk.
	pub async fn rebuild_cache(&self) -> Result<usize, SyncError> {
		let root = self.root_dir.clone();
		let entries = tokio::task::spawn_blocking(move || walk_non_hidden_files(&root))
			.await
			.map_err(|e| SyncError::Other { message: format!("walk task panicked: {}", e) })??;

		let mut cache = self.hash_cache.write().await;
		cache.clear();
		let mut count = 0;
		for (wire_path, abs_path) in entries {
			match tokio::fs::read(&abs_path).await {
				Ok(bytes) => {
					let meta = match tokio::fs::metadata(&abs_path).await {
						Ok(m) => m,
						Err(e) => {
							tracing::warn!(path = %abs_path.display(), error = %e, "skipping unreadable metadata during cache rebuild");
							continue;
						}
					};
					cache.insert(
						wire_path,
						FileInfo { hash: hex_sha256(&bytes), size: meta.len(), mtime_ms: mtime_of(&meta) },
					);
					count += 1;
				}
				Err(e) => {
					tracing::warn!(path = %abs_path.display(), error = %e, "skipping unreadable file during cache rebuild");
				}
			}
		}
		Ok(count)
	}
}

fn hex_sha256(bytes: &[u8]) -> String {
	let mut hasher = Sha256::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

/// Lowercase hex SHA-256 of `bytes`. Exposed for callers outside the store
/// (the client coordinator's full-sync reconciliation and debounced
/// outbound sends) that need the exact same hash the server computes.
pub fn content_hash(bytes: &[u8]) -> String {
	hex_sha256(bytes)
}

fn mtime_of(meta: &std::fs::Metadata) -> u64 {
	meta.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_millis() as u64)
		.unwrap_or(0)
}

fn write_atomic(dest: &Path, bytes: &[u8], mtime_ms: u64) -> std::io::Result<()> {
	if let Some(parent) = dest.parent() {
		std::fs::create_dir_all(parent)?;
	}
	let tmp = tmp_path(dest);
	std::fs::write(&tmp, bytes)?;
	std::fs::rename(&tmp, dest)?;

	// Best-effort mtime preservation; failure to set it is not fatal since
	// the hash cache, not the filesystem mtime, is authoritative for
	// change detection on the server.
	let mtime = UNIX_EPOCH + std::time::Duration::from_millis(mtime_ms);
	if let Ok(file) = std::fs::File::open(dest) {
		let _ = file.set_modified(mtime);
	}
	Ok(())
}

fn tmp_path(dest: &Path) -> PathBuf {
	let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
	name.push(".vault-sync-tmp");
	dest.with_file_name(name)
}

fn walk_non_hidden_files(root: &Path) -> std::io::Result<Vec<(String, PathBuf)>> {
	let mut out = Vec::new();
	if !root.exists() {
		return Ok(out);
	}
	walk_dir(root, root, &mut out)?;
	Ok(out)
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> std::io::Result<()> {
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let file_type = entry.file_type()?;
		let name = entry.file_name();
		let name_str = name.to_string_lossy();
		if name_str.starts_with('.') {
			continue;
		}
		let abs_path = entry.path();
		if file_type.is_dir() {
			walk_dir(root, &abs_path, out)?;
		} else if file_type.is_file() {
			let relative = abs_path.strip_prefix(root).unwrap_or(&abs_path);
			out.push((path::to_wire_path(relative), abs_path));
		}
	}
	Ok(())
}

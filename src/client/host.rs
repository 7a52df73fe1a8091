//! The small filesystem contract the client Sync Coordinator needs from
//! its host application, plus a reference adapter backed by the real
//! local filesystem and a `notify` watcher.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

use crate::logging::warn;

/// Read/write/delete bytes under a root directory. Paths passed to these
/// methods are always relative, forward-slash, already-validated wire
/// paths turned into native form by the caller.
#[async_trait]
pub trait HostFilesystem: Send + Sync {
	async fn read(&self, relative: &Path) -> std::io::Result<Vec<u8>>;
	async fn write(&self, relative: &Path, bytes: &[u8]) -> std::io::Result<()>;
	async fn delete(&self, relative: &Path) -> std::io::Result<()>;
	fn root(&self) -> &Path;

	/// Enumerate every non-hidden file under `root`, relative path plus
	/// on-disk mtime in epoch milliseconds. Used only by full-sync
	/// reconciliation (§4.9a), never on the hot debounce path.
	async fn list(&self) -> std::io::Result<Vec<(PathBuf, u64)>>;
}

pub struct LocalFilesystem {
	root: PathBuf,
}

impl LocalFilesystem {
	pub fn new(root: impl Into<PathBuf>) -> Self {
		LocalFilesystem { root: root.into() }
	}
}

#[async_trait]
impl HostFilesystem for LocalFilesystem {
	async fn read(&self, relative: &Path) -> std::io::Result<Vec<u8>> {
		tokio::fs::read(self.root.join(relative)).await
	}

	async fn write(&self, relative: &Path, bytes: &[u8]) -> std::io::Result<()> {
		let dest = self.root.join(relative);
		if let Some(parent) = dest.parent() {
			tokio::fs::create_dir_all(parent).await?;
		}
		tokio::fs::write(dest, bytes).await
	}

	async fn delete(&self, relative: &Path) -> std::io::Result<()> {
		match tokio::fs::remove_file(self.root.join(relative)).await {
			Ok(()) => Ok(()),
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(e),
		}
	}

	fn root(&self) -> &Path {
		&self.root
	}

	async fn list(&self) -> std::io::Result<Vec<(PathBuf, u64)>> {
		let root = self.root.clone();
		tokio::task::spawn_blocking(move || walk_non_hidden(&root))
			.await
			.map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e.to_string()))?
	}
}

fn walk_non_hidden(root: &Path) -> std::io::Result<Vec<(PathBuf, u64)>> {
	let mut out = Vec::new();
	if !root.exists() {
		return Ok(out);
	}
	walk_dir(root, root, &mut out)?;
	Ok(out)
}

fn walk_dir(root: &Path, dir: &Path, out: &mut Vec<(PathBuf, u64)>) -> std::io::Result<()> {
	for entry in std::fs::read_dir(dir)? {
		let entry = entry?;
		let file_type = entry.file_type()?;
		let name = entry.file_name();
		if name.to_string_lossy().starts_with('.') {
			continue;
		}
		let abs_path = entry.path();
		if file_type.is_dir() {
			walk_dir(root, &abs_path, out)?;
		} else if file_type.is_file() {
			let meta = entry.metadata()?;
			let mtime_ms = meta
				.modified()
				.ok()
				.and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
				.map(|d| d.as_millis() as u64)
				.unwrap_or(0);
			let relative = abs_path.strip_prefix(root).unwrap_or(&abs_path).to_path_buf();
			out.push((relative, mtime_ms));
		}
	}
	Ok(())
}

/// A local filesystem change as observed by the watcher, already collapsed
/// to the three shapes the client Coordinator understands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostEvent {
	Changed(PathBuf),
	Removed(PathBuf),
	Moved { from: PathBuf, to: PathBuf },
}

/// Watch `root` recursively and forward translated events on the returned
/// channel. The underlying `notify` watcher is driven on a blocking thread
/// since its callback is synchronous; events are bridged into async-land
/// over a bounded `tokio::mpsc` channel.
pub fn watch(root: PathBuf) -> mpsc::Receiver<HostEvent> {
	let (tx, rx) = mpsc::channel(256);

	std::thread::spawn(move || {
		let (raw_tx, raw_rx) = std::sync::mpsc::channel();
		let mut watcher = match RecommendedWatcher::new(
			move |res| {
				let _ = raw_tx.send(res);
			},
			notify::Config::default(),
		) {
			Ok(watcher) => watcher,
			Err(e) => {
				warn!(error = %e, "failed to create filesystem watcher");
				return;
			}
		};

		if let Err(e) = watcher.watch(&root, RecursiveMode::Recursive) {
			warn!(error = %e, root = %root.display(), "failed to watch root directory");
			return;
		}

		while let Ok(result) = raw_rx.recv() {
			let event = match result {
				Ok(event) => event,
				Err(_) => continue,
			};
			for translated in translate(event) {
				if tx.blocking_send(translated).is_err() {
					return;
				}
			}
		}
	});

	rx
}

fn translate(event: notify::Event) -> Vec<HostEvent> {
	use notify::event::{ModifyKind, RenameMode};
	use notify::EventKind;

	match event.kind {
		EventKind::Create(_) => event.paths.into_iter().map(HostEvent::Changed).collect(),
		EventKind::Modify(ModifyKind::Name(RenameMode::Both)) if event.paths.len() == 2 => {
			vec![HostEvent::Moved { from: event.paths[0].clone(), to: event.paths[1].clone() }]
		}
		EventKind::Modify(_) => event.paths.into_iter().map(HostEvent::Changed).collect(),
		EventKind::Remove(_) => event.paths.into_iter().map(HostEvent::Removed).collect(),
		_ => Vec::new(),
	}
}

//! Canonicalizes a wire path into an absolute on-disk path, rejecting
//! anything that could escape the storage root. `/` is the sole separator
//! on the wire; the local filesystem separator is substituted when the
//! validated path is turned into a `PathBuf`.

use std::path::{Component, Path, PathBuf};

use crate::error::SyncError;

/// Validate a wire-format relative path against a storage root.
///
/// Rejects:
/// - the empty string
/// - any path with a `..` component
/// - any path with a leading `/` (absolute on the wire)
/// - any path whose resolved absolute form is not a strict descendant of
///   `root`
///
/// Returns the absolute on-disk path on success.
pub fn validate(wire_path: &str, root: &Path) -> Result<PathBuf, SyncError> {
	if wire_path.is_empty() {
		return Err(reject(wire_path, "empty path"));
	}
	if wire_path.starts_with('/') {
		return Err(reject(wire_path, "absolute path not allowed on the wire"));
	}

	let native = PathBuf::from(wire_path.replace('/', std::path::MAIN_SEPARATOR_STR));

	for component in native.components() {
		match component {
			Component::ParentDir => return Err(reject(wire_path, "contains a '..' component")),
			Component::RootDir | Component::Prefix(_) => {
				return Err(reject(wire_path, "absolute path not allowed"))
			}
			Component::CurDir => return Err(reject(wire_path, "contains a '.' component")),
			Component::Normal(_) => {}
		}
	}

	let resolved = root.join(&native);
	if !is_strict_descendant(&resolved, root) {
		return Err(reject(wire_path, "resolves outside the storage root"));
	}

	Ok(resolved)
}

/// `resolved` must be a strict descendant of `root` — equal to `root`
/// itself does not count, since every validated path names a file, never
/// the root directory.
fn is_strict_descendant(resolved: &Path, root: &Path) -> bool {
	match resolved.strip_prefix(root) {
		Ok(rest) => rest.components().next().is_some(),
		Err(_) => false,
	}
}

fn reject(wire_path: &str, reason: &str) -> SyncError {
	SyncError::PathRejected { path: wire_path.to_string(), reason: reason.to_string() }
}

/// Whether any segment of a wire path is hidden (starts with `.`).
///
/// Hidden entries are excluded from listings and full-sync assembly.
pub fn has_hidden_segment(wire_path: &str) -> bool {
	wire_path.split('/').any(|segment| segment.starts_with('.'))
}

/// Convert a native path relative to `root` into wire form (forward slashes).
pub fn to_wire_path(relative: &Path) -> String {
	relative
		.components()
		.map(|c| c.as_os_str().to_string_lossy().into_owned())
		.collect::<Vec<_>>()
		.join("/")
}

#[cfg(test)]
mod tests {
	use super::*;
	use std::path::PathBuf;

	fn root() -> PathBuf {
		PathBuf::from("/vault/root")
	}

	#[test]
	fn accepts_simple_relative_path() {
		let p = validate("notes/a.md", &root()).unwrap();
		assert_eq!(p, PathBuf::from("/vault/root/notes/a.md"));
	}

	#[test]
	fn rejects_empty_path() {
		assert!(validate("", &root()).is_err());
	}

	#[test]
	fn rejects_parent_dir_component() {
		assert!(validate("../etc/passwd", &root()).is_err());
		assert!(validate("notes/../../escape", &root()).is_err());
	}

	#[test]
	fn rejects_absolute_path() {
		assert!(validate("/etc/passwd", &root()).is_err());
	}

	#[test]
	fn rejects_path_equal_to_root() {
		assert!(validate(".", &root()).is_err());
	}

	#[test]
	fn resolved_path_is_strict_descendant() {
		let root = root();
		let p = validate("a/b/c.md", &root).unwrap();
		assert!(p.strip_prefix(&root).unwrap().components().next().is_some());
	}

	#[test]
	fn detects_hidden_segments() {
		assert!(has_hidden_segment(".git/config"));
		assert!(has_hidden_segment("notes/.DS_Store"));
		assert!(!has_hidden_segment("notes/a.md"));
	}

	#[test]
	fn wire_path_round_trips_with_forward_slashes() {
		let rel = PathBuf::from("a").join("b").join("c.md");
		assert_eq!(to_wire_path(&rel), "a/b/c.md");
	}
}

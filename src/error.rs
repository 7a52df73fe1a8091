//! Error types for vault-sync operations
//!
//! This is the unified error type that encompasses all sync-related errors.
//! It contains direct variants for crate-wide concerns (config, I/O) and
//! nested variants for domain-specific errors, mirroring the error kinds
//! from the taxonomy: PathRejected, PayloadRejected, TooLarge, IOFailure,
//! BackPressureDrop, TransportError/Timeout, Unauthorized. Conflict is
//! handled entirely inside the coordinator and never surfaces as a
//! `SyncError` variant.

use std::error::Error;
use std::fmt;
use std::io;

/// Helper to reduce `Box::new()` boilerplate when wrapping nested errors.
#[inline]
pub fn boxed_error<E: Error + Send + Sync + 'static>(e: E) -> Box<dyn Error + Send + Sync> {
	Box::new(e)
}

/// Crate-wide error type.
#[derive(Debug)]
pub enum SyncError {
	/// Path failed validation (traversal, absolute, empty).
	PathRejected { path: String, reason: String },

	/// A decoded message envelope did not match any known payload shape.
	PayloadRejected { message: String },

	/// A write exceeded the configured maximum file size.
	TooLarge { size: usize, max: usize },

	/// Disk read/write failure.
	Io(io::Error),

	/// Invalid configuration at startup.
	InvalidConfig { message: String },

	/// Unauthorized token presented at handshake.
	Unauthorized,

	/// Storage layer error (nested).
	Store(StoreError),

	/// Tombstone registry error (nested).
	Tombstone(TombstoneError),

	/// Connection hub error (nested).
	Hub(HubError),

	/// Generic error message, used sparingly at integration seams.
	Other { message: String },
}

impl fmt::Display for SyncError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			SyncError::PathRejected { path, reason } => {
				write!(f, "path rejected: {} ({})", path, reason)
			}
			SyncError::PayloadRejected { message } => write!(f, "payload rejected: {}", message),
			SyncError::TooLarge { size, max } => {
				write!(f, "write of {} bytes exceeds max of {} bytes", size, max)
			}
			SyncError::Io(e) => write!(f, "I/O error: {}", e),
			SyncError::InvalidConfig { message } => write!(f, "invalid configuration: {}", message),
			SyncError::Unauthorized => write!(f, "unauthorized"),
			SyncError::Store(e) => write!(f, "storage error: {}", e),
			SyncError::Tombstone(e) => write!(f, "tombstone registry error: {}", e),
			SyncError::Hub(e) => write!(f, "connection hub error: {}", e),
			SyncError::Other { message } => write!(f, "{}", message),
		}
	}
}

impl Error for SyncError {}

impl From<io::Error> for SyncError {
	fn from(e: io::Error) -> Self {
		SyncError::Io(e)
	}
}

impl From<String> for SyncError {
	fn from(e: String) -> Self {
		SyncError::Other { message: e }
	}
}

impl From<StoreError> for SyncError {
	fn from(e: StoreError) -> Self {
		SyncError::Store(e)
	}
}

impl From<TombstoneError> for SyncError {
	fn from(e: TombstoneError) -> Self {
		SyncError::Tombstone(e)
	}
}

impl From<HubError> for SyncError {
	fn from(e: HubError) -> Self {
		SyncError::Hub(e)
	}
}

/// Content Store errors.
#[derive(Debug)]
pub enum StoreError {
	/// Path validation failed below the store layer (defense in depth).
	InvalidPath { path: String },

	/// Write exceeded `max_file_size_bytes`.
	TooLarge { size: usize, max: usize },

	/// Underlying filesystem operation failed.
	Io { path: String, source: io::Error },
}

impl fmt::Display for StoreError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			StoreError::InvalidPath { path } => write!(f, "invalid path: {}", path),
			StoreError::TooLarge { size, max } => {
				write!(f, "{} bytes exceeds max of {} bytes", size, max)
			}
			StoreError::Io { path, source } => write!(f, "I/O error on {}: {}", path, source),
		}
	}
}

impl Error for StoreError {}

/// Tombstone Registry errors.
#[derive(Debug)]
pub enum TombstoneError {
	/// Durable log could not be read or written.
	Io(io::Error),

	/// A logged record could not be decoded.
	Corrupted { line: usize, message: String },
}

impl fmt::Display for TombstoneError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			TombstoneError::Io(e) => write!(f, "tombstone log I/O error: {}", e),
			TombstoneError::Corrupted { line, message } => {
				write!(f, "corrupted tombstone log at line {}: {}", line, message)
			}
		}
	}
}

impl Error for TombstoneError {}

impl From<io::Error> for TombstoneError {
	fn from(e: io::Error) -> Self {
		TombstoneError::Io(e)
	}
}

/// Connection Hub errors.
#[derive(Debug)]
pub enum HubError {
	/// The destination device has no registered session.
	NoSuchDevice { device_id: String },

	/// The destination session's send queue was full; message dropped.
	BackPressureDrop { device_id: String },
}

impl fmt::Display for HubError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			HubError::NoSuchDevice { device_id } => {
				write!(f, "no session registered for device {}", device_id)
			}
			HubError::BackPressureDrop { device_id } => {
				write!(f, "send queue full for device {}, message dropped", device_id)
			}
		}
	}
}

impl Error for HubError {}

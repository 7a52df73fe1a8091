//! Wire message envelopes.
//!
//! The wire uses a tagged envelope with `type` as the discriminant: a sum
//! type / tagged variant per payload, validated on decode rather than
//! carried through the internal API as a loose `Value`. Each direction
//! gets its own enum so the type system, not a runtime match on a string,
//! enforces which messages a client may send and which a server may send.

use serde::{Deserialize, Serialize};

use crate::vector_clock::VectorClock;

/// A file's metadata as carried in `full_sync` payloads and admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
	pub path: String,
	pub hash: String,
	pub size: u64,
	pub mtime_ms: u64,
}

/// A deletion marker as carried in `full_sync` payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TombstoneRecord {
	pub path: String,
	pub deleted_at_s: u64,
	pub deleted_by_device: String,
	pub vector_clock: VectorClock,
	pub ttl_expires_at_s: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChangePayload {
	pub path: String,
	pub content_b64: String,
	pub mtime_ms: u64,
	pub hash: String,
	#[serde(skip_serializing_if = "Option::is_none", default)]
	pub previous_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDeletePayload {
	pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMovePayload {
	pub old_path: String,
	pub new_path: String,
	pub content_b64: String,
	pub mtime_ms: u64,
	pub hash: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilePayload {
	pub path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullSyncPayload {
	pub files: Vec<FileRecord>,
	pub tombstones: Vec<TombstoneRecord>,
	pub vector_clock: VectorClock,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPayload {
	pub path: String,
	pub server_version: FileRecord,
	pub client_version: FileChangePayload,
	pub resolution: String,
}

/// Client → Server envelope. Internally tagged on `type`, with the
/// payload fields flattened into the same JSON object (`{ type, device_id,
/// timestamp_ms, vector_clock, payload }`) while staying a single
/// `serde`-verified enum instead of a hand-checked `Value`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
	FileChange {
		device_id: String,
		timestamp_ms: u64,
		vector_clock: VectorClock,
		payload: FileChangePayload,
	},
	FileDelete {
		device_id: String,
		timestamp_ms: u64,
		vector_clock: VectorClock,
		payload: FileDeletePayload,
	},
	FileMove {
		device_id: String,
		timestamp_ms: u64,
		vector_clock: VectorClock,
		payload: FileMovePayload,
	},
	RequestFullSync {
		device_id: String,
		timestamp_ms: u64,
		vector_clock: VectorClock,
	},
	RequestFile {
		device_id: String,
		timestamp_ms: u64,
		vector_clock: VectorClock,
		payload: RequestFilePayload,
	},
	Ping {
		device_id: String,
		timestamp_ms: u64,
		vector_clock: VectorClock,
	},
}

impl ClientMessage {
	pub fn device_id(&self) -> &str {
		match self {
			ClientMessage::FileChange { device_id, .. }
			| ClientMessage::FileDelete { device_id, .. }
			| ClientMessage::FileMove { device_id, .. }
			| ClientMessage::RequestFullSync { device_id, .. }
			| ClientMessage::RequestFile { device_id, .. }
			| ClientMessage::Ping { device_id, .. } => device_id,
		}
	}

	pub fn vector_clock(&self) -> &VectorClock {
		match self {
			ClientMessage::FileChange { vector_clock, .. }
			| ClientMessage::FileDelete { vector_clock, .. }
			| ClientMessage::FileMove { vector_clock, .. }
			| ClientMessage::RequestFullSync { vector_clock, .. }
			| ClientMessage::RequestFile { vector_clock, .. }
			| ClientMessage::Ping { vector_clock, .. } => vector_clock,
		}
	}
}

/// Server → Client envelope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
	FileChanged { origin_device: String, payload: FileChangePayload },
	FileDeleted { origin_device: String, payload: FileDeletePayload },
	FileMoved { origin_device: String, payload: FileMovePayload },
	FullSync { origin_device: String, payload: FullSyncPayload },
	Conflict { origin_device: String, payload: ConflictPayload },
	Pong { origin_device: String },
}

impl ServerMessage {
	pub fn origin_device(&self) -> &str {
		match self {
			ServerMessage::FileChanged { origin_device, .. }
			| ServerMessage::FileDeleted { origin_device, .. }
			| ServerMessage::FileMoved { origin_device, .. }
			| ServerMessage::FullSync { origin_device, .. }
			| ServerMessage::Conflict { origin_device, .. }
			| ServerMessage::Pong { origin_device } => origin_device,
		}
	}

	/// Standard origin tag used when a reply is synthesized by the server
	/// itself rather than relayed from another device.
	pub const SERVER_ORIGIN: &'static str = "server";
}

/// Base64-encode file bytes for wire transport (standard alphabet, padded).
pub fn encode_content(bytes: &[u8]) -> String {
	use base64::engine::{general_purpose::STANDARD, Engine as _};
	STANDARD.encode(bytes)
}

/// Decode base64 file bytes from the wire.
pub fn decode_content(b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
	use base64::engine::{general_purpose::STANDARD, Engine as _};
	STANDARD.decode(b64)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn base64_round_trips_arbitrary_bytes() {
		let samples: &[&[u8]] = &[b"", b"hello", &[0u8, 1, 2, 255, 254], b"\0\0\0"];
		for sample in samples {
			let encoded = encode_content(sample);
			let decoded = decode_content(&encoded).unwrap();
			assert_eq!(&decoded, sample);
		}
	}

	#[test]
	fn client_message_tags_as_snake_case_type() {
		let msg = ClientMessage::Ping {
			device_id: "d1".into(),
			timestamp_ms: 0,
			vector_clock: VectorClock::new(),
		};
		let json = serde_json::to_value(&msg).unwrap();
		assert_eq!(json["type"], "ping");
		assert_eq!(json["device_id"], "d1");
	}

	#[test]
	fn file_change_payload_round_trips_through_json() {
		let msg = ClientMessage::FileChange {
			device_id: "d1".into(),
			timestamp_ms: 1_000_000,
			vector_clock: VectorClock::new(),
			payload: FileChangePayload {
				path: "notes/a.md".into(),
				content_b64: encode_content(b"hello"),
				mtime_ms: 1_000_000,
				hash: "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824".into(),
				previous_hash: None,
			},
		};
		let json = serde_json::to_string(&msg).unwrap();
		let decoded: ClientMessage = serde_json::from_str(&json).unwrap();
		match decoded {
			ClientMessage::FileChange { payload, .. } => {
				assert_eq!(payload.path, "notes/a.md");
			}
			_ => panic!("wrong variant decoded"),
		}
	}

	#[test]
	fn unknown_type_fails_to_decode_as_payload_rejected() {
		let json = r#"{"type":"not_a_real_type","device_id":"d1"}"#;
		assert!(serde_json::from_str::<ClientMessage>(json).is_err());
	}
}

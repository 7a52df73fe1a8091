//! Bearer-token authentication for both the WebSocket handshake and the
//! HTTP admin surface. A single master token authenticates as the
//! `"master"` identity; additional per-device tokens can be issued and
//! revoked at runtime and authenticate as their device id.

use std::collections::HashMap;

use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::SyncError;

/// The authenticated identity behind a presented token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
	Master,
	Device(String),
}

struct DeviceToken {
	device_id: String,
}

pub struct AuthGate {
	master_token: String,
	device_tokens: RwLock<HashMap<String, DeviceToken>>,
}

impl AuthGate {
	pub fn new(master_token: impl Into<String>) -> Self {
		AuthGate { master_token: master_token.into(), device_tokens: RwLock::new(HashMap::new()) }
	}

	/// Validate a bearer token, returning the identity it authenticates as.
	pub async fn validate(&self, token: &str) -> Result<Identity, SyncError> {
		if constant_time_eq(token.as_bytes(), self.master_token.as_bytes()) {
			return Ok(Identity::Master);
		}
		let tokens = self.device_tokens.read().await;
		for (candidate, entry) in tokens.iter() {
			if constant_time_eq(token.as_bytes(), candidate.as_bytes()) {
				return Ok(Identity::Device(entry.device_id.clone()));
			}
		}
		Err(SyncError::Unauthorized)
	}

	/// Issue a fresh random token for `device_id`, replacing any prior
	/// token issued to the same device.
	pub async fn issue(&self, device_id: &str) -> String {
		let token = format!("dvt_{}", Uuid::new_v4().simple());
		let mut tokens = self.device_tokens.write().await;
		tokens.retain(|_, entry| entry.device_id != device_id);
		tokens.insert(token.clone(), DeviceToken { device_id: device_id.to_string() });
		token
	}

	/// List the device ids that currently hold an issued token, sorted.
	pub async fn list_devices(&self) -> Vec<String> {
		let tokens = self.device_tokens.read().await;
		let mut devices: Vec<_> = tokens.values().map(|entry| entry.device_id.clone()).collect();
		devices.sort();
		devices.dedup();
		devices
	}

	/// Revoke every token issued to `device_id`. Returns `true` if any
	/// token was removed.
	pub async fn revoke(&self, device_id: &str) -> bool {
		let mut tokens = self.device_tokens.write().await;
		let before = tokens.len();
		tokens.retain(|_, entry| entry.device_id != device_id);
		tokens.len() != before
	}
}

/// Constant-time byte comparison to avoid leaking token length/prefix via
/// timing. Still short-circuits on length mismatch, which is not secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
	if a.len() != b.len() {
		return false;
	}
	let mut diff = 0u8;
	for (x, y) in a.iter().zip(b.iter()) {
		diff |= x ^ y;
	}
	diff == 0
}

#[cfg(test)]
mod tests {
	use super::*;

	#[tokio::test]
	async fn master_token_authenticates_as_master() {
		let gate = AuthGate::new("topsecret");
		assert_eq!(gate.validate("topsecret").await.unwrap(), Identity::Master);
	}

	#[tokio::test]
	async fn unknown_token_is_unauthorized() {
		let gate = AuthGate::new("topsecret");
		assert!(matches!(gate.validate("nope").await, Err(SyncError::Unauthorized)));
	}

	#[tokio::test]
	async fn issued_token_authenticates_as_its_device() {
		let gate = AuthGate::new("topsecret");
		let token = gate.issue("laptop-1").await;
		assert_eq!(gate.validate(&token).await.unwrap(), Identity::Device("laptop-1".into()));
	}

	#[tokio::test]
	async fn reissuing_replaces_the_previous_token() {
		let gate = AuthGate::new("topsecret");
		let first = gate.issue("laptop-1").await;
		let second = gate.issue("laptop-1").await;
		assert!(gate.validate(&first).await.is_err());
		assert_eq!(gate.validate(&second).await.unwrap(), Identity::Device("laptop-1".into()));
	}

	#[tokio::test]
	async fn revoke_invalidates_the_token() {
		let gate = AuthGate::new("topsecret");
		let token = gate.issue("laptop-1").await;
		assert!(gate.revoke("laptop-1").await);
		assert!(gate.validate(&token).await.is_err());
	}

	#[tokio::test]
	async fn revoke_unknown_device_is_false() {
		let gate = AuthGate::new("topsecret");
		assert!(!gate.revoke("ghost").await);
	}

	#[tokio::test]
	async fn list_devices_is_sorted_and_deduplicated() {
		let gate = AuthGate::new("topsecret");
		gate.issue("b-device").await;
		gate.issue("a-device").await;
		assert_eq!(gate.list_devices().await, vec!["a-device".to_string(), "b-device".to_string()]);
	}
}

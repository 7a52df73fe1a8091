#![allow(dead_code)]

//! Unified configuration for vault-sync.
//!
//! The configuration follows a priority chain, highest wins:
//! 1. Built-in defaults (`Config::default()`).
//! 2. YAML config file (`--config` flag or `./vault-sync.yaml`).
//! 3. Environment variables (`VAULT_SYNC_*` prefix; `VAULT_SYNC_TOKEN`
//!    specifically overrides `auth.master_token`).
//! 4. CLI flags (server port / storage path), highest priority.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::SyncError;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	pub server: ServerConfig,
	pub storage: StorageConfig,
	pub auth: AuthConfig,
	pub sync: SyncConfig,
	pub tombstone: TombstoneConfig,
	pub log: LogConfig,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			server: ServerConfig::default(),
			storage: StorageConfig::default(),
			auth: AuthConfig::default(),
			sync: SyncConfig::default(),
			tombstone: TombstoneConfig::default(),
			log: LogConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
	pub port: u16,
	pub bind_addr: String,
	pub tls: TlsConfig,
}

impl Default for ServerConfig {
	fn default() -> Self {
		ServerConfig { port: 7878, bind_addr: "0.0.0.0".to_string(), tls: TlsConfig::default() }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
	pub enabled: bool,
	pub cert: Option<PathBuf>,
	pub key: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
	/// Root of the synchronized document tree.
	pub path: PathBuf,

	/// Directory for vault-sync's own runtime state (the tombstone log).
	pub state_dir: PathBuf,
}

impl Default for StorageConfig {
	fn default() -> Self {
		StorageConfig { path: PathBuf::from("./vault-data"), state_dir: PathBuf::from("./.vault-sync-state") }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AuthConfig {
	/// Master bearer token. Required at startup unless `VAULT_SYNC_TOKEN`
	/// supplies one.
	pub master_token: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	pub conflict_resolution: ConflictResolution,
	pub debounce_ms: u64,
	pub max_file_size_mb: usize,
	pub empty_write_guard: bool,
}

impl Default for SyncConfig {
	fn default() -> Self {
		SyncConfig {
			conflict_resolution: ConflictResolution::LastWriteWins,
			debounce_ms: 500,
			max_file_size_mb: 50,
			empty_write_guard: true,
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TombstoneConfig {
	pub ttl_days: u64,
}

impl Default for TombstoneConfig {
	fn default() -> Self {
		TombstoneConfig { ttl_days: 30 }
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
	pub level: String,
	pub format: LogFormat,
}

impl Default for LogConfig {
	fn default() -> Self {
		LogConfig { level: "info".to_string(), format: LogFormat::Pretty }
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
	#[default]
	LastWriteWins,
	Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum LogFormat {
	Json,
	#[default]
	Pretty,
}

impl TombstoneConfig {
	pub fn ttl_secs(&self) -> u64 {
		self.ttl_days * 86_400
	}
}

impl Config {
	/// Load defaults, overlay a YAML file if present at `path`, then overlay
	/// `VAULT_SYNC_*` environment variables, then validate.
	pub fn load(path: Option<&std::path::Path>) -> Result<Config, SyncError> {
		let mut config = Config::default();

		let yaml_path = path.map(PathBuf::from).unwrap_or_else(|| PathBuf::from("./vault-sync.yaml"));
		if yaml_path.exists() {
			let contents = std::fs::read_to_string(&yaml_path)?;
			config = serde_yaml::from_str(&contents).map_err(|e| SyncError::InvalidConfig {
				message: format!("failed to parse {}: {}", yaml_path.display(), e),
			})?;
		}

		config.apply_env_overlay();
		config.validate()?;
		Ok(config)
	}

	fn apply_env_overlay(&mut self) {
		if let Ok(token) = std::env::var("VAULT_SYNC_TOKEN") {
			self.auth.master_token = token;
		}
		if let Ok(port) = std::env::var("VAULT_SYNC_SERVER_PORT") {
			if let Ok(port) = port.parse() {
				self.server.port = port;
			}
		}
		if let Ok(path) = std::env::var("VAULT_SYNC_STORAGE_PATH") {
			self.storage.path = PathBuf::from(path);
		}
		if let Ok(level) = std::env::var("VAULT_SYNC_LOG_LEVEL") {
			self.log.level = level;
		}
	}

	fn validate(&self) -> Result<(), SyncError> {
		if self.auth.master_token.is_empty() {
			return Err(SyncError::InvalidConfig {
				message: "auth.master_token is empty; set it in the config file or VAULT_SYNC_TOKEN".to_string(),
			});
		}
		if self.server.tls.enabled && (self.server.tls.cert.is_none() || self.server.tls.key.is_none()) {
			return Err(SyncError::InvalidConfig {
				message: "server.tls.enabled is true but cert and/or key is missing".to_string(),
			});
		}
		std::fs::create_dir_all(&self.storage.path).map_err(|e| SyncError::InvalidConfig {
			message: format!("cannot create storage.path {}: {}", self.storage.path.display(), e),
		})?;
		Ok(())
	}
}

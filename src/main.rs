//! `vault-sync` CLI: run the server, run the reference client adapter
//! against a running server, or manage device tokens through the HTTP
//! admin surface. See §4.11.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use url::Url;
use uuid::Uuid;

use vault_sync::client::host::{self, LocalFilesystem};
use vault_sync::client::{transport, ClientCoordinator, ClientNotice};
use vault_sync::config::Config;
use vault_sync::logging::{self, info, warn};

#[derive(Parser)]
#[command(name = "vault-sync", version, about = "Real-time multi-device sync server and client")]
struct Cli {
	/// Path to a YAML config file. Defaults to `./vault-sync.yaml` if present.
	#[arg(short, long, global = true)]
	config: Option<PathBuf>,

	#[command(subcommand)]
	command: Commands,
}

#[derive(Subcommand)]
enum Commands {
	/// Run the sync server (Hub + HTTP admin surface + WebSocket accept loop).
	Serve {
		#[arg(long)]
		port: Option<u16>,
		#[arg(long)]
		storage: Option<PathBuf>,
	},

	/// Run the reference host adapter (§4.13): watch a directory and sync
	/// it against a running server.
	Client {
		#[arg(long)]
		url: Url,
		#[arg(long)]
		token: String,
		#[arg(long = "device-id")]
		device_id: Option<String>,
		#[arg(long)]
		watch: PathBuf,
	},

	/// Thin wrappers over the HTTP admin surface's device-token routes.
	Token {
		#[command(subcommand)]
		action: TokenAction,

		/// Base URL of a running server, e.g. http://localhost:7878
		#[arg(long)]
		url: Url,

		/// Master token. Falls back to VAULT_SYNC_TOKEN.
		#[arg(long = "admin-token", env = "VAULT_SYNC_TOKEN")]
		admin_token: String,
	},
}

#[derive(Subcommand)]
enum TokenAction {
	Issue {
		#[arg(long = "device-id")]
		device_id: String,
		#[arg(long)]
		name: Option<String>,
	},
	List,
	Revoke {
		#[arg(long = "device-id")]
		device_id: String,
	},
}

#[tokio::main]
async fn main() -> ExitCode {
	let cli = Cli::parse();

	let result = match cli.command {
		Commands::Serve { port, storage } => run_serve(cli.config.as_deref(), port, storage).await,
		Commands::Client { url, token, device_id, watch } => run_client(url, token, device_id, watch).await,
		Commands::Token { action, url, admin_token } => run_token(action, url, admin_token).await,
	};

	match result {
		Ok(()) => ExitCode::SUCCESS,
		Err(e) => {
			eprintln!("vault-sync: {}", e);
			ExitCode::FAILURE
		}
	}
}

async fn run_serve(
	config_path: Option<&std::path::Path>,
	port: Option<u16>,
	storage: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
	let mut config = Config::load(config_path)?;
	logging::init_tracing(&config.log.level);

	if let Some(port) = port {
		config.server.port = port;
	}
	if let Some(storage) = storage {
		config.storage.path = storage;
	}

	vault_sync::server::serve(config).await?;
	Ok(())
}

async fn run_client(
	url: Url,
	token: String,
	device_id: Option<String>,
	watch_dir: PathBuf,
) -> Result<(), Box<dyn std::error::Error>> {
	logging::init_tracing("info");
	std::fs::create_dir_all(&watch_dir)?;

	let device_id = device_id.unwrap_or_else(|| format!("device-{}", &Uuid::new_v4().simple().to_string()[..8]));

	let filesystem: Arc<dyn vault_sync::client::HostFilesystem> = Arc::new(LocalFilesystem::new(&watch_dir));
	let (outbound_tx, outbound_rx) = tokio::sync::mpsc::channel(256);
	let (notice_tx, mut notice_rx) = tokio::sync::mpsc::unbounded_channel();

	let coordinator =
		ClientCoordinator::new(filesystem, device_id.clone(), Duration::from_millis(500), outbound_tx, notice_tx);

	let connect_url = transport::connection_url(&url, &token, Some(&device_id))?;
	let _disconnect = transport::run(connect_url, Arc::clone(&coordinator), outbound_rx).await;

	coordinator.request_full_sync().await;

	let mut watch_events = host::watch(watch_dir.clone());
	let notices = tokio::spawn(async move {
		while let Some(notice) = notice_rx.recv().await {
			match notice {
				ClientNotice::Connected => info!("connected"),
				ClientNotice::Disconnected => warn!("disconnected"),
				ClientNotice::ReconnectingIn { seconds } => info!(seconds, "reconnecting"),
				ClientNotice::SyncFailed { reason } => warn!(reason, "sync failed"),
				ClientNotice::ConflictDetected { path } => warn!(path, "conflict detected"),
				ClientNotice::SyncComplete { files } => info!(files, "sync complete"),
			}
		}
	});

	loop {
		tokio::select! {
			_ = tokio::signal::ctrl_c() => {
				info!("shutting down client");
				break;
			}
			event = watch_events.recv() => {
				match event {
					None => break,
					Some(host::HostEvent::Changed(path)) => {
						if let Some(wire) = relative_wire_path(&watch_dir, &path) {
							coordinator.queue_change(wire).await;
						}
					}
					Some(host::HostEvent::Removed(path)) => {
						if let Some(wire) = relative_wire_path(&watch_dir, &path) {
							coordinator.queue_delete(wire).await;
						}
					}
					Some(host::HostEvent::Moved { from, to }) => {
						if let (Some(old), Some(new)) = (relative_wire_path(&watch_dir, &from), relative_wire_path(&watch_dir, &to)) {
							coordinator.queue_move(old, new).await;
						}
					}
				}
			}
		}
	}

	notices.abort();
	Ok(())
}

fn relative_wire_path(root: &std::path::Path, absolute: &std::path::Path) -> Option<String> {
	let relative = absolute.strip_prefix(root).ok()?;
	Some(vault_sync::path::to_wire_path(relative))
}

async fn run_token(action: TokenAction, base_url: Url, admin_token: String) -> Result<(), Box<dyn std::error::Error>> {
	logging::init_tracing("warn");
	let http = reqwest::Client::new();

	match action {
		TokenAction::Issue { device_id, name } => {
			let resp = http
				.post(base_url.join("/api/token")?)
				.bearer_auth(&admin_token)
				.json(&serde_json::json!({ "device_id": device_id, "name": name }))
				.send()
				.await?
				.error_for_status()?;
			let body: serde_json::Value = resp.json().await?;
			println!("{}", serde_json::to_string_pretty(&body)?);
		}
		TokenAction::List => {
			let resp = http
				.get(base_url.join("/api/devices")?)
				.bearer_auth(&admin_token)
				.send()
				.await?
				.error_for_status()?;
			let body: serde_json::Value = resp.json().await?;
			println!("{}", serde_json::to_string_pretty(&body)?);
		}
		TokenAction::Revoke { device_id } => {
			let resp = http
				.delete(base_url.join("/api/token")?)
				.bearer_auth(&admin_token)
				.json(&serde_json::json!({ "device_id": device_id }))
				.send()
				.await?
				.error_for_status()?;
			let body: serde_json::Value = resp.json().await?;
			println!("{}", serde_json::to_string_pretty(&body)?);
		}
	}

	Ok(())
}
